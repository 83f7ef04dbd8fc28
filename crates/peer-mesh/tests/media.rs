//! Local capture lifecycle and mute control across links

mod harness;

use harness::{init_logging, join, join_with, settle, ROOM};
use peer_mesh::{
    Error, LocalRelay, MediaError, MemoryNetwork, MeshConfig, MeshEvent, MeshSession, Participant,
    StaticCapture,
};
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn test_busy_device_aborts_join() {
    init_logging();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let device = StaticCapture::failing(MediaError::DeviceBusy);
    let session = MeshSession::new(
        MeshConfig::default(),
        Arc::new(relay.client()),
        network.backend("alice"),
        device.clone(),
    )
    .unwrap();

    let err = session
        .join(ROOM, Participant::new("alice", "Alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Media(MediaError::DeviceBusy)));
    assert!(relay.members(ROOM).is_empty());
    assert_eq!(device.stop_count(), 0);

    assert!(!session.is_joined().await);
}

#[tokio::test(start_paused = true)]
async fn test_one_capture_shared_by_all_links() {
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();

    let mut alice = join(&relay, &network, "alice").await;
    let _bob = join(&relay, &network, "bob").await;
    let _carol = join(&relay, &network, "carol").await;
    alice.wait_connected("bob").await;
    alice.wait_connected("carol").await;
    assert_eq!(alice.device.capture_count(), 1);
    assert_eq!(alice.device.stop_count(), 0);

    alice.session.leave().await.unwrap();
    assert_eq!(alice.device.stop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mute_applies_to_every_link() {
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();

    let mut alice = join(&relay, &network, "alice").await;
    let _bob = join(&relay, &network, "bob").await;
    let _carol = join(&relay, &network, "carol").await;
    alice.wait_connected("bob").await;
    alice.wait_connected("carol").await;
    assert_eq!(network.outgoing_enabled("alice", "bob"), Some(true));

    alice.session.set_muted(true).await.unwrap();
    settle().await;
    assert!(alice.session.is_muted().await);
    assert_eq!(network.outgoing_enabled("alice", "bob"), Some(false));
    assert_eq!(network.outgoing_enabled("alice", "carol"), Some(false));

    alice.session.set_muted(false).await.unwrap();
    settle().await;
    assert_eq!(network.outgoing_enabled("alice", "bob"), Some(true));
    assert_eq!(network.outgoing_enabled("alice", "carol"), Some(true));

    // Muting never renegotiates
    let stats = network.stats();
    assert_eq!(stats.offers_from("alice"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_muted() {
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let config = MeshConfig {
        start_muted: true,
        ..Default::default()
    };

    let mut alice = join_with(&relay, &network, "alice", config).await;
    let _bob = join(&relay, &network, "bob").await;
    alice.wait_connected("bob").await;

    assert!(alice.session.is_muted().await);
    assert_eq!(network.outgoing_enabled("alice", "bob"), Some(false));
    assert_eq!(network.outgoing_enabled("bob", "alice"), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_audio_disabled_skips_capture() {
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();

    let mut alice = join_with(&relay, &network, "alice", MeshConfig::default().without_audio()).await;
    let mut bob = join(&relay, &network, "bob").await;
    let mut alice_events = alice.wait_connected("bob").await;
    let mut bob_events = bob.wait_connected("alice").await;
    settle().await;
    alice_events.extend(alice.drain());
    bob_events.extend(bob.drain());

    assert_eq!(alice.device.capture_count(), 0);
    assert!(!bob_events
        .iter()
        .any(|e| matches!(e, MeshEvent::RemoteStream { .. })));
    // Alice still hears bob
    let heard = alice_events
        .iter()
        .any(|e| matches!(e, MeshEvent::RemoteStream { peer_id, .. } if peer_id == "bob"));
    assert!(heard);

    alice.session.leave().await.unwrap();
    assert_eq!(alice.device.stop_count(), 0);
}
