//! Shared helpers for whole-session tests over `LocalRelay` and `MemoryNetwork`

#![allow(dead_code)]

use peer_mesh::{
    DisconnectReason, LinkState, LocalRelay, MemoryNetwork, MeshConfig, MeshEvent, MeshSession,
    Participant, StaticCapture,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

pub const ROOM: &str = "room-1";

/// Install a test subscriber once; `RUST_LOG` overrides the default filter
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peer_mesh=warn")),
        )
        .with_test_writer()
        .try_init();
}

pub struct Node {
    pub id: String,
    pub session: MeshSession,
    pub events: UnboundedReceiver<MeshEvent>,
    pub device: Arc<StaticCapture>,
}

impl Node {
    /// Wait for an event matching `pred`; returns everything received up to it
    pub async fn wait_for(&mut self, pred: impl FnMut(&MeshEvent) -> bool) -> Vec<MeshEvent> {
        wait_for(&mut self.events, pred).await
    }

    pub async fn wait_connected(&mut self, peer: &str) -> Vec<MeshEvent> {
        self.wait_for(|e| matches!(e, MeshEvent::PeerConnected { peer_id } if peer_id == peer))
            .await
    }

    pub async fn wait_disconnected(&mut self, peer: &str) -> (DisconnectReason, Vec<MeshEvent>) {
        let seen = self
            .wait_for(|e| matches!(e, MeshEvent::PeerDisconnected { peer_id, .. } if peer_id == peer))
            .await;
        let reason = match seen.last() {
            Some(MeshEvent::PeerDisconnected { reason, .. }) => *reason,
            other => panic!("unexpected final event {:?}", other),
        };
        (reason, seen)
    }

    /// Everything already queued, without waiting
    pub fn drain(&mut self) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub async fn join(relay: &Arc<LocalRelay>, network: &Arc<MemoryNetwork>, id: &str) -> Node {
    join_with(relay, network, id, MeshConfig::default()).await
}

pub async fn join_with(
    relay: &Arc<LocalRelay>,
    network: &Arc<MemoryNetwork>,
    id: &str,
    config: MeshConfig,
) -> Node {
    init_logging();
    let device = StaticCapture::working();
    let session = MeshSession::new(
        config,
        Arc::new(relay.client()),
        network.backend(id),
        device.clone(),
    )
    .expect("valid config");
    let events = session.take_events().expect("fresh session");
    session
        .join(ROOM, Participant::new(id, id.to_uppercase()))
        .await
        .expect("join");
    Node {
        id: id.to_string(),
        session,
        events,
        device,
    }
}

/// Let spawned link workers run to completion of their queued work
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Poll until every link of `node` has an open data channel
pub async fn wait_channels_open(node: &Node) {
    let opened = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let peers = node.session.peers().await;
            if !peers.is_empty() && peers.iter().all(|p| p.data_channel_open) {
                return;
            }
            settle().await;
        }
    })
    .await;
    assert!(opened.is_ok(), "data channels of {} never opened", node.id);
}

pub async fn wait_for(
    events: &mut UnboundedReceiver<MeshEvent>,
    mut pred: impl FnMut(&MeshEvent) -> bool,
) -> Vec<MeshEvent> {
    let mut seen = Vec::new();
    let found = tokio::time::timeout(Duration::from_secs(3_600), async {
        while let Some(event) = events.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    match found {
        Ok(true) => seen,
        Ok(false) => panic!("event stream ended; saw {:?}", seen),
        Err(_) => panic!("timed out waiting for event; saw {:?}", seen),
    }
}

/// Number of times `peer`'s link entered `state` in `events`
pub fn entered(events: &[MeshEvent], peer: &str, state: LinkState) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(e, MeshEvent::LinkStateChanged { peer_id, state: s } if peer_id == peer && *s == state)
        })
        .count()
}
