//! In-process presence/broadcast relay
//!
//! Mirrors the behaviour of a hosted relay closely enough to drive whole
//! sessions inside one process: a joiner receives a `sync` snapshot, other
//! members receive `join`, broadcasts and signals fan out to every other
//! member, and `disconnect` produces `leave`. Test hooks allow a member to
//! vanish without a `leave` and force a roster `sync`.

use super::{Envelope, PresenceEvent, RelayEvent, SignalingTransport};
use crate::participant::Participant;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Member {
    participant: Participant,
    client_id: u64,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Default)]
struct Room {
    members: Vec<Member>,
}

impl Room {
    fn roster(&self) -> Vec<Participant> {
        self.members.iter().map(|m| m.participant.clone()).collect()
    }

    fn send_to_others(&self, client_id: u64, event: &RelayEvent) {
        for member in self.members.iter().filter(|m| m.client_id != client_id) {
            // A closed receiver just means that member's session ended
            let _ = member.tx.send(event.clone());
        }
    }
}

/// Simple in-memory relay shared by several [`LocalRelayClient`]s
#[derive(Default)]
pub struct LocalRelay {
    rooms: Mutex<HashMap<String, Room>>,
    next_client: AtomicU64,
    echo_broadcasts: bool,
}

impl LocalRelay {
    /// Create a relay that never echoes broadcasts to their sender
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a relay that also delivers broadcasts back to their sender
    pub fn with_echo() -> Arc<Self> {
        Arc::new(Self {
            echo_broadcasts: true,
            ..Self::default()
        })
    }

    /// Create a client handle for one participant
    pub fn client(self: &Arc<Self>) -> LocalRelayClient {
        LocalRelayClient {
            relay: Arc::clone(self),
            client_id: self.next_client.fetch_add(1, Ordering::Relaxed) + 1,
            joined: Mutex::new(None),
        }
    }

    /// Current roster of a session
    pub fn members(&self, session_id: &str) -> Vec<Participant> {
        self.rooms
            .lock()
            .get(session_id)
            .map(Room::roster)
            .unwrap_or_default()
    }

    /// Remove a member without telling anyone, as when a client crashes
    ///
    /// The member's event stream is closed.
    pub fn remove_silently(&self, session_id: &str, participant_id: &str) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(session_id) else {
            return false;
        };
        let before = room.members.len();
        room.members.retain(|m| m.participant.id != participant_id);
        debug!(session_id, participant_id, "Relay dropped member silently");
        room.members.len() != before
    }

    /// Send the current roster to every member of a session
    pub fn resync(&self, session_id: &str) {
        let rooms = self.rooms.lock();
        if let Some(room) = rooms.get(session_id) {
            let event = RelayEvent::Presence(PresenceEvent::Sync {
                members: room.roster(),
            });
            room.send_to_others(0, &event);
        }
    }

    /// Deliver an arbitrary event to one member
    pub fn inject(&self, session_id: &str, participant_id: &str, event: RelayEvent) -> bool {
        let rooms = self.rooms.lock();
        rooms
            .get(session_id)
            .and_then(|room| {
                room.members
                    .iter()
                    .find(|m| m.participant.id == participant_id)
            })
            .map(|m| m.tx.send(event).is_ok())
            .unwrap_or(false)
    }
}

/// One participant's connection to a [`LocalRelay`]
pub struct LocalRelayClient {
    relay: Arc<LocalRelay>,
    client_id: u64,
    joined: Mutex<Option<String>>,
}

impl LocalRelayClient {
    fn session(&self) -> Result<String> {
        self.joined
            .lock()
            .clone()
            .ok_or_else(|| Error::SignalingError("relay client is not connected".to_string()))
    }

    fn fan_out(&self, event: RelayEvent, include_self: bool) -> Result<()> {
        let session_id = self.session()?;
        let rooms = self.relay.rooms.lock();
        let room = rooms
            .get(&session_id)
            .ok_or_else(|| Error::SignalingError(format!("session {} is gone", session_id)))?;
        if !room.members.iter().any(|m| m.client_id == self.client_id) {
            return Err(Error::SignalingError(
                "relay subscription was dropped".to_string(),
            ));
        }
        let skip = if include_self { 0 } else { self.client_id };
        room.send_to_others(skip, &event);
        Ok(())
    }
}

#[async_trait]
impl SignalingTransport for LocalRelayClient {
    async fn connect(
        &self,
        session_id: &str,
        participant: &Participant,
    ) -> Result<mpsc::UnboundedReceiver<RelayEvent>> {
        let mut joined = self.joined.lock();
        if joined.is_some() {
            return Err(Error::SignalingError(
                "relay client already connected".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.relay.rooms.lock();
        let room = rooms.entry(session_id.to_string()).or_default();
        if room.members.iter().any(|m| m.participant.id == participant.id) {
            return Err(Error::SignalingError(format!(
                "participant {} already present in {}",
                participant.id, session_id
            )));
        }

        room.send_to_others(
            self.client_id,
            &RelayEvent::Presence(PresenceEvent::Join {
                participant: participant.clone(),
            }),
        );
        room.members.push(Member {
            participant: participant.clone(),
            client_id: self.client_id,
            tx: tx.clone(),
        });
        let _ = tx.send(RelayEvent::Presence(PresenceEvent::Sync {
            members: room.roster(),
        }));

        *joined = Some(session_id.to_string());
        debug!(session_id, participant_id = %participant.id, "Relay member joined");
        Ok(rx)
    }

    async fn send_signal(&self, envelope: Envelope) -> Result<()> {
        trace!(from = %envelope.from, to = %envelope.to, kind = ?envelope.kind, "Relay signal");
        self.fan_out(RelayEvent::Signal(envelope), false)
    }

    async fn broadcast(&self, payload: serde_json::Value) -> Result<()> {
        self.fan_out(RelayEvent::Broadcast(payload), self.relay.echo_broadcasts)
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(session_id) = self.joined.lock().take() else {
            return Ok(());
        };
        let mut rooms = self.relay.rooms.lock();
        if let Some(room) = rooms.get_mut(&session_id) {
            let departed = room
                .members
                .iter()
                .position(|m| m.client_id == self.client_id)
                .map(|idx| room.members.remove(idx));
            if let Some(member) = departed {
                room.send_to_others(
                    self.client_id,
                    &RelayEvent::Presence(PresenceEvent::Leave {
                        id: member.participant.id,
                    }),
                );
            }
            if room.members.is_empty() {
                rooms.remove(&session_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SessionDescription;

    fn participant(id: &str) -> Participant {
        Participant::new(id, id.to_uppercase()).with_joined_at(1)
    }

    #[tokio::test]
    async fn test_join_sync_and_leave() {
        let relay = LocalRelay::new();
        let alice = relay.client();
        let bob = relay.client();

        let mut alice_rx = alice.connect("room", &participant("alice")).await.unwrap();
        assert!(matches!(
            alice_rx.recv().await,
            Some(RelayEvent::Presence(PresenceEvent::Sync { members })) if members.len() == 1
        ));

        let mut bob_rx = bob.connect("room", &participant("bob")).await.unwrap();
        assert!(matches!(
            bob_rx.recv().await,
            Some(RelayEvent::Presence(PresenceEvent::Sync { members })) if members.len() == 2
        ));
        assert!(matches!(
            alice_rx.recv().await,
            Some(RelayEvent::Presence(PresenceEvent::Join { participant })) if participant.id == "bob"
        ));

        bob.disconnect().await.unwrap();
        assert_eq!(
            alice_rx.recv().await,
            Some(RelayEvent::Presence(PresenceEvent::Leave {
                id: "bob".to_string()
            }))
        );
        assert_eq!(relay.members("room").len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_unless_echo() {
        let relay = LocalRelay::new();
        let alice = relay.client();
        let bob = relay.client();
        let mut alice_rx = alice.connect("room", &participant("alice")).await.unwrap();
        let mut bob_rx = bob.connect("room", &participant("bob")).await.unwrap();
        alice_rx.recv().await; // sync
        alice_rx.recv().await; // join bob
        bob_rx.recv().await; // sync

        alice.broadcast(serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(
            bob_rx.recv().await,
            Some(RelayEvent::Broadcast(serde_json::json!({"n": 1})))
        );
        assert!(alice_rx.try_recv().is_err());

        let relay = LocalRelay::with_echo();
        let carol = relay.client();
        let mut carol_rx = carol.connect("room", &participant("carol")).await.unwrap();
        carol_rx.recv().await;
        carol.broadcast(serde_json::json!({"n": 2})).await.unwrap();
        assert!(matches!(carol_rx.recv().await, Some(RelayEvent::Broadcast(_))));
    }

    #[tokio::test]
    async fn test_signals_fan_out_to_others() {
        let relay = LocalRelay::new();
        let alice = relay.client();
        let bob = relay.client();
        let _alice_rx = alice.connect("room", &participant("alice")).await.unwrap();
        let mut bob_rx = bob.connect("room", &participant("bob")).await.unwrap();
        bob_rx.recv().await;

        let env = Envelope::offer("alice", "bob", &SessionDescription::offer("v=0")).unwrap();
        alice.send_signal(env.clone()).await.unwrap();
        assert_eq!(bob_rx.recv().await, Some(RelayEvent::Signal(env)));
    }

    #[tokio::test]
    async fn test_silent_removal_and_resync() {
        let relay = LocalRelay::new();
        let alice = relay.client();
        let carol = relay.client();
        let mut alice_rx = alice.connect("room", &participant("alice")).await.unwrap();
        let _carol_rx = carol.connect("room", &participant("carol")).await.unwrap();
        alice_rx.recv().await;
        alice_rx.recv().await;

        assert!(relay.remove_silently("room", "carol"));
        assert!(!relay.remove_silently("room", "carol"));
        relay.resync("room");
        assert!(matches!(
            alice_rx.recv().await,
            Some(RelayEvent::Presence(PresenceEvent::Sync { members }))
                if members.len() == 1 && members[0].id == "alice"
        ));

        // The silently removed client can no longer publish
        assert!(carol.broadcast(serde_json::json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_connect_rejected() {
        let relay = LocalRelay::new();
        let alice = relay.client();
        let _rx = alice.connect("room", &participant("alice")).await.unwrap();
        assert!(alice.connect("room", &participant("alice")).await.is_err());

        let imposter = relay.client();
        assert!(imposter.connect("room", &participant("alice")).await.is_err());
        assert!(imposter.broadcast(serde_json::json!({})).await.is_err());
    }
}
