//! Signaling relay seam
//!
//! The relay is an external pub/sub service: it reports presence, fans out
//! broadcasts and carries directed negotiation envelopes. The mesh only
//! depends on the [`SignalingTransport`] trait; [`LocalRelay`] is an
//! in-process implementation used by tests and single-process demos.

mod envelope;
mod local;
mod presence;

pub use envelope::{Envelope, IceCandidate, SdpType, SessionDescription, SignalKind};
pub use local::{LocalRelay, LocalRelayClient};
pub use presence::PresenceEvent;

use crate::participant::Participant;
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Everything a subscriber can receive from the relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Roster change
    Presence(PresenceEvent),
    /// Directed negotiation message (may be addressed to someone else)
    Signal(Envelope),
    /// Session-wide application broadcast
    Broadcast(serde_json::Value),
}

/// Connection to the presence/broadcast relay
///
/// Delivery is ordered per sender and at most once per subscriber.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Subscribe to `session_id` and announce `participant`
    ///
    /// Returns the stream of relay events for this subscriber. The stream
    /// ends when the relay drops the subscription.
    async fn connect(
        &self,
        session_id: &str,
        participant: &Participant,
    ) -> Result<mpsc::UnboundedReceiver<RelayEvent>>;

    /// Send a negotiation envelope
    async fn send_signal(&self, envelope: Envelope) -> Result<()>;

    /// Broadcast an application payload to the session
    async fn broadcast(&self, payload: serde_json::Value) -> Result<()>;

    /// Announce departure and drop the subscription
    async fn disconnect(&self) -> Result<()>;
}
