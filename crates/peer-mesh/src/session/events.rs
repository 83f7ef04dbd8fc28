//! Events surfaced to the application

use crate::channels::{AppMessage, DeliveryPath};
use crate::media::RemoteStreamHandle;
use crate::participant::PeerId;
use crate::peer::LinkState;
use serde::{Deserialize, Serialize};

/// Why a peer went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    /// Presence reported a leave
    Left,
    /// A presence sync no longer lists the peer
    MissingFromRoster,
    /// Reconnection attempts ran out
    RetriesExhausted,
    /// A new offer replaced a connected link
    Replaced,
    /// The peer joined again with a new session
    Rejoined,
    /// The backend could not open a connection
    OpenFailed,
    /// The local session left
    SessionEnded,
}

/// Notification from a running [`MeshSession`](super::MeshSession)
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Link reached `connected`
    PeerConnected {
        /// Remote peer
        peer_id: PeerId,
    },
    /// Link is gone for good
    PeerDisconnected {
        /// Remote peer
        peer_id: PeerId,
        /// Cause
        reason: DisconnectReason,
    },
    /// Remote audio arrived
    RemoteStream {
        /// Remote peer
        peer_id: PeerId,
        /// Stream handle
        handle: RemoteStreamHandle,
    },
    /// Chat or drawing message from another participant
    AppMessage {
        /// Sender
        from: PeerId,
        /// Message
        message: AppMessage,
        /// Path it arrived on
        path: DeliveryPath,
    },
    /// Link state changed
    LinkStateChanged {
        /// Remote peer
        peer_id: PeerId,
        /// New state
        state: LinkState,
    },
    /// Data channel to the peer opened
    DataChannelOpen {
        /// Remote peer
        peer_id: PeerId,
    },
}

impl MeshEvent {
    /// Peer the event concerns
    pub fn peer_id(&self) -> &str {
        match self {
            MeshEvent::PeerConnected { peer_id }
            | MeshEvent::PeerDisconnected { peer_id, .. }
            | MeshEvent::RemoteStream { peer_id, .. }
            | MeshEvent::LinkStateChanged { peer_id, .. }
            | MeshEvent::DataChannelOpen { peer_id } => peer_id,
            MeshEvent::AppMessage { from, .. } => from,
        }
    }
}
