//! Media transport seam
//!
//! The mesh never talks to a network stack directly. Each link opens one
//! [`RtcConnection`] through an [`RtcBackend`] and receives everything the
//! connection reports asynchronously (local candidates, connectivity, data
//! channel traffic, remote streams) through a [`LinkEventSink`] stamped with
//! the link's peer id and generation.

mod memory;
#[cfg(feature = "webrtc-backend")]
mod webrtc;

pub use memory::{MemoryBackend, MemoryNetwork, NetworkStats};
#[cfg(feature = "webrtc-backend")]
pub use self::webrtc::WebRtcBackend;

use crate::config::{DataChannelMode, MeshConfig, TurnServerConfig};
use crate::media::{LocalMediaHandle, RemoteStreamHandle};
use crate::participant::PeerId;
use crate::peer::Role;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Transport connectivity as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Checking candidates
    Connecting,
    /// Media and data can flow
    Connected,
    /// Temporarily lost; may recover on its own
    Disconnected,
    /// Lost for good
    Failed,
    /// Closed by either side
    Closed,
}

/// Everything a link's connection or worker reports back
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Local offer created and applied
    OfferCreated(SessionDescription),
    /// Remote offer applied, local answer created and applied
    AnswerCreated(SessionDescription),
    /// Remote answer applied
    AnswerApplied,
    /// A backend operation failed
    OperationFailed {
        /// Operation name
        operation: &'static str,
        /// Error text
        error: String,
    },
    /// The connection could not be opened at all
    OpenFailed(String),
    /// Newly gathered local candidate
    LocalCandidate(IceCandidate),
    /// Connectivity change
    Connectivity(ConnectivityState),
    /// Data channel opened (either side)
    DataChannelOpen,
    /// Data channel closed
    DataChannelClosed,
    /// Payload received on the data channel
    DataMessage(Bytes),
    /// Remote media stream arrived
    RemoteStream(RemoteStreamHandle),
}

/// A [`LinkEvent`] tagged with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSignal {
    /// Remote peer
    pub peer_id: PeerId,
    /// Generation of the link that produced the event
    pub generation: u64,
    /// The event
    pub event: LinkEvent,
}

/// Callback target handed to a connection
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    peer_id: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkSignal>,
}

impl LinkEventSink {
    /// Create a sink feeding `tx`
    pub fn new(peer_id: &str, generation: u64, tx: mpsc::UnboundedSender<LinkSignal>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            tx,
        }
    }

    /// Create a sink together with its receiving end
    pub fn channel(peer_id: &str, generation: u64) -> (Self, mpsc::UnboundedReceiver<LinkSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(peer_id, generation, tx), rx)
    }

    /// Report an event; silently dropped once the session is gone
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(LinkSignal {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }

    /// Remote peer
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Link generation
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Parameters for opening one connection
#[derive(Debug, Clone)]
pub struct LinkSpec {
    /// Local participant
    pub local_id: PeerId,
    /// Remote participant
    pub peer_id: PeerId,
    /// Link generation
    pub generation: u64,
    /// Negotiation role
    pub role: Role,
    /// Whether this side creates the data channel (initiator)
    pub create_data_channel: bool,
    /// Data channel label
    pub data_channel_label: String,
    /// Data channel reliability
    pub data_channel_mode: DataChannelMode,
    /// STUN URLs
    pub stun_servers: Vec<String>,
    /// TURN servers
    pub turn_servers: Vec<TurnServerConfig>,
    /// Outgoing audio, if captured
    pub local_media: Option<LocalMediaHandle>,
}

impl LinkSpec {
    /// Describe a link from session configuration
    pub fn new(
        config: &MeshConfig,
        local_id: &str,
        peer_id: &str,
        generation: u64,
        role: Role,
        local_media: Option<LocalMediaHandle>,
    ) -> Self {
        Self {
            local_id: local_id.to_string(),
            peer_id: peer_id.to_string(),
            generation,
            role,
            create_data_channel: role == Role::Initiator,
            data_channel_label: config.data_channel_label.clone(),
            data_channel_mode: config.data_channel_mode,
            stun_servers: config.stun_servers.clone(),
            turn_servers: config.turn_servers.clone(),
            local_media,
        }
    }
}

/// Factory for per-link connections
#[async_trait]
pub trait RtcBackend: Send + Sync {
    /// Open a connection; asynchronous reports go to `events`
    async fn open(&self, spec: LinkSpec, events: LinkEventSink) -> Result<Box<dyn RtcConnection>>;
}

/// One peer-to-peer connection
///
/// Calls are made strictly one at a time by the link's worker.
#[async_trait]
pub trait RtcConnection: Send {
    /// Create and apply a local offer
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription>;

    /// Apply a remote offer, then create and apply the local answer
    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription>;

    /// Apply a remote answer
    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<()>;

    /// Apply a remote candidate; only valid once the remote description is set
    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<()>;

    /// Send a payload on the data channel
    async fn send_data(&mut self, data: Bytes) -> Result<()>;

    /// Enable or disable outgoing audio without renegotiation
    async fn set_outgoing_enabled(&mut self, enabled: bool) -> Result<()>;

    /// Close the connection
    async fn close(&mut self) -> Result<()>;
}
