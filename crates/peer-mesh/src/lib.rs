//! Presence-driven peer-to-peer mesh
//!
//! This crate links every participant of a small session directly with every
//! other participant, coordinated through a presence/broadcast relay.
//!
//! # Features
//!
//! - **Presence-driven discovery**: join, leave and roster sync events create
//!   and destroy links
//! - **Deterministic negotiation**: the lower participant id initiates; a new
//!   offer replaces a link that is past `creating`
//! - **Early candidate buffering**: candidates that outrun the offer are held
//!   and applied once the descriptions are complete
//! - **Bounded reconnection**: linear or exponential backoff, disconnect grace
//!   period, configurable attempt limit
//! - **Data channel messaging**: chat and drawing messages over data channels
//!   with relay broadcast fallback and de-duplication
//! - **Shared capture device**: one local audio capture per session, muted and
//!   unmuted without renegotiation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  MeshSession (join / leave / set_muted / send_app_message)│
//! │  └─ event loop task                                      │
//! │     ├─ MeshCore (roster, policy, router)                 │
//! │     │   └─ NegotiationEngine                             │
//! │     │       ├─ PeerLinkTable (one PeerLink per peer)     │
//! │     │       └─ CandidateBuffer                           │
//! │     ├─ SignalingTransport (presence, envelopes, broadcast)│
//! │     ├─ MediaGate (CaptureDevice)                         │
//! │     └─ per-link workers → RtcBackend / RtcConnection     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use peer_mesh::MeshConfig;
//!
//! let config = MeshConfig {
//!     max_peers: 6,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use peer_mesh::{LocalRelay, MemoryNetwork, MeshConfig, MeshSession, Participant, StaticCapture};
//! use std::sync::Arc;
//!
//! # async fn example() -> peer_mesh::Result<()> {
//! let relay = LocalRelay::new();
//! let network = MemoryNetwork::new();
//! let session = MeshSession::new(
//!     MeshConfig::default(),
//!     Arc::new(relay.client()),
//!     network.backend("alice"),
//!     StaticCapture::working(),
//! )?;
//!
//! let mut events = session.take_events().expect("first call");
//! session.join("room-1", Participant::new("alice", "Alice")).await?;
//! session.send_text("hello").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod channels;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod signaling;

mod actions;
mod negotiation;
mod participant;
mod session;

pub use backend::{MemoryBackend, MemoryNetwork, RtcBackend, RtcConnection};
pub use channels::{AppMessage, DeliveryPath, DrawKind};
pub use config::{BackoffKind, DataChannelMode, MeshConfig, ReconnectConfig, TurnServerConfig};
pub use error::{Error, MediaError, Result};
pub use media::{CaptureDevice, LocalMediaHandle, MediaGate, RemoteStreamHandle, StaticCapture};
pub use negotiation::role;
pub use participant::{now_millis, Participant, PeerId};
pub use peer::{LinkState, PeerSummary, Role};
pub use session::{DisconnectReason, MeshEvent, MeshSession};
pub use signaling::{LocalRelay, SignalingTransport};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
