//! Peer link management
//!
//! Each remote participant gets exactly one [`PeerLink`], owned by the
//! [`PeerLinkTable`]. Links move through the [`LinkState`] machine; early
//! candidates wait in the [`CandidateBuffer`]; failures are judged by the
//! [`ReconnectionPolicy`].

mod candidates;
mod lifecycle;
mod link;
mod state;
mod table;

pub use candidates::CandidateBuffer;
pub use lifecycle::{Decision, FailureKind, ReconnectionPolicy};
pub use link::{PeerLink, PeerSummary, PendingTimer, Role, TimerKind};
pub use state::{LinkInput, LinkState};
pub use table::PeerLinkTable;
