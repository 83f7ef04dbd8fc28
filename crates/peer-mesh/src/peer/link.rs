//! A single link to one remote participant

use super::state::{LinkInput, LinkState};
use crate::media::RemoteStreamHandle;
use crate::participant::PeerId;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Which side drives the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates offers and the data channel
    Initiator,
    /// Waits for offers and answers them
    Responder,
}

/// Deadline a link is currently waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Responder waiting for the initiator's offer
    AwaitOffer,
    /// Initiator waiting for an answer
    AwaitAnswer,
    /// Responder waiting for its own answer to be produced
    AwaitLocalAnswer,
    /// Descriptions complete, waiting for transport connectivity
    Connect,
    /// Grace period after a `disconnected` report
    DisconnectRecheck,
    /// Backoff before a restart
    RetryBackoff,
}

impl TimerKind {
    /// Whether expiry of this timer counts as a negotiation timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TimerKind::AwaitOffer
                | TimerKind::AwaitAnswer
                | TimerKind::AwaitLocalAnswer
                | TimerKind::Connect
        )
    }
}

/// The one armed timer of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    /// Token matched against the expiry notification
    pub token: u64,
    /// What the timer guards
    pub kind: TimerKind,
}

/// State of one bidirectional connection
#[derive(Debug)]
pub struct PeerLink {
    pub(crate) peer_id: PeerId,
    pub(crate) display_name: String,
    pub(crate) joined_at: Option<i64>,
    pub(crate) generation: u64,
    pub(crate) role: Role,
    pub(crate) state: LinkState,
    pub(crate) local_description_set: bool,
    pub(crate) remote_description_set: bool,
    pub(crate) awaiting_answer: bool,
    pub(crate) transport_connected: bool,
    pub(crate) data_channel_open: bool,
    pub(crate) remote_stream: Option<RemoteStreamHandle>,
    pub(crate) attempt_count: u32,
    pub(crate) ever_connected: bool,
    pub(crate) recheck_pending: bool,
    pub(crate) created_at: Instant,
    pub(crate) timer: Option<PendingTimer>,
}

impl PeerLink {
    pub(crate) fn new(peer_id: &str, generation: u64, role: Role) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            display_name: String::new(),
            joined_at: None,
            generation,
            role,
            state: LinkState::Creating,
            local_description_set: false,
            remote_description_set: false,
            awaiting_answer: false,
            transport_connected: false,
            data_channel_open: false,
            remote_stream: None,
            attempt_count: 0,
            ever_connected: false,
            recheck_pending: false,
            created_at: Instant::now(),
            timer: None,
        }
    }

    /// Remote participant id
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Generation stamped at creation or last restart
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Negotiation role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Restart attempts since the last time the link connected
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether the remote description has been applied
    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Whether the data channel is open
    pub fn data_channel_open(&self) -> bool {
        self.data_channel_open
    }

    /// When the link was registered
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Both descriptions applied; gates candidate draining
    pub fn descriptions_complete(&self) -> bool {
        self.local_description_set && self.remote_description_set
    }

    /// Apply a state machine input
    pub(crate) fn transition(&mut self, input: LinkInput) -> Result<LinkState> {
        let next = self.state.next(input)?;
        debug!(
            peer_id = %self.peer_id,
            generation = self.generation,
            from = %self.state,
            to = %next,
            "Link transition"
        );
        self.state = next;
        Ok(next)
    }

    /// Forget description progress before a restart
    pub(crate) fn reset_negotiation(&mut self) {
        self.local_description_set = false;
        self.remote_description_set = false;
        self.awaiting_answer = false;
        self.transport_connected = false;
        self.data_channel_open = false;
        self.recheck_pending = false;
    }

    /// Enter `closed` and drop everything the link holds
    pub(crate) fn close(&mut self) {
        if self.transition(LinkInput::Close).is_err() {
            return;
        }
        self.reset_negotiation();
        self.remote_stream = None;
        self.timer = None;
    }

    /// Point-in-time view for callers
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            state: self.state,
            attempt_count: self.attempt_count,
            data_channel_open: self.data_channel_open,
            generation: self.generation,
        }
    }
}

/// Snapshot of one link returned by `MeshSession::peers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    /// Remote participant id
    pub peer_id: PeerId,
    /// Display name from presence, empty if the peer was only seen via an offer
    pub display_name: String,
    /// Negotiation role
    pub role: Role,
    /// Current state
    pub state: LinkState,
    /// Restart attempts since last connected
    pub attempt_count: u32,
    /// Whether the data channel is open
    pub data_channel_open: bool,
    /// Link generation
    pub generation: u64,
}
