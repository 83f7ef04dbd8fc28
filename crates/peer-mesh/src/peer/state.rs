//! Per-link state machine
//!
//! ```text
//! creating -> negotiating -> connected -> failing -> retrying -> negotiating ...
//!     \             \            \           \          \
//!      +-------------+------------+-----------+----------+--> closed
//! ```
//!
//! `closed` is terminal. Every input is accepted or rejected with
//! [`Error::InvalidTransition`]; nothing here panics.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Registered, no network activity yet
    Creating,
    /// Descriptions being exchanged
    Negotiating,
    /// Transport connectivity confirmed
    Connected,
    /// Failure or timeout observed, awaiting a policy decision
    Failing,
    /// Restart approved
    Retrying,
    /// Terminal
    Closed,
}

/// Inputs accepted by [`LinkState::next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkInput {
    /// Start (or restart) description exchange
    Negotiate,
    /// Both descriptions set and transport connected
    Connect,
    /// Connectivity failure or timeout
    Fail,
    /// Policy approved a restart
    Retry,
    /// Tear the link down
    Close,
}

impl LinkState {
    /// Compute the successor state
    pub fn next(self, input: LinkInput) -> Result<LinkState> {
        use LinkInput::*;
        use LinkState::*;

        let next = match (self, input) {
            (Closed, _) => None,
            (_, Close) => Some(Closed),
            (Creating | Retrying, Negotiate) => Some(Negotiating),
            (Negotiating, Connect) => Some(Connected),
            (Creating | Negotiating | Connected | Retrying, Fail) => Some(Failing),
            (Failing, Retry) => Some(Retrying),
            _ => None,
        };

        next.ok_or(Error::InvalidTransition { from: self, input })
    }

    /// Whether the state is terminal
    pub fn is_closed(&self) -> bool {
        matches!(self, LinkState::Closed)
    }

    /// Whether the link is still exchanging (or waiting to exchange) descriptions
    pub fn is_pre_connected(&self) -> bool {
        matches!(
            self,
            LinkState::Creating | LinkState::Negotiating | LinkState::Retrying
        )
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::Creating => "creating",
            LinkState::Negotiating => "negotiating",
            LinkState::Connected => "connected",
            LinkState::Failing => "failing",
            LinkState::Retrying => "retrying",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}
