//! Side effects requested by the mesh state machine
//!
//! The negotiation engine and session core never perform I/O. They push
//! [`Action`]s that the session driver executes in order after each input.

use crate::participant::PeerId;
use crate::peer::Role;
use crate::session::MeshEvent;
use crate::signaling::{Envelope, IceCandidate, SessionDescription};
use bytes::Bytes;
use std::time::Duration;

/// Operation executed by a link's worker against its connection
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LinkOp {
    CreateOffer { ice_restart: bool },
    AcceptOffer(SessionDescription),
    AcceptAnswer(SessionDescription),
    AddCandidate(IceCandidate),
    SendData(Bytes),
    SetOutgoingEnabled(bool),
}

impl LinkOp {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            LinkOp::CreateOffer { .. } => "create_offer",
            LinkOp::AcceptOffer(_) => "accept_offer",
            LinkOp::AcceptAnswer(_) => "accept_answer",
            LinkOp::AddCandidate(_) => "add_candidate",
            LinkOp::SendData(_) => "send_data",
            LinkOp::SetOutgoingEnabled(_) => "set_outgoing_enabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    /// Spawn a worker and open a backend connection
    OpenLink {
        peer_id: PeerId,
        generation: u64,
        role: Role,
    },
    /// Stop the worker of `generation` and release its media hold
    CloseLink { peer_id: PeerId, generation: u64 },
    /// Queue an operation on the worker of `generation`
    Op {
        peer_id: PeerId,
        generation: u64,
        op: LinkOp,
    },
    Signal(Envelope),
    Broadcast(serde_json::Value),
    /// Replace the peer's timer with one firing after `after`
    ArmTimer {
        peer_id: PeerId,
        generation: u64,
        token: u64,
        after: Duration,
    },
    CancelTimer { peer_id: PeerId },
    Emit(MeshEvent),
}

/// Ordered batch of actions produced by one input
#[derive(Debug, Default)]
pub(crate) struct Actions(Vec<Action>);

impl Actions {
    pub(crate) fn open_link(&mut self, peer_id: &str, generation: u64, role: Role) {
        self.0.push(Action::OpenLink {
            peer_id: peer_id.to_string(),
            generation,
            role,
        });
    }

    pub(crate) fn close_link(&mut self, peer_id: &str, generation: u64) {
        self.0.push(Action::CloseLink {
            peer_id: peer_id.to_string(),
            generation,
        });
    }

    pub(crate) fn op(&mut self, peer_id: &str, generation: u64, op: LinkOp) {
        self.0.push(Action::Op {
            peer_id: peer_id.to_string(),
            generation,
            op,
        });
    }

    pub(crate) fn signal(&mut self, envelope: Envelope) {
        self.0.push(Action::Signal(envelope));
    }

    pub(crate) fn broadcast(&mut self, payload: serde_json::Value) {
        self.0.push(Action::Broadcast(payload));
    }

    pub(crate) fn arm_timer(&mut self, peer_id: &str, generation: u64, token: u64, after: Duration) {
        self.0.push(Action::ArmTimer {
            peer_id: peer_id.to_string(),
            generation,
            token,
            after,
        });
    }

    pub(crate) fn cancel_timer(&mut self, peer_id: &str) {
        self.0.push(Action::CancelTimer {
            peer_id: peer_id.to_string(),
        });
    }

    pub(crate) fn emit(&mut self, event: MeshEvent) {
        self.0.push(Action::Emit(event));
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.0.iter()
    }
}

impl IntoIterator for Actions {
    type Item = Action;
    type IntoIter = std::vec::IntoIter<Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
