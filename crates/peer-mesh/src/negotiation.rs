//! Offer/answer/candidate exchange
//!
//! The lexically lower participant id is always the initiator: it creates
//! the offer and the data channel, the other side answers. Conflicts are
//! settled by last-offer-wins: an offer for a link that is past `creating`
//! replaces that link.

use crate::actions::{Actions, LinkOp};
use crate::config::MeshConfig;
use crate::participant::{Participant, PeerId};
use crate::peer::{CandidateBuffer, LinkInput, LinkState, PeerLink, PeerLinkTable, PendingTimer, Role, TimerKind};
use crate::session::{DisconnectReason, MeshEvent};
use crate::signaling::{Envelope, IceCandidate, SessionDescription};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Deterministic role of `local` towards `remote`
///
/// Symmetric: exactly one side of any pair of distinct ids is the initiator.
pub fn role(local: &str, remote: &str) -> Role {
    if local < remote {
        Role::Initiator
    } else {
        Role::Responder
    }
}

/// Apply `input` to a link and report the new state
pub(crate) fn advance(link: &mut PeerLink, input: LinkInput, out: &mut Actions) -> bool {
    match link.transition(input) {
        Ok(state) => {
            out.emit(MeshEvent::LinkStateChanged {
                peer_id: link.peer_id.clone(),
                state,
            });
            true
        }
        Err(e) => {
            debug!(peer_id = %link.peer_id, error = %e, "Transition rejected");
            false
        }
    }
}

/// Drives description exchange for every link of a session
#[derive(Debug)]
pub(crate) struct NegotiationEngine {
    local_id: PeerId,
    table: PeerLinkTable,
    candidates: CandidateBuffer,
    max_orphans: usize,
    offer_timeout: Duration,
    connect_timeout: Duration,
    next_token: u64,
}

impl NegotiationEngine {
    pub(crate) fn new(local_id: &str, config: &MeshConfig) -> Self {
        Self {
            local_id: local_id.to_string(),
            table: PeerLinkTable::new(config.max_peers as usize),
            candidates: CandidateBuffer::new(config.max_buffered_candidates),
            max_orphans: config.max_peers as usize,
            offer_timeout: config.offer_timeout(),
            connect_timeout: config.connect_timeout(),
            next_token: 0,
        }
    }

    pub(crate) fn table(&self) -> &PeerLinkTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut PeerLinkTable {
        &mut self.table
    }

    pub(crate) fn candidates(&self) -> &CandidateBuffer {
        &self.candidates
    }

    pub(crate) fn candidates_mut(&mut self) -> &mut CandidateBuffer {
        &mut self.candidates
    }

    /// Register a fresh link, closing any prior one for the same peer
    fn insert_link(&mut self, peer_id: &str, role: Role, out: &mut Actions) -> u64 {
        let (generation, replaced) = self.table.insert(peer_id, role);
        if let Some(old) = replaced {
            out.close_link(peer_id, old.generation);
        }
        out.open_link(peer_id, generation, role);
        out.emit(MeshEvent::LinkStateChanged {
            peer_id: peer_id.to_string(),
            state: LinkState::Creating,
        });
        generation
    }

    /// Create a link for a participant learned from presence
    pub(crate) fn open_link(&mut self, participant: &Participant, out: &mut Actions) -> u64 {
        let role = role(&self.local_id, &participant.id);
        let generation = self.insert_link(&participant.id, role, out);
        self.annotate(participant);
        match role {
            Role::Initiator => {
                self.create_offer(&participant.id, out);
            }
            Role::Responder => {
                self.arm_timer(&participant.id, TimerKind::AwaitOffer, self.offer_timeout, out);
            }
        }
        generation
    }

    /// Copy presence details onto an existing link
    pub(crate) fn annotate(&mut self, participant: &Participant) {
        if let Some(link) = self.table.get_mut(&participant.id) {
            link.display_name = participant.display_name.clone();
            link.joined_at = Some(participant.joined_at);
        }
    }

    /// Remove and close a link; its buffered candidates go with it
    pub(crate) fn destroy(&mut self, peer_id: &str, out: &mut Actions) -> Option<PeerLink> {
        self.candidates.discard(peer_id);
        let link = self.table.remove(peer_id)?;
        out.close_link(peer_id, link.generation);
        out.emit(MeshEvent::LinkStateChanged {
            peer_id: peer_id.to_string(),
            state: LinkState::Closed,
        });
        Some(link)
    }

    /// Start an offer; only valid for an initiator in `creating` or `retrying`
    pub(crate) fn create_offer(&mut self, peer_id: &str, out: &mut Actions) -> bool {
        let Some(link) = self.table.get_mut(peer_id) else {
            return false;
        };
        if link.role != Role::Initiator {
            debug!(peer_id, "Responder does not create offers");
            return false;
        }
        let ice_restart = match link.state {
            LinkState::Creating => false,
            LinkState::Retrying => true,
            state => {
                debug!(peer_id, %state, "Ignoring offer request");
                return false;
            }
        };
        if !advance(link, LinkInput::Negotiate, out) {
            return false;
        }
        out.op(peer_id, link.generation, LinkOp::CreateOffer { ice_restart });
        self.arm_timer(peer_id, TimerKind::AwaitAnswer, self.offer_timeout, out);
        true
    }

    /// Local offer is ready; send it
    pub(crate) fn on_offer_created(
        &mut self,
        peer_id: &str,
        generation: u64,
        offer: SessionDescription,
        out: &mut Actions,
    ) {
        let Some(link) = self.table.current(peer_id, generation) else {
            return;
        };
        if link.state != LinkState::Negotiating || link.role != Role::Initiator {
            debug!(peer_id, state = %link.state, "Dropping offer for idle link");
            return;
        }
        link.local_description_set = true;
        link.awaiting_answer = true;
        match Envelope::offer(&self.local_id, peer_id, &offer) {
            Ok(envelope) => out.signal(envelope),
            Err(e) => warn!(peer_id, error = %e, "Failed to encode offer"),
        }
    }

    /// Apply a remote offer (last-offer-wins)
    pub(crate) fn apply_offer(
        &mut self,
        from: &str,
        offer: SessionDescription,
        out: &mut Actions,
    ) -> bool {
        if from == self.local_id {
            return false;
        }

        let mut carried_attempts = 0;
        match self.table.get(from) {
            Some(link) if link.state == LinkState::Creating => {}
            Some(link) => {
                if link.state != LinkState::Connected {
                    carried_attempts = link.attempt_count;
                }
                let was_connected = link.state == LinkState::Connected;
                let presence = (link.display_name.clone(), link.joined_at);
                info!(peer_id = from, state = %link.state, "New offer replaces existing link");
                // Anything still buffered arrived ahead of this offer
                let mut early = Vec::new();
                self.candidates.drain_into(from, |c| early.push(c));
                self.destroy(from, out);
                for candidate in early {
                    self.candidates.enqueue(from, candidate);
                }
                if was_connected {
                    out.emit(MeshEvent::PeerDisconnected {
                        peer_id: from.to_string(),
                        reason: DisconnectReason::Replaced,
                    });
                }
                self.insert_link(from, Role::Responder, out);
                if let Some(link) = self.table.get_mut(from) {
                    link.display_name = presence.0;
                    link.joined_at = presence.1;
                }
            }
            None => {
                if !self.table.has_capacity() {
                    warn!(peer_id = from, "Peer limit reached, ignoring offer");
                    return false;
                }
                self.insert_link(from, Role::Responder, out);
            }
        }

        let Some(link) = self.table.get_mut(from) else {
            return false;
        };
        if link.role != Role::Responder {
            debug!(peer_id = from, "Answering offer despite initiator role");
            link.role = Role::Responder;
        }
        link.attempt_count = link.attempt_count.max(carried_attempts);
        if !advance(link, LinkInput::Negotiate, out) {
            return false;
        }
        out.op(from, link.generation, LinkOp::AcceptOffer(offer));
        self.arm_timer(from, TimerKind::AwaitLocalAnswer, self.offer_timeout, out);
        true
    }

    /// Remote offer applied and answer created; send it
    pub(crate) fn on_answer_created(
        &mut self,
        peer_id: &str,
        generation: u64,
        answer: SessionDescription,
        out: &mut Actions,
    ) {
        let Some(link) = self.table.current(peer_id, generation) else {
            return;
        };
        if link.state != LinkState::Negotiating || link.role != Role::Responder {
            return;
        }
        link.remote_description_set = true;
        link.local_description_set = true;
        match Envelope::answer(&self.local_id, peer_id, &answer) {
            Ok(envelope) => out.signal(envelope),
            Err(e) => warn!(peer_id, error = %e, "Failed to encode answer"),
        }
        self.descriptions_complete(peer_id, out);
    }

    /// Apply a remote answer; rejected unless one is awaited
    pub(crate) fn apply_answer(
        &mut self,
        from: &str,
        answer: SessionDescription,
        out: &mut Actions,
    ) -> bool {
        let Some(link) = self.table.get_mut(from) else {
            debug!(peer_id = from, "Rejecting answer for unknown peer");
            return false;
        };
        if link.state != LinkState::Negotiating || !link.awaiting_answer {
            debug!(peer_id = from, state = %link.state, "Rejecting unexpected answer");
            return false;
        }
        link.awaiting_answer = false;
        out.op(from, link.generation, LinkOp::AcceptAnswer(answer));
        true
    }

    /// Remote answer applied
    pub(crate) fn on_answer_applied(&mut self, peer_id: &str, generation: u64, out: &mut Actions) {
        let Some(link) = self.table.current(peer_id, generation) else {
            return;
        };
        if link.state != LinkState::Negotiating {
            return;
        }
        link.remote_description_set = true;
        self.descriptions_complete(peer_id, out);
    }

    /// A backend operation failed; negotiation errors change nothing
    pub(crate) fn on_operation_failed(
        &mut self,
        peer_id: &str,
        generation: u64,
        operation: &str,
        error: &str,
    ) {
        let Some(link) = self.table.current(peer_id, generation) else {
            return;
        };
        debug!(peer_id, generation, operation, error, "Link operation failed");
        if operation == "accept_answer" && link.state == LinkState::Negotiating {
            link.awaiting_answer = true;
        }
    }

    /// Apply a remote candidate now, or hold it until descriptions are complete
    pub(crate) fn add_candidate(&mut self, from: &str, candidate: IceCandidate, out: &mut Actions) {
        if from == self.local_id {
            return;
        }
        if let Err(e) = candidate.validate() {
            debug!(peer_id = from, error = %e, "Dropping malformed candidate");
            return;
        }
        match self.table.get(from) {
            Some(link)
                if link.remote_description_set
                    && matches!(link.state, LinkState::Negotiating | LinkState::Connected) =>
            {
                trace!(peer_id = from, "Applying candidate");
                out.op(from, link.generation, LinkOp::AddCandidate(candidate));
            }
            Some(_) => {
                self.candidates.enqueue(from, candidate);
            }
            None => {
                if self.candidates.is_empty(from) && self.orphan_count() >= self.max_orphans {
                    warn!(
                        peer_id = from,
                        limit = self.max_orphans,
                        "Too many unknown peers with buffered candidates, dropping"
                    );
                    return;
                }
                self.candidates.enqueue(from, candidate);
            }
        }
    }

    /// Peers holding buffered candidates without a link
    fn orphan_count(&self) -> usize {
        self.candidates
            .peers()
            .filter(|peer| self.table.get(peer).is_none())
            .count()
    }

    /// Forward a locally gathered candidate
    pub(crate) fn on_local_candidate(
        &mut self,
        peer_id: &str,
        generation: u64,
        candidate: IceCandidate,
        out: &mut Actions,
    ) {
        if self.table.current(peer_id, generation).is_none() {
            return;
        }
        match Envelope::candidate(&self.local_id, peer_id, &candidate) {
            Ok(envelope) => out.signal(envelope),
            Err(e) => warn!(peer_id, error = %e, "Failed to encode candidate"),
        }
    }

    /// Both descriptions are set: flush early candidates and wait for connectivity
    fn descriptions_complete(&mut self, peer_id: &str, out: &mut Actions) {
        let Some(link) = self.table.get(peer_id) else {
            return;
        };
        if !link.descriptions_complete() {
            return;
        }
        let generation = link.generation;
        let connected = link.transport_connected;
        let drained = self.candidates.drain_into(peer_id, |candidate| {
            out.op(peer_id, generation, LinkOp::AddCandidate(candidate))
        });
        debug!(peer_id, generation, drained, "Descriptions complete");

        if connected {
            self.mark_connected(peer_id, out);
        } else {
            self.arm_timer(peer_id, TimerKind::Connect, self.connect_timeout, out);
        }
    }

    /// Transport reports connectivity
    pub(crate) fn on_transport_connected(&mut self, peer_id: &str, generation: u64, out: &mut Actions) {
        let Some(link) = self.table.current(peer_id, generation) else {
            return;
        };
        link.transport_connected = true;
        if link.recheck_pending {
            link.recheck_pending = false;
            info!(peer_id, "Link recovered within grace period");
            self.cancel_timer(peer_id, out);
            return;
        }
        if link.state == LinkState::Negotiating && link.descriptions_complete() {
            self.mark_connected(peer_id, out);
        }
    }

    fn mark_connected(&mut self, peer_id: &str, out: &mut Actions) {
        let Some(link) = self.table.get_mut(peer_id) else {
            return;
        };
        if !advance(link, LinkInput::Connect, out) {
            return;
        }
        link.attempt_count = 0;
        link.ever_connected = true;
        info!(peer_id, generation = link.generation, "Peer connected");
        self.cancel_timer(peer_id, out);
        out.emit(MeshEvent::PeerConnected {
            peer_id: peer_id.to_string(),
        });
    }

    /// Restart a link in `retrying`
    ///
    /// The initiator reopens its connection under a new generation and
    /// sends an ICE-restart offer; the responder waits for that offer.
    pub(crate) fn restart(&mut self, peer_id: &str, out: &mut Actions) {
        let Some(role) = self
            .table
            .get(peer_id)
            .filter(|l| l.state == LinkState::Retrying)
            .map(|l| l.role)
        else {
            return;
        };
        match role {
            Role::Initiator => {
                self.candidates.discard(peer_id);
                let generation = self.table.bump_generation();
                let Some(link) = self.table.get_mut(peer_id) else {
                    return;
                };
                let previous = link.generation;
                link.generation = generation;
                link.reset_negotiation();
                link.timer = None;
                info!(peer_id, previous, generation, attempt = link.attempt_count, "Restarting link");
                out.close_link(peer_id, previous);
                out.open_link(peer_id, generation, role);
                self.create_offer(peer_id, out);
            }
            Role::Responder => {
                let Some(link) = self.table.get_mut(peer_id) else {
                    return;
                };
                link.reset_negotiation();
                if advance(link, LinkInput::Negotiate, out) {
                    self.arm_timer(peer_id, TimerKind::AwaitOffer, self.offer_timeout, out);
                }
            }
        }
    }

    /// Arm the link's single timer, replacing any previous one
    pub(crate) fn arm_timer(&mut self, peer_id: &str, kind: TimerKind, after: Duration, out: &mut Actions) {
        self.next_token += 1;
        let token = self.next_token;
        if let Some(link) = self.table.get_mut(peer_id) {
            link.timer = Some(PendingTimer { token, kind });
            out.arm_timer(peer_id, link.generation, token, after);
        }
    }

    pub(crate) fn cancel_timer(&mut self, peer_id: &str, out: &mut Actions) {
        if let Some(link) = self.table.get_mut(peer_id) {
            if link.timer.take().is_some() {
                out.cancel_timer(peer_id);
            }
        }
    }
}
