//! Session state machine
//!
//! [`MeshCore`] owns every piece of per-session state: the roster learned
//! from presence, the link table (through the negotiation engine), the
//! reconnection policy and the message router. Each input is handled to
//! completion and answered with [`Actions`]; nothing here awaits.

use super::events::{DisconnectReason, MeshEvent};
use crate::actions::{Actions, LinkOp};
use crate::backend::{ConnectivityState, LinkEvent, LinkSignal};
use crate::channels::{AppMessage, DataChannelRouter, DeliveryPath};
use crate::config::MeshConfig;
use crate::negotiation::{advance, NegotiationEngine};
use crate::participant::{Participant, PeerId};
use crate::peer::{Decision, FailureKind, LinkInput, LinkState, PeerSummary, ReconnectionPolicy, TimerKind};
use crate::signaling::{Envelope, PresenceEvent, SignalKind};
use crate::Result;
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};

#[derive(Debug)]
pub(crate) struct MeshCore {
    local: Participant,
    engine: NegotiationEngine,
    policy: ReconnectionPolicy,
    router: DataChannelRouter,
    roster: HashMap<PeerId, Participant>,
}

impl MeshCore {
    pub(crate) fn new(local: Participant, config: &MeshConfig) -> Self {
        Self {
            engine: NegotiationEngine::new(&local.id, config),
            policy: ReconnectionPolicy::from(&config.reconnect),
            router: DataChannelRouter::new(local.id.clone(), config.max_text_len, config.dedupe_window),
            roster: HashMap::new(),
            local,
        }
    }

    pub(crate) fn local_id(&self) -> &str {
        &self.local.id
    }

    /// Reconcile links with a presence change
    pub(crate) fn on_presence(&mut self, event: PresenceEvent, out: &mut Actions) {
        match event {
            PresenceEvent::Join { participant } => self.on_join(participant, out),
            PresenceEvent::Leave { id } => {
                if id == self.local.id {
                    return;
                }
                self.roster.remove(&id);
                self.drop_peer(&id, DisconnectReason::Left, out);
            }
            PresenceEvent::Sync { members } => self.on_sync(members, out),
        }
    }

    fn on_join(&mut self, participant: Participant, out: &mut Actions) {
        if participant.id == self.local.id {
            return;
        }
        self.roster
            .insert(participant.id.clone(), participant.clone());

        let Some(link) = self.engine.table().get(&participant.id) else {
            if self.engine.table().has_capacity() {
                self.engine.open_link(&participant, out);
            } else {
                warn!(peer_id = %participant.id, "Peer limit reached, not linking");
            }
            return;
        };

        let (joined_at, was_connected) = (link.joined_at, link.ever_connected);
        match joined_at {
            Some(joined_at) if joined_at != participant.joined_at => {
                info!(peer_id = %participant.id, "Peer rejoined, replacing link");
                self.engine.destroy(&participant.id, out);
                if was_connected {
                    out.emit(MeshEvent::PeerDisconnected {
                        peer_id: participant.id.clone(),
                        reason: DisconnectReason::Rejoined,
                    });
                }
                self.engine.open_link(&participant, out);
            }
            Some(_) => trace!(peer_id = %participant.id, "Duplicate join"),
            // Link was created by an early offer
            None => self.engine.annotate(&participant),
        }
    }

    fn on_sync(&mut self, members: Vec<Participant>, out: &mut Actions) {
        let mut members: Vec<Participant> = members
            .into_iter()
            .filter(|p| p.id != self.local.id)
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));

        let missing: Vec<PeerId> = self
            .engine
            .table()
            .peer_ids()
            .into_iter()
            .filter(|id| !members.iter().any(|m| &m.id == id))
            .collect();
        for peer_id in missing {
            info!(peer_id = %peer_id, "Peer missing from roster");
            self.drop_peer(&peer_id, DisconnectReason::MissingFromRoster, out);
        }

        self.roster = members
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();

        let orphans: Vec<PeerId> = self
            .engine
            .candidates()
            .peers()
            .filter(|id| !self.roster.contains_key(*id) && !self.engine.table().contains(id))
            .map(str::to_string)
            .collect();
        for peer_id in orphans {
            self.engine.candidates_mut().discard(&peer_id);
        }

        for participant in members {
            self.on_join(participant, out);
        }
    }

    /// Destroy a link and tell the application
    fn drop_peer(&mut self, peer_id: &str, reason: DisconnectReason, out: &mut Actions) {
        if self.engine.destroy(peer_id, out).is_some() {
            out.emit(MeshEvent::PeerDisconnected {
                peer_id: peer_id.to_string(),
                reason,
            });
        } else {
            self.engine.candidates_mut().discard(peer_id);
        }
    }

    /// Handle a negotiation envelope from the relay
    pub(crate) fn on_signal(&mut self, envelope: Envelope, out: &mut Actions) {
        if !envelope.is_for(&self.local.id) {
            trace!(from = %envelope.from, to = %envelope.to, "Ignoring envelope for another participant");
            return;
        }
        let from = envelope.from.clone();
        match envelope.kind {
            SignalKind::Offer => match envelope.description() {
                Ok(offer) => {
                    if self.engine.apply_offer(&from, offer, out) {
                        if let Some(participant) = self.roster.get(&from) {
                            self.engine.annotate(participant);
                        }
                    }
                }
                Err(e) => debug!(peer_id = %from, error = %e, "Dropping malformed offer"),
            },
            SignalKind::Answer => match envelope.description() {
                Ok(answer) => {
                    self.engine.apply_answer(&from, answer, out);
                }
                Err(e) => debug!(peer_id = %from, error = %e, "Dropping malformed answer"),
            },
            SignalKind::IceCandidate => match envelope.ice_candidate() {
                Ok(candidate) => self.engine.add_candidate(&from, candidate, out),
                Err(e) => debug!(peer_id = %from, error = %e, "Dropping malformed candidate"),
            },
        }
    }

    /// Handle an application broadcast from the relay
    pub(crate) fn on_broadcast(&mut self, payload: serde_json::Value, out: &mut Actions) {
        if let Some(message) = self.router.accept_inbound(payload, DeliveryPath::Broadcast) {
            out.emit(MeshEvent::AppMessage {
                from: message.sender().to_string(),
                message,
                path: DeliveryPath::Broadcast,
            });
        }
    }

    /// Handle a report from a link's connection or worker
    pub(crate) fn on_link_event(&mut self, signal: LinkSignal, out: &mut Actions) {
        let LinkSignal {
            peer_id,
            generation,
            event,
        } = signal;
        let engine = &mut self.engine;

        match event {
            LinkEvent::OfferCreated(offer) => engine.on_offer_created(&peer_id, generation, offer, out),
            LinkEvent::AnswerCreated(answer) => engine.on_answer_created(&peer_id, generation, answer, out),
            LinkEvent::AnswerApplied => engine.on_answer_applied(&peer_id, generation, out),
            LinkEvent::OperationFailed { operation, error } => {
                engine.on_operation_failed(&peer_id, generation, operation, &error)
            }
            LinkEvent::LocalCandidate(candidate) => {
                engine.on_local_candidate(&peer_id, generation, candidate, out)
            }
            LinkEvent::OpenFailed(error) => {
                if engine.table_mut().current(&peer_id, generation).is_none() {
                    return;
                }
                warn!(peer_id = %peer_id, generation, error = %error, "Could not open connection");
                self.drop_peer(&peer_id, DisconnectReason::OpenFailed, out);
            }
            LinkEvent::Connectivity(state) => self.on_connectivity(&peer_id, generation, state, out),
            LinkEvent::DataChannelOpen => {
                let Some(link) = engine.table_mut().current(&peer_id, generation) else {
                    return;
                };
                link.data_channel_open = true;
                out.emit(MeshEvent::DataChannelOpen { peer_id });
            }
            LinkEvent::DataChannelClosed => {
                if let Some(link) = engine.table_mut().current(&peer_id, generation) {
                    link.data_channel_open = false;
                }
            }
            LinkEvent::DataMessage(bytes) => {
                if engine.table_mut().current(&peer_id, generation).is_none() {
                    return;
                }
                if let Some(message) = self.router.accept_bytes(&bytes) {
                    out.emit(MeshEvent::AppMessage {
                        from: message.sender().to_string(),
                        message,
                        path: DeliveryPath::DataChannel,
                    });
                }
            }
            LinkEvent::RemoteStream(handle) => {
                let Some(link) = engine.table_mut().current(&peer_id, generation) else {
                    return;
                };
                link.remote_stream = Some(handle.clone());
                out.emit(MeshEvent::RemoteStream { peer_id, handle });
            }
        }
    }

    fn on_connectivity(&mut self, peer_id: &str, generation: u64, state: ConnectivityState, out: &mut Actions) {
        match state {
            ConnectivityState::Connecting => {}
            ConnectivityState::Connected => self.engine.on_transport_connected(peer_id, generation, out),
            ConnectivityState::Disconnected => {
                let Some(link) = self.engine.table_mut().current(peer_id, generation) else {
                    return;
                };
                let was_up = link.transport_connected;
                link.transport_connected = false;
                if link.state != LinkState::Connected || !was_up {
                    return;
                }
                let decision = self
                    .policy
                    .decide(link.attempt_count, FailureKind::Disconnected { rechecked: false });
                if let Decision::Recheck { after } = decision {
                    link.recheck_pending = true;
                    info!(peer_id, ?after, "Peer disconnected, rechecking");
                    self.engine
                        .arm_timer(peer_id, TimerKind::DisconnectRecheck, after, out);
                }
            }
            ConnectivityState::Failed | ConnectivityState::Closed => {
                if self.engine.table_mut().current(peer_id, generation).is_none() {
                    return;
                }
                self.fail(peer_id, FailureKind::Failed, out);
            }
        }
    }

    /// Route a connectivity failure through the reconnection policy
    fn fail(&mut self, peer_id: &str, failure: FailureKind, out: &mut Actions) {
        let failure = match failure {
            FailureKind::Disconnected { .. } => FailureKind::Disconnected { rechecked: true },
            other => other,
        };
        let Some(link) = self.engine.table_mut().get_mut(peer_id) else {
            return;
        };
        if !advance(link, LinkInput::Fail, out) {
            return;
        }
        link.transport_connected = false;
        link.recheck_pending = false;
        let attempts = link.attempt_count;
        self.engine.cancel_timer(peer_id, out);

        match self.policy.decide(attempts, failure) {
            Decision::Retry { after, attempt } => {
                info!(peer_id, ?failure, attempt, ?after, "Scheduling reconnect");
                if let Some(link) = self.engine.table_mut().get_mut(peer_id) {
                    link.attempt_count = attempt;
                }
                self.engine
                    .arm_timer(peer_id, TimerKind::RetryBackoff, after, out);
            }
            Decision::Recheck { after } => {
                self.engine
                    .arm_timer(peer_id, TimerKind::DisconnectRecheck, after, out);
            }
            Decision::GiveUp => {
                warn!(peer_id, attempts, "Reconnection attempts exhausted");
                self.drop_peer(peer_id, DisconnectReason::RetriesExhausted, out);
            }
        }
    }

    /// Handle a fired timer; stale or superseded timers are ignored
    pub(crate) fn on_timer(&mut self, peer_id: &str, generation: u64, token: u64, out: &mut Actions) {
        let Some(link) = self.engine.table_mut().current(peer_id, generation) else {
            return;
        };
        let kind = match link.timer {
            Some(timer) if timer.token == token => timer.kind,
            _ => {
                trace!(peer_id, token, "Ignoring superseded timer");
                return;
            }
        };
        link.timer = None;
        let state = link.state;

        match kind {
            kind if kind.is_timeout() => {
                if state.is_pre_connected() {
                    info!(peer_id, ?kind, %state, "Negotiation timed out");
                    self.fail(peer_id, FailureKind::Timeout, out);
                }
            }
            TimerKind::DisconnectRecheck => {
                link.recheck_pending = false;
                if state == LinkState::Connected && !link.transport_connected {
                    self.fail(peer_id, FailureKind::Disconnected { rechecked: true }, out);
                }
            }
            TimerKind::RetryBackoff => {
                if state == LinkState::Failing && advance(link, LinkInput::Retry, out) {
                    self.engine.restart(peer_id, out);
                }
            }
            _ => {}
        }
    }

    /// Validate, stamp and route an outbound application message
    pub(crate) fn send_app_message(&mut self, message: AppMessage, out: &mut Actions) -> Result<AppMessage> {
        let message = self.router.prepare_outbound(message)?;
        let table = self.engine.table();

        let mut open: Vec<PeerId> = table
            .iter()
            .filter(|l| l.data_channel_open)
            .map(|l| l.peer_id.clone())
            .collect();
        open.sort();
        let mut known: Vec<PeerId> = self.roster.keys().cloned().collect();
        for peer_id in table.peer_ids() {
            if !known.contains(&peer_id) {
                known.push(peer_id);
            }
        }

        let route = self.router.route(&open, &known);
        if !route.data_channel.is_empty() {
            let bytes = message.to_bytes()?;
            for peer_id in &route.data_channel {
                if let Some(link) = table.get(peer_id) {
                    out.op(peer_id, link.generation, LinkOp::SendData(bytes.clone()));
                }
            }
        }
        if route.broadcast {
            out.broadcast(message.to_value()?);
        }
        debug!(
            kind = message.kind(),
            data_channel = route.data_channel.len(),
            broadcast = route.broadcast,
            "Routed app message"
        );
        Ok(message)
    }

    /// Toggle outgoing audio on every link
    pub(crate) fn set_muted(&mut self, muted: bool, out: &mut Actions) {
        for link in self.engine.table().iter() {
            out.op(&link.peer_id, link.generation, LinkOp::SetOutgoingEnabled(!muted));
        }
    }

    /// Snapshot of every link, sorted by peer id
    pub(crate) fn peers(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self.engine.table().iter().map(|l| l.summary()).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Tear down every link
    pub(crate) fn shutdown(&mut self, out: &mut Actions) {
        for peer_id in self.engine.table().peer_ids() {
            self.drop_peer(&peer_id, DisconnectReason::SessionEnded, out);
        }
        self.roster.clear();
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::backend::LinkEvent;
    use crate::signaling::{IceCandidate, SessionDescription};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn core(local: &str) -> MeshCore {
        MeshCore::new(Participant::new(local, local), &MeshConfig::default())
    }

    fn join(id: &str, joined_at: i64) -> PresenceEvent {
        PresenceEvent::Join {
            participant: Participant::new(id, id).with_joined_at(joined_at),
        }
    }

    fn events(out: &Actions) -> Vec<MeshEvent> {
        out.iter()
            .filter_map(|a| match a {
                Action::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn disconnects(out: &Actions, peer: &str) -> Vec<DisconnectReason> {
        events(out)
            .into_iter()
            .filter_map(|e| match e {
                MeshEvent::PeerDisconnected { peer_id, reason } if peer_id == peer => Some(reason),
                _ => None,
            })
            .collect()
    }

    fn timer(out: &Actions) -> Option<(u64, u64)> {
        out.iter().rev().find_map(|a| match a {
            Action::ArmTimer { generation, token, .. } => Some((*generation, *token)),
            _ => None,
        })
    }

    fn signal(from: &str, generation: u64, event: LinkEvent) -> LinkSignal {
        LinkSignal {
            peer_id: from.to_string(),
            generation,
            event,
        }
    }

    /// Drive alice's link to bob into `connected`
    fn connect(core: &mut MeshCore, out: &mut Actions) -> u64 {
        core.on_presence(join("bob", 1), out);
        let generation = core.engine().table().get("bob").unwrap().generation();
        core.on_link_event(
            signal("bob", generation, LinkEvent::OfferCreated(SessionDescription::offer("v=0"))),
            out,
        );
        let answer = Envelope::answer("bob", "alice", &SessionDescription::answer("v=0")).unwrap();
        core.on_signal(answer, out);
        core.on_link_event(signal("bob", generation, LinkEvent::AnswerApplied), out);
        core.on_link_event(
            signal("bob", generation, LinkEvent::Connectivity(ConnectivityState::Connected)),
            out,
        );
        generation
    }

    #[test]
    fn test_join_ignores_self_and_duplicates() {
        let mut core = core("alice");
        let mut out = Actions::default();
        core.on_presence(join("alice", 1), &mut out);
        assert!(out.is_empty());

        core.on_presence(join("bob", 1), &mut out);
        let generation = core.engine().table().get("bob").unwrap().generation();
        core.on_presence(join("bob", 1), &mut out);
        assert_eq!(core.engine().table().get("bob").unwrap().generation(), generation);
    }

    #[test]
    fn test_rejoin_replaces_link() {
        let mut core = core("alice");
        let mut out = Actions::default();
        let first = connect(&mut core, &mut out);

        let mut out = Actions::default();
        core.on_presence(join("bob", 2), &mut out);
        assert_eq!(disconnects(&out, "bob"), vec![DisconnectReason::Rejoined]);
        let link = core.engine().table().get("bob").unwrap();
        assert!(link.generation() > first);
        assert_eq!(link.state(), LinkState::Negotiating);
    }

    #[test]
    fn test_sync_destroys_missing_peer_once() {
        let mut core = core("alice");
        let mut out = Actions::default();
        core.on_presence(join("bob", 1), &mut out);
        core.on_presence(join("carol", 1), &mut out);

        let mut out = Actions::default();
        core.on_presence(
            PresenceEvent::Sync {
                members: vec![Participant::new("alice", "alice"), Participant::new("bob", "bob").with_joined_at(1)],
            },
            &mut out,
        );
        assert_eq!(disconnects(&out, "carol"), vec![DisconnectReason::MissingFromRoster]);
        assert!(disconnects(&out, "bob").is_empty());
        assert!(!core.engine().table().contains("carol"));

        let mut out = Actions::default();
        core.on_presence(PresenceEvent::Leave { id: "carol".into() }, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_sync_links_new_members() {
        let mut core = core("bob");
        let mut out = Actions::default();
        core.on_presence(
            PresenceEvent::Sync {
                members: vec![Participant::new("carol", "carol"), Participant::new("alice", "alice")],
            },
            &mut out,
        );
        assert_eq!(core.peers().len(), 2);
        // bob initiates towards carol only
        let offers = out
            .iter()
            .filter(|a| matches!(a, Action::Op { op: LinkOp::CreateOffer { .. }, .. }))
            .count();
        assert_eq!(offers, 1);
    }

    #[test]
    fn test_envelope_for_someone_else_ignored() {
        let mut core = core("bob");
        let mut out = Actions::default();
        let offer = Envelope::offer("alice", "carol", &SessionDescription::offer("v=0")).unwrap();
        core.on_signal(offer, &mut out);
        assert!(out.is_empty());
        assert!(core.engine().table().is_empty());
    }

    #[test]
    fn test_stale_completion_discarded() {
        let mut core = core("alice");
        let mut out = Actions::default();
        core.on_presence(join("bob", 1), &mut out);
        let old = core.engine().table().get("bob").unwrap().generation();
        core.on_presence(PresenceEvent::Leave { id: "bob".into() }, &mut out);
        core.on_presence(join("bob", 2), &mut out);

        let mut out = Actions::default();
        core.on_link_event(
            signal("bob", old, LinkEvent::OfferCreated(SessionDescription::offer("v=0"))),
            &mut out,
        );
        core.on_link_event(signal("bob", old, LinkEvent::DataChannelOpen), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_failure_schedules_retry_then_restarts() {
        let mut core = core("alice");
        let mut out = Actions::default();
        let generation = connect(&mut core, &mut out);

        let mut out = Actions::default();
        core.on_link_event(
            signal("bob", generation, LinkEvent::Connectivity(ConnectivityState::Failed)),
            &mut out,
        );
        let link = core.engine().table().get("bob").unwrap();
        assert_eq!(link.state(), LinkState::Failing);
        assert_eq!(link.attempt_count(), 1);

        let (timer_gen, token) = timer(&out).unwrap();
        let mut out = Actions::default();
        core.on_timer("bob", timer_gen, token, &mut out);
        let link = core.engine().table().get("bob").unwrap();
        assert_eq!(link.state(), LinkState::Negotiating);
        assert!(link.generation() > generation);
        assert!(out
            .iter()
            .any(|a| matches!(a, Action::Op { op: LinkOp::CreateOffer { ice_restart: true }, .. })));
    }

    #[test]
    fn test_disconnect_recovers_within_grace() {
        let mut core = core("alice");
        let mut out = Actions::default();
        let generation = connect(&mut core, &mut out);

        let mut out = Actions::default();
        core.on_link_event(
            signal("bob", generation, LinkEvent::Connectivity(ConnectivityState::Disconnected)),
            &mut out,
        );
        let (_, token) = timer(&out).unwrap();
        assert_eq!(core.engine().table().get("bob").unwrap().state(), LinkState::Connected);

        core.on_link_event(
            signal("bob", generation, LinkEvent::Connectivity(ConnectivityState::Connected)),
            &mut out,
        );
        let mut out = Actions::default();
        core.on_timer("bob", generation, token, &mut out);
        assert!(out.is_empty());
        assert_eq!(core.engine().table().get("bob").unwrap().state(), LinkState::Connected);
    }

    #[test]
    fn test_disconnect_without_recovery_fails() {
        let mut core = core("alice");
        let mut out = Actions::default();
        let generation = connect(&mut core, &mut out);

        let mut out = Actions::default();
        core.on_link_event(
            signal("bob", generation, LinkEvent::Connectivity(ConnectivityState::Disconnected)),
            &mut out,
        );
        let (_, token) = timer(&out).unwrap();
        core.on_timer("bob", generation, token, &mut out);
        let link = core.engine().table().get("bob").unwrap();
        assert_eq!(link.state(), LinkState::Failing);
        assert_eq!(link.attempt_count(), 1);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut core = core("alice");
        let mut out = Actions::default();
        core.on_presence(join("bob", 1), &mut out);

        let mut retries = 0;
        for _ in 0..10 {
            let Some(link) = core.engine().table().get("bob") else {
                break;
            };
            let generation = link.generation();
            let mut out = Actions::default();
            core.on_link_event(
                signal("bob", generation, LinkEvent::Connectivity(ConnectivityState::Failed)),
                &mut out,
            );
            if let Some((g, token)) = timer(&out) {
                let mut fired = Actions::default();
                core.on_timer("bob", g, token, &mut fired);
                retries += 1;
            } else {
                assert_eq!(disconnects(&out, "bob"), vec![DisconnectReason::RetriesExhausted]);
            }
        }
        assert_eq!(retries, 5);
        assert!(core.engine().table().get("bob").is_none());
    }

    #[test]
    fn test_broadcast_fallback_when_channel_closed() {
        let mut core = core("alice");
        let mut out = Actions::default();
        core.on_presence(join("bob", 1), &mut out);

        let mut out = Actions::default();
        let sent = core
            .send_app_message(AppMessage::text("alice", "hi"), &mut out)
            .unwrap();
        assert!(sent.id().is_some());
        assert!(out.iter().any(|a| matches!(a, Action::Broadcast(_))));
        assert!(!out.iter().any(|a| matches!(a, Action::Op { op: LinkOp::SendData(_), .. })));

        // The relay echo of our own broadcast is dropped
        let mut echo = Actions::default();
        core.on_broadcast(sent.to_value().unwrap(), &mut echo);
        assert!(echo.is_empty());
    }

    #[test]
    fn test_data_channel_used_when_open() {
        let mut core = core("alice");
        let mut out = Actions::default();
        let generation = connect(&mut core, &mut out);
        core.on_link_event(signal("bob", generation, LinkEvent::DataChannelOpen), &mut out);

        let mut out = Actions::default();
        core.send_app_message(AppMessage::text("alice", "hi"), &mut out).unwrap();
        assert!(out.iter().any(|a| matches!(a, Action::Op { op: LinkOp::SendData(_), .. })));
        assert!(!out.iter().any(|a| matches!(a, Action::Broadcast(_))));
    }

    #[test]
    fn test_shutdown_ends_every_link() {
        let mut core = core("bob");
        let mut out = Actions::default();
        core.on_presence(join("alice", 1), &mut out);
        core.on_presence(join("carol", 1), &mut out);

        let mut out = Actions::default();
        core.shutdown(&mut out);
        assert_eq!(disconnects(&out, "alice"), vec![DisconnectReason::SessionEnded]);
        assert_eq!(disconnects(&out, "carol"), vec![DisconnectReason::SessionEnded]);
        assert!(core.peers().is_empty());
    }

    #[test]
    fn test_randomized_inputs_keep_one_live_worker_per_peer() {
        let ids = ["alice", "bob", "carol", "dan", "erin"];

        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(0x5eed + seed);
            let mut core = core("carol");
            // Workers the driver would be running, and the timer it would hold
            let mut workers: HashMap<String, HashSet<u64>> = HashMap::new();
            let mut timers: HashMap<String, (u64, u64)> = HashMap::new();

            for step in 0..500 {
                let peer = ids[rng.gen_range(0..ids.len())];
                let current = core.engine().table().get(peer).map(|l| l.generation());
                // Mostly the live generation, sometimes a stale one
                let generation = match current {
                    Some(g) if rng.gen_bool(0.8) => g,
                    Some(g) => g.saturating_sub(1),
                    None => rng.gen_range(0..4),
                };
                let mut out = Actions::default();
                match rng.gen_range(0..12) {
                    0 => core.on_presence(join(peer, rng.gen_range(0..3)), &mut out),
                    1 => core.on_presence(PresenceEvent::Leave { id: peer.into() }, &mut out),
                    2 => {
                        let offer = Envelope::offer(peer, "carol", &SessionDescription::offer("v=0")).unwrap();
                        core.on_signal(offer, &mut out);
                    }
                    3 => {
                        let answer = Envelope::answer(peer, "carol", &SessionDescription::answer("v=0")).unwrap();
                        core.on_signal(answer, &mut out);
                    }
                    4 => {
                        let candidate = IceCandidate::new(format!("candidate:{step} 1 udp 1 10.0.0.1 9 typ host"));
                        let envelope = Envelope::candidate(peer, "carol", &candidate).unwrap();
                        core.on_signal(envelope, &mut out);
                    }
                    5 => {
                        let members = ids
                            .iter()
                            .filter(|_| rng.gen_bool(0.5))
                            .map(|id| Participant::new(*id, *id))
                            .collect();
                        core.on_presence(PresenceEvent::Sync { members }, &mut out);
                    }
                    6 => {
                        let state = match rng.gen_range(0..4) {
                            0 => ConnectivityState::Connected,
                            1 => ConnectivityState::Disconnected,
                            2 => ConnectivityState::Failed,
                            _ => ConnectivityState::Closed,
                        };
                        core.on_link_event(signal(peer, generation, LinkEvent::Connectivity(state)), &mut out);
                    }
                    7 => {
                        let event = match rng.gen_range(0..3) {
                            0 => LinkEvent::OfferCreated(SessionDescription::offer("v=0")),
                            1 => LinkEvent::AnswerCreated(SessionDescription::answer("v=0")),
                            _ => LinkEvent::AnswerApplied,
                        };
                        core.on_link_event(signal(peer, generation, event), &mut out);
                    }
                    8 => {
                        let event = match rng.gen_range(0..3) {
                            0 => LinkEvent::DataChannelOpen,
                            1 => LinkEvent::DataChannelClosed,
                            _ => LinkEvent::OpenFailed("refused".to_string()),
                        };
                        core.on_link_event(signal(peer, generation, event), &mut out);
                    }
                    9 | 10 => {
                        if let Some((timer_generation, token)) = timers.remove(peer) {
                            core.on_timer(peer, timer_generation, token, &mut out);
                        }
                    }
                    _ => {
                        if rng.gen_bool(0.1) {
                            core.shutdown(&mut out);
                        }
                    }
                }

                for action in out.iter() {
                    match action {
                        Action::OpenLink { peer_id, generation, .. } => {
                            workers.entry(peer_id.clone()).or_default().insert(*generation);
                        }
                        Action::CloseLink { peer_id, generation } => {
                            if let Some(live) = workers.get_mut(peer_id) {
                                live.remove(generation);
                            }
                        }
                        Action::ArmTimer { peer_id, generation, token, .. } => {
                            timers.insert(peer_id.clone(), (*generation, *token));
                        }
                        Action::CancelTimer { peer_id } => {
                            timers.remove(peer_id);
                        }
                        _ => {}
                    }
                }

                for id in ids {
                    let live: Vec<u64> = workers.get(id).map(|s| s.iter().copied().collect()).unwrap_or_default();
                    let table = core.engine().table().get(id).map(|l| l.generation());
                    match table {
                        Some(g) => assert_eq!(live, vec![g], "seed {seed} step {step} peer {id}"),
                        None => assert!(live.is_empty(), "seed {seed} step {step} peer {id}: {live:?}"),
                    }
                }
                assert!(workers.get("carol").map_or(true, HashSet::is_empty));
                assert!(core.peers().iter().all(|p| p.state != LinkState::Closed));
            }
        }
    }
}
