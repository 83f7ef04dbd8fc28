//! In-process loopback backend
//!
//! A [`MemoryNetwork`] pairs connections by `(owner, peer)`. A pair reports
//! `connected` once both ends hold a local and a remote description and at
//! least one remote candidate, unless the pair is blocked. Tests use the
//! failure hooks to simulate broken paths and the statistics to check what
//! the mesh asked the backend to do.

use super::{ConnectivityState, LinkEvent, LinkEventSink, LinkSpec, RtcBackend, RtcConnection};
use crate::media::RemoteStreamHandle;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

type PairKey = (String, String);

fn key(owner: &str, peer: &str) -> PairKey {
    (owner.to_string(), peer.to_string())
}

fn unordered(a: &str, b: &str) -> PairKey {
    if a <= b {
        key(a, b)
    } else {
        key(b, a)
    }
}

struct Endpoint {
    id: u64,
    sink: LinkEventSink,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    wants_channel: bool,
    has_media: bool,
    outgoing_enabled: bool,
    connected: bool,
    channel_open: bool,
}

impl Endpoint {
    fn ready(&self) -> bool {
        self.local.is_some() && self.remote.is_some() && self.remote_candidates > 0
    }
}

/// Counters describing what connections were asked to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// `(owner, peer, ice_restart)` per created offer
    pub offers: Vec<(String, String, bool)>,
    /// `(owner, peer)` per created answer
    pub answers: Vec<(String, String)>,
    /// `(owner, peer, candidate)` per applied remote candidate
    pub applied_candidates: Vec<(String, String, IceCandidate)>,
    /// Candidates rejected because no remote description was set
    pub early_candidate_errors: usize,
    /// Connections opened
    pub opened: usize,
    /// Connections closed
    pub closed: usize,
}

impl NetworkStats {
    /// Offers created by `owner`
    pub fn offers_from(&self, owner: &str) -> usize {
        self.offers.iter().filter(|(o, _, _)| o == owner).count()
    }

    /// Answers created by `owner`
    pub fn answers_from(&self, owner: &str) -> usize {
        self.answers.iter().filter(|(o, _)| o == owner).count()
    }

    /// Remote candidates `owner` applied for `peer`, in order
    pub fn candidates_applied(&self, owner: &str, peer: &str) -> Vec<IceCandidate> {
        self.applied_candidates
            .iter()
            .filter(|(o, p, _)| o == owner && p == peer)
            .map(|(_, _, c)| c.clone())
            .collect()
    }
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PairKey, Endpoint>,
    blocked: HashSet<PairKey>,
    refused: HashSet<String>,
    next_id: u64,
    stats: NetworkStats,
}

impl NetworkState {
    fn endpoint(&mut self, owner: &str, peer: &str, id: u64) -> Result<&mut Endpoint> {
        match self.endpoints.get_mut(&key(owner, peer)) {
            Some(ep) if ep.id == id => Ok(ep),
            _ => Err(Error::WebRtcError(format!(
                "connection {} -> {} is closed",
                owner, peer
            ))),
        }
    }

    fn try_connect(&mut self, a: &str, b: &str) {
        if self.blocked.contains(&unordered(a, b)) {
            return;
        }
        let (ab, ba) = (key(a, b), key(b, a));
        let (Some(left), Some(right)) = (self.endpoints.get(&ab), self.endpoints.get(&ba)) else {
            return;
        };
        if !left.ready() || !right.ready() || (left.connected && right.connected) {
            return;
        }
        let channel = left.wants_channel || right.wants_channel;
        let (left_media, right_media) = (left.has_media, right.has_media);

        for (this, other_media, other) in [(&ab, right_media, b), (&ba, left_media, a)] {
            if let Some(ep) = self.endpoints.get_mut(this) {
                ep.connected = true;
                ep.sink
                    .emit(LinkEvent::Connectivity(ConnectivityState::Connected));
                if channel && !ep.channel_open {
                    ep.channel_open = true;
                    ep.sink.emit(LinkEvent::DataChannelOpen);
                }
                if other_media {
                    ep.sink.emit(LinkEvent::RemoteStream(RemoteStreamHandle::new(
                        format!("{}-audio", other),
                        "audio",
                    )));
                }
            }
        }
        debug!(a, b, "Memory pair connected");
    }

    fn emit_pair(&mut self, a: &str, b: &str, state: ConnectivityState) {
        for k in [key(a, b), key(b, a)] {
            if let Some(ep) = self.endpoints.get_mut(&k) {
                ep.connected = state == ConnectivityState::Connected;
                if state == ConnectivityState::Failed && ep.channel_open {
                    ep.channel_open = false;
                    ep.sink.emit(LinkEvent::DataChannelClosed);
                }
                ep.sink.emit(LinkEvent::Connectivity(state));
            }
        }
    }

    fn local_candidate(id: u64) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
            id,
            40_000 + id
        ))
    }
}

/// Shared loopback network
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Backend for participant `owner`
    pub fn backend(self: &Arc<Self>, owner: &str) -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend {
            network: Arc::clone(self),
            owner: owner.to_string(),
        })
    }

    /// Prevent `a` and `b` from ever connecting
    pub fn block(&self, a: &str, b: &str) {
        self.state.lock().blocked.insert(unordered(a, b));
    }

    /// Lift a block and connect the pair if it is ready
    pub fn unblock(&self, a: &str, b: &str) {
        let mut state = self.state.lock();
        state.blocked.remove(&unordered(a, b));
        state.try_connect(a, b);
    }

    /// Make every `open` by `owner` fail
    pub fn refuse_opens(&self, owner: &str) {
        self.state.lock().refused.insert(owner.to_string());
    }

    /// Report `failed` on both ends of a pair
    pub fn fail(&self, a: &str, b: &str) {
        self.state.lock().emit_pair(a, b, ConnectivityState::Failed);
    }

    /// Report `disconnected` on both ends of a pair
    pub fn disconnect(&self, a: &str, b: &str) {
        self.state
            .lock()
            .emit_pair(a, b, ConnectivityState::Disconnected);
    }

    /// Report `connected` again on both ends of a pair
    pub fn restore(&self, a: &str, b: &str) {
        self.state.lock().emit_pair(a, b, ConnectivityState::Connected);
    }

    /// Whether `owner` holds an open connection towards `peer`
    pub fn is_open(&self, owner: &str, peer: &str) -> bool {
        self.state.lock().endpoints.contains_key(&key(owner, peer))
    }

    /// Whether outgoing audio from `owner` to `peer` is enabled
    pub fn outgoing_enabled(&self, owner: &str, peer: &str) -> Option<bool> {
        self.state
            .lock()
            .endpoints
            .get(&key(owner, peer))
            .map(|ep| ep.outgoing_enabled)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> NetworkStats {
        self.state.lock().stats.clone()
    }
}

/// [`RtcBackend`] for one participant on a [`MemoryNetwork`]
pub struct MemoryBackend {
    network: Arc<MemoryNetwork>,
    owner: String,
}

#[async_trait]
impl RtcBackend for MemoryBackend {
    async fn open(&self, spec: LinkSpec, events: LinkEventSink) -> Result<Box<dyn RtcConnection>> {
        let mut state = self.network.state.lock();
        if state.refused.contains(&self.owner) {
            return Err(Error::WebRtcError(format!(
                "{} cannot open connections",
                self.owner
            )));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.stats.opened += 1;
        state.endpoints.insert(
            key(&self.owner, &spec.peer_id),
            Endpoint {
                id,
                sink: events,
                local: None,
                remote: None,
                remote_candidates: 0,
                wants_channel: spec.create_data_channel,
                has_media: spec.local_media.is_some(),
                outgoing_enabled: spec
                    .local_media
                    .as_ref()
                    .map(|m| m.is_enabled())
                    .unwrap_or(false),
                connected: false,
                channel_open: false,
            },
        );
        trace!(owner = %self.owner, peer = %spec.peer_id, id, "Memory connection opened");
        Ok(Box::new(MemoryConnection {
            network: Arc::clone(&self.network),
            owner: self.owner.clone(),
            peer: spec.peer_id,
            id,
        }))
    }
}

struct MemoryConnection {
    network: Arc<MemoryNetwork>,
    owner: String,
    peer: String,
    id: u64,
}

#[async_trait]
impl RtcConnection for MemoryConnection {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription> {
        let mut state = self.network.state.lock();
        let offer = SessionDescription::offer(format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\na=ice-restart:{}\r\n",
            self.owner, self.id, ice_restart
        ));
        let ep = state.endpoint(&self.owner, &self.peer, self.id)?;
        ep.local = Some(offer.clone());
        ep.sink
            .emit(LinkEvent::LocalCandidate(NetworkState::local_candidate(self.id)));
        state
            .stats
            .offers
            .push((self.owner.clone(), self.peer.clone(), ice_restart));
        Ok(offer)
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.sdp_type != SdpType::Offer || !offer.sdp.starts_with("v=0") {
            return Err(Error::SdpError("not a valid offer".to_string()));
        }
        let mut state = self.network.state.lock();
        let answer = SessionDescription::answer(format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\n",
            self.owner, self.id
        ));
        let ep = state.endpoint(&self.owner, &self.peer, self.id)?;
        ep.remote = Some(offer);
        ep.local = Some(answer.clone());
        ep.sink
            .emit(LinkEvent::LocalCandidate(NetworkState::local_candidate(self.id)));
        state
            .stats
            .answers
            .push((self.owner.clone(), self.peer.clone()));
        state.try_connect(&self.owner, &self.peer);
        Ok(answer)
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if answer.sdp_type != SdpType::Answer || !answer.sdp.starts_with("v=0") {
            return Err(Error::SdpError("not a valid answer".to_string()));
        }
        let mut state = self.network.state.lock();
        let ep = state.endpoint(&self.owner, &self.peer, self.id)?;
        match &ep.local {
            Some(local) if local.sdp_type == SdpType::Offer => {}
            _ => {
                return Err(Error::SdpError(
                    "answer without a pending local offer".to_string(),
                ))
            }
        }
        ep.remote = Some(answer);
        state.try_connect(&self.owner, &self.peer);
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.network.state.lock();
        let ep = state.endpoint(&self.owner, &self.peer, self.id)?;
        if ep.remote.is_none() {
            state.stats.early_candidate_errors += 1;
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        ep.remote_candidates += 1;
        state
            .stats
            .applied_candidates
            .push((self.owner.clone(), self.peer.clone(), candidate));
        state.try_connect(&self.owner, &self.peer);
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> Result<()> {
        let mut state = self.network.state.lock();
        if !state.endpoint(&self.owner, &self.peer, self.id)?.channel_open {
            return Err(Error::DataChannelError("data channel not open".to_string()));
        }
        match state.endpoints.get(&key(&self.peer, &self.owner)) {
            Some(remote) if remote.channel_open => {
                remote.sink.emit(LinkEvent::DataMessage(data));
                Ok(())
            }
            _ => Err(Error::DataChannelError(
                "remote data channel not open".to_string(),
            )),
        }
    }

    async fn set_outgoing_enabled(&mut self, enabled: bool) -> Result<()> {
        let mut state = self.network.state.lock();
        state.endpoint(&self.owner, &self.peer, self.id)?.outgoing_enabled = enabled;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.network.state.lock();
        let k = key(&self.owner, &self.peer);
        if state.endpoints.get(&k).map(|ep| ep.id) == Some(self.id) {
            state.endpoints.remove(&k);
            state.stats.closed += 1;
            trace!(owner = %self.owner, peer = %self.peer, id = self.id, "Memory connection closed");
        }
        Ok(())
    }
}
