//! Early candidate buffering
//!
//! Candidates that arrive before the remote description is applied are
//! held per peer in arrival order and handed over exactly once when the
//! link's descriptions are complete.

use crate::participant::PeerId;
use crate::signaling::IceCandidate;
use std::collections::{HashMap, VecDeque};
use tracing::{trace, warn};

/// Per-peer queues of pending candidates
#[derive(Debug)]
pub struct CandidateBuffer {
    pending: HashMap<PeerId, VecDeque<IceCandidate>>,
    capacity: usize,
}

impl CandidateBuffer {
    /// Create a buffer holding at most `capacity` candidates per peer
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            capacity,
        }
    }

    /// Queue a candidate; returns `false` if the peer's queue is full
    pub fn enqueue(&mut self, peer_id: &str, candidate: IceCandidate) -> bool {
        let queue = self.pending.entry(peer_id.to_string()).or_default();
        if queue.len() >= self.capacity {
            warn!(
                peer_id,
                capacity = self.capacity,
                "Candidate buffer full, dropping newest candidate"
            );
            return false;
        }
        queue.push_back(candidate);
        trace!(peer_id, queued = queue.len(), "Buffered early candidate");
        true
    }

    /// Hand every queued candidate to `apply` in arrival order
    ///
    /// The queue is removed before the first call to `apply`, so a second
    /// drain returns 0 without invoking it.
    pub fn drain_into<F>(&mut self, peer_id: &str, mut apply: F) -> usize
    where
        F: FnMut(IceCandidate),
    {
        let Some(queue) = self.pending.remove(peer_id) else {
            return 0;
        };
        let count = queue.len();
        for candidate in queue {
            apply(candidate);
        }
        count
    }

    /// Drop everything queued for a peer
    pub fn discard(&mut self, peer_id: &str) -> usize {
        self.pending.remove(peer_id).map(|q| q.len()).unwrap_or(0)
    }

    /// Number of candidates queued for a peer
    pub fn len(&self, peer_id: &str) -> usize {
        self.pending.get(peer_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Whether anything is queued for a peer
    pub fn is_empty(&self, peer_id: &str) -> bool {
        self.len(peer_id) == 0
    }

    /// Peers with queued candidates
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.pending.keys().map(String::as_str)
    }
}
