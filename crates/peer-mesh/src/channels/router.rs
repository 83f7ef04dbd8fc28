//! Routing of application messages
//!
//! Outbound messages go over every open data channel; peers without one
//! are reached through the relay broadcast. Inbound messages from either
//! path are filtered (own broadcasts, unknown kinds, oversized text) and
//! stamped messages are de-duplicated so each is delivered once.

use super::messages::AppMessage;
use crate::participant::PeerId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace};

/// Path an inbound message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryPath {
    /// Peer data channel
    DataChannel,
    /// Relay broadcast fallback
    Broadcast,
}

/// Where an outbound message should go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundRoute {
    /// Peers reached over their data channel
    pub data_channel: Vec<PeerId>,
    /// Whether the relay broadcast is needed for the rest
    pub broadcast: bool,
}

/// Bounded set of recently seen message keys
#[derive(Debug)]
struct RecentKeys {
    order: VecDeque<String>,
    keys: HashSet<String>,
    capacity: usize,
}

impl RecentKeys {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember `key`; `false` if it was already present
    fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

/// Application message dispatcher for one session
#[derive(Debug)]
pub struct DataChannelRouter {
    local_id: PeerId,
    max_text_len: usize,
    recent: RecentKeys,
}

impl DataChannelRouter {
    /// Create a router for `local_id`
    pub fn new(local_id: impl Into<String>, max_text_len: usize, dedupe_window: usize) -> Self {
        Self {
            local_id: local_id.into(),
            max_text_len,
            recent: RecentKeys::new(dedupe_window.max(1)),
        }
    }

    /// Validate and stamp an outbound message
    ///
    /// Assigns a message id when missing so receivers can de-duplicate
    /// across paths.
    pub fn prepare_outbound(&mut self, mut message: AppMessage) -> Result<AppMessage> {
        if message.sender() != self.local_id {
            return Err(Error::InvalidData(format!(
                "message sender {} is not the local participant {}",
                message.sender(),
                self.local_id
            )));
        }
        if message.text_len() > self.max_text_len {
            return Err(Error::InvalidData(format!(
                "text of {} characters exceeds limit of {}",
                message.text_len(),
                self.max_text_len
            )));
        }
        let id = match message.id() {
            Some(id) => id.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                message.set_id(id.clone());
                id
            }
        };
        self.recent.insert(id);
        Ok(message)
    }

    /// Decide the paths for an outbound message
    ///
    /// `open` are peers with an open data channel, `known` every peer the
    /// session knows about (linked or listed by presence).
    pub fn route(&self, open: &[PeerId], known: &[PeerId]) -> OutboundRoute {
        let broadcast = known
            .iter()
            .any(|peer| peer != &self.local_id && !open.contains(peer));
        OutboundRoute {
            data_channel: open.to_vec(),
            broadcast,
        }
    }

    /// Filter an inbound wire value; `Some` means deliver it
    pub fn accept_inbound(
        &mut self,
        value: serde_json::Value,
        path: DeliveryPath,
    ) -> Option<AppMessage> {
        let message = match AppMessage::from_value(value) {
            Ok(Some(message)) => message,
            Ok(None) => {
                trace!(?path, "Ignoring message of unknown kind");
                return None;
            }
            Err(e) => {
                debug!(?path, error = %e, "Dropping malformed app message");
                return None;
            }
        };
        self.accept(message, path)
    }

    /// Filter an inbound data channel payload
    ///
    /// Payloads over [`MAX_MESSAGE_SIZE`](super::MAX_MESSAGE_SIZE) are dropped before decoding.
    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Option<AppMessage> {
        let path = DeliveryPath::DataChannel;
        match AppMessage::from_bytes(bytes) {
            Ok(Some(message)) => self.accept(message, path),
            Ok(None) => {
                trace!(?path, "Ignoring message of unknown kind");
                None
            }
            Err(e) => {
                debug!(len = bytes.len(), error = %e, "Dropping data channel payload");
                None
            }
        }
    }

    /// Deliver a decoded message unless it is ours, oversized or already seen
    ///
    /// When a message reaches us on both paths, the first copy wins and is
    /// reported with the path it came on; the later copy is dropped.
    fn accept(&mut self, message: AppMessage, path: DeliveryPath) -> Option<AppMessage> {
        if message.sender() == self.local_id {
            trace!(?path, "Dropping own message");
            return None;
        }
        if message.text_len() > self.max_text_len {
            debug!(
                sender = message.sender(),
                len = message.text_len(),
                "Dropping oversized text message"
            );
            return None;
        }
        if let Some(key) = message.dedupe_key() {
            if !self.recent.insert(key.to_string()) {
                trace!(?path, key, "Dropping duplicate message");
                return None;
            }
        }
        Some(message)
    }
}
