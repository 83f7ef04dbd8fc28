//! Peer link ownership

use super::link::{PeerLink, Role};
use crate::participant::PeerId;
use crate::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, info};

/// The single owner of every [`PeerLink`] in a session
///
/// Holds at most one link per peer id. Inserting for an id that already has
/// a link closes and returns the old one first. Each link, and each restart
/// of a link, receives a fresh generation from a counter that never goes
/// backwards, so work tagged with an older generation can be recognised as
/// stale.
#[derive(Debug)]
pub struct PeerLinkTable {
    links: HashMap<PeerId, PeerLink>,
    next_generation: u64,
    max_peers: usize,
}

impl PeerLinkTable {
    /// Create a table admitting at most `max_peers` links
    pub fn new(max_peers: usize) -> Self {
        Self {
            links: HashMap::new(),
            next_generation: 0,
            max_peers,
        }
    }

    /// Hand out the next generation
    pub(crate) fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Register a new link, replacing (and closing) any existing one
    ///
    /// Returns the replaced link, already in `closed`.
    pub fn insert(&mut self, peer_id: &str, role: Role) -> (u64, Option<PeerLink>) {
        let replaced = self.remove(peer_id);
        let generation = self.bump_generation();
        info!(peer_id, generation, ?role, "Adding peer link");
        self.links
            .insert(peer_id.to_string(), PeerLink::new(peer_id, generation, role));
        (generation, replaced)
    }

    /// Remove a link and close it
    pub fn remove(&mut self, peer_id: &str) -> Option<PeerLink> {
        let mut link = self.links.remove(peer_id)?;
        info!(peer_id, generation = link.generation, "Removing peer link");
        link.close();
        Some(link)
    }

    /// Get a link by peer id
    pub fn get(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    /// Get a mutable link by peer id
    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerLink> {
        self.links.get_mut(peer_id)
    }

    /// Get a link only if it still carries `generation`
    pub fn current(&mut self, peer_id: &str, generation: u64) -> Option<&mut PeerLink> {
        match self.links.get_mut(peer_id) {
            Some(link) if link.generation == generation => Some(link),
            Some(link) => {
                debug!(
                    peer_id,
                    stale = generation,
                    current = link.generation,
                    "Discarding stale link work"
                );
                None
            }
            None => None,
        }
    }

    /// Like [`get`](Self::get) but with a typed error
    pub fn require(&self, peer_id: &str) -> Result<&PeerLink> {
        self.get(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))
    }

    /// Check if a link exists
    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    /// Number of links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Whether a new peer may be admitted
    pub fn has_capacity(&self) -> bool {
        self.links.len() < self.max_peers
    }

    /// Ids of all linked peers
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.links.keys().cloned().collect()
    }

    /// Iterate over all links
    pub fn iter(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    /// Remove and close every link
    pub fn clear(&mut self) -> Vec<PeerLink> {
        debug!(count = self.links.len(), "Clearing all peer links");
        self.links
            .drain()
            .map(|(_, mut link)| {
                link.close();
                link
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LinkState;

    #[test]
    fn test_insert_and_get() {
        let mut table = PeerLinkTable::new(10);
        let (generation, replaced) = table.insert("bob", Role::Initiator);
        assert!(replaced.is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("bob").unwrap().generation(), generation);
        assert!(table.require("carol").is_err());
    }

    #[test]
    fn test_replace_closes_prior_link() {
        let mut table = PeerLinkTable::new(10);
        let (first, _) = table.insert("bob", Role::Initiator);
        let (second, replaced) = table.insert("bob", Role::Responder);

        let replaced = replaced.unwrap();
        assert_eq!(replaced.state(), LinkState::Closed);
        assert_eq!(replaced.generation(), first);
        assert!(second > first);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("bob").unwrap().role(), Role::Responder);
    }

    #[test]
    fn test_current_rejects_stale_generation() {
        let mut table = PeerLinkTable::new(10);
        let (old, _) = table.insert("bob", Role::Initiator);
        let (new, _) = table.insert("bob", Role::Initiator);
        assert!(table.current("bob", old).is_none());
        assert!(table.current("bob", new).is_some());
        assert!(table.current("carol", new).is_none());
    }

    #[test]
    fn test_generations_never_repeat() {
        let mut table = PeerLinkTable::new(10);
        let (a, _) = table.insert("bob", Role::Initiator);
        table.remove("bob");
        let (b, _) = table.insert("bob", Role::Initiator);
        let c = table.bump_generation();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_capacity_and_clear() {
        let mut table = PeerLinkTable::new(2);
        table.insert("bob", Role::Initiator);
        assert!(table.has_capacity());
        table.insert("carol", Role::Initiator);
        assert!(!table.has_capacity());

        let closed = table.clear();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|l| l.state() == LinkState::Closed));
        assert!(table.is_empty());
    }
}
