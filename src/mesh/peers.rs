//! Runtime peer registry.
//!
//! Backed by a `DashMap` so the service handle answers peer queries without
//! a round-trip to the engine task; the engine task is the only writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// How a peer is currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Outbound,
    Inbound,
}

/// What we know about a peer at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub nickname: String,
    pub last_seen: SystemTime,
    /// Reachable over a link we initiated.
    pub via_outbound: bool,
    /// Reachable over a central subscribed to us.
    pub via_inbound: bool,
}

impl PeerInfo {
    fn new(peer_id: String, nickname: String) -> Self {
        Self {
            peer_id,
            nickname,
            last_seen: SystemTime::now(),
            via_outbound: false,
            via_inbound: false,
        }
    }

    /// Known through a live link in either direction.
    pub fn is_connected(&self) -> bool {
        self.via_outbound || self.via_inbound
    }
}

/// Shared peer map. Cloning is cheap and clones observe the same registry.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<String, PeerInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announce: upserts the peer and refreshes its nickname.
    pub fn record_announce(&self, peer_id: &str, nickname: &str) {
        let mut entry = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerInfo::new(peer_id.to_string(), nickname.to_string()));
        entry.nickname = nickname.to_string();
        entry.last_seen = SystemTime::now();
    }

    /// Mark the peer reachable over a link direction.
    pub fn bind_link(&self, peer_id: &str, direction: LinkDirection) {
        if let Some(mut entry) = self.peers.get_mut(peer_id) {
            match direction {
                LinkDirection::Outbound => entry.via_outbound = true,
                LinkDirection::Inbound => entry.via_inbound = true,
            }
            entry.last_seen = SystemTime::now();
        }
    }

    /// Refresh the inactivity clock for a peer we just heard from.
    pub fn touch(&self, peer_id: &str) {
        if let Some(mut entry) = self.peers.get_mut(peer_id) {
            entry.last_seen = SystemTime::now();
        }
    }

    /// Forget a peer entirely (leave, or its last link went away).
    pub fn remove(&self, peer_id: &str) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    pub fn nickname(&self, peer_id: &str) -> Option<String> {
        self.peers.get(peer_id).map(|p| p.nickname.clone())
    }

    /// Peer ids with a live link in either direction.
    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn nicknames(&self) -> HashMap<String, String> {
        self.peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().nickname.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop linkless peers that have been silent past the timeout.
    /// Returns the evicted ids.
    pub fn evict_inactive(&self, timeout: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        self.peers.retain(|peer_id, info| {
            let stale = !info.is_connected()
                && info
                    .last_seen
                    .elapsed()
                    .map(|age| age > timeout)
                    .unwrap_or(false);
            if stale {
                evicted.push(peer_id.clone());
            }
            !stale
        });
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_upserts_and_renames() {
        let registry = PeerRegistry::new();
        registry.record_announce("aa00aa00aa00aa00", "first");
        registry.record_announce("aa00aa00aa00aa00", "second");
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.nickname("aa00aa00aa00aa00"),
            Some("second".to_string())
        );
    }

    #[test]
    fn connected_ids_require_a_link() {
        let registry = PeerRegistry::new();
        registry.record_announce("aaaaaaaaaaaaaaaa", "a");
        registry.record_announce("bbbbbbbbbbbbbbbb", "b");
        registry.bind_link("bbbbbbbbbbbbbbbb", LinkDirection::Inbound);

        assert_eq!(registry.connected_ids(), vec!["bbbbbbbbbbbbbbbb"]);
    }

    #[test]
    fn eviction_spares_linked_peers() {
        let registry = PeerRegistry::new();
        registry.record_announce("aaaaaaaaaaaaaaaa", "a");
        registry.bind_link("aaaaaaaaaaaaaaaa", LinkDirection::Outbound);
        registry.record_announce("bbbbbbbbbbbbbbbb", "b");

        // Nothing is old enough yet.
        assert!(registry.evict_inactive(Duration::from_secs(30)).is_empty());

        // With a zero timeout the linkless peer goes, the linked one stays.
        let evicted = registry.evict_inactive(Duration::ZERO);
        assert_eq!(evicted, vec!["bbbbbbbbbbbbbbbb"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_forgets() {
        let registry = PeerRegistry::new();
        registry.record_announce("aaaaaaaaaaaaaaaa", "a");
        assert!(registry.remove("aaaaaaaaaaaaaaaa"));
        assert!(!registry.remove("aaaaaaaaaaaaaaaa"));
        assert!(registry.nickname("aaaaaaaaaaaaaaaa").is_none());
    }
}
