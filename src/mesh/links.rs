//! Dual-role link state.
//!
//! Outbound links track devices we connect to as a central; inbound links
//! track centrals subscribed to our hosted characteristic. Both maps are
//! owned by the engine task; nothing here touches the radio.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::debug;
use uuid::Uuid;

use crate::config::{
    CONNECT_RATE_LIMIT, DEFAULT_FRAGMENT_SIZE, MAX_OUTBOUND_LINKS, PENDING_NOTIFY_CAP,
    RSSI_CUTOFF_DBM,
};
use crate::protocol::peer_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    Idle,
    Connecting,
    Connected,
    Closing,
}

/// One candidate or established outgoing link.
#[derive(Debug)]
pub struct OutboundLink {
    pub device_uuid: String,
    pub characteristic: Option<Uuid>,
    pub peer_id: Option<String>,
    pub state: OutboundState,
    pub last_attempt: Instant,
    pub max_write_len: Option<usize>,
}

/// A central subscribed to our characteristic.
#[derive(Debug)]
pub struct InboundLink {
    pub central_uuid: String,
    pub peer_id: Option<String>,
}

/// Why a discovery was not turned into a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectVerdict {
    Proceed,
    BudgetExhausted,
    RateLimited,
    WeakSignal,
    NotConnectable,
    AlreadyTracked,
    /// The tie-break says the other side initiates.
    YieldToPeer,
}

pub struct LinkManager {
    local_peer_id: String,
    outbound: HashMap<String, OutboundLink>,
    inbound: HashMap<String, InboundLink>,
    last_connect_attempt: Option<Instant>,
    pending_notifies: VecDeque<(Vec<u8>, Vec<String>)>,
}

impl LinkManager {
    pub fn new(local_peer_id: String) -> Self {
        Self {
            local_peer_id,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            last_connect_attempt: None,
            pending_notifies: VecDeque::new(),
        }
    }

    // --- initiator role ---

    /// Gate a discovery through budget, rate limit, signal strength and the
    /// mutual-exclusion tie-break, in that order.
    pub fn evaluate_discovery(
        &self,
        device_uuid: &str,
        rssi: i16,
        connectable: bool,
        now: Instant,
    ) -> ConnectVerdict {
        if let Some(link) = self.outbound.get(device_uuid) {
            if link.state != OutboundState::Idle {
                return ConnectVerdict::AlreadyTracked;
            }
        }

        let active = self
            .outbound
            .values()
            .filter(|l| matches!(l.state, OutboundState::Connecting | OutboundState::Connected))
            .count();
        if active >= MAX_OUTBOUND_LINKS {
            return ConnectVerdict::BudgetExhausted;
        }

        if let Some(last) = self.last_connect_attempt {
            if now.duration_since(last) < CONNECT_RATE_LIMIT {
                return ConnectVerdict::RateLimited;
            }
        }

        if rssi <= RSSI_CUTOFF_DBM {
            return ConnectVerdict::WeakSignal;
        }
        if !connectable {
            return ConnectVerdict::NotConnectable;
        }

        // Both sides rank the pair the same way, so exactly one initiates.
        let candidate = peer_id::candidate_for_device(device_uuid);
        if self.local_peer_id.as_str() <= candidate.as_str() {
            return ConnectVerdict::YieldToPeer;
        }

        ConnectVerdict::Proceed
    }

    /// Track a connect attempt that is about to be issued.
    pub fn begin_connect(&mut self, device_uuid: &str, now: Instant) {
        self.last_connect_attempt = Some(now);
        self.outbound.insert(
            device_uuid.to_string(),
            OutboundLink {
                device_uuid: device_uuid.to_string(),
                characteristic: None,
                peer_id: None,
                state: OutboundState::Connecting,
                last_attempt: now,
                max_write_len: None,
            },
        );
    }

    /// The write characteristic is usable: the link counts as Connected.
    pub fn mark_connected(
        &mut self,
        device_uuid: &str,
        characteristic: Uuid,
        max_write_len: usize,
    ) -> bool {
        match self.outbound.get_mut(device_uuid) {
            Some(link) => {
                link.characteristic = Some(characteristic);
                link.max_write_len = Some(max_write_len);
                link.state = OutboundState::Connected;
                true
            }
            None => false,
        }
    }

    /// Drop an outbound link; returns the peer id that was bound to it.
    pub fn remove_outbound(&mut self, device_uuid: &str) -> Option<String> {
        self.outbound
            .remove(device_uuid)
            .and_then(|link| link.peer_id)
    }

    /// Whether the device is still mid-handshake (for connect timeouts).
    pub fn is_connecting(&self, device_uuid: &str) -> bool {
        self.outbound
            .get(device_uuid)
            .map(|l| l.state == OutboundState::Connecting)
            .unwrap_or(false)
    }

    /// Bind an announced peer id to the outbound link that carried it.
    /// Returns true on first binding.
    pub fn bind_outbound_peer(&mut self, device_uuid: &str, peer_id: &str) -> bool {
        match self.outbound.get_mut(device_uuid) {
            Some(link) => {
                let first = link.peer_id.is_none();
                link.peer_id = Some(peer_id.to_string());
                first
            }
            None => false,
        }
    }

    /// Outbound device currently bound to `peer_id`, if any.
    pub fn outbound_for_peer(&self, peer_id: &str) -> Option<String> {
        self.outbound
            .values()
            .find(|l| l.peer_id.as_deref() == Some(peer_id))
            .map(|l| l.device_uuid.clone())
    }

    // --- responder role ---

    pub fn subscribe(&mut self, central_uuid: &str) {
        self.inbound.insert(
            central_uuid.to_string(),
            InboundLink {
                central_uuid: central_uuid.to_string(),
                peer_id: None,
            },
        );
    }

    /// Returns the peer id bound to the departing central, if any.
    pub fn unsubscribe(&mut self, central_uuid: &str) -> Option<String> {
        self.inbound
            .remove(central_uuid)
            .and_then(|link| link.peer_id)
    }

    /// Bind an announced peer id to the subscribing central.
    /// Returns true on first binding.
    pub fn bind_inbound_peer(&mut self, central_uuid: &str, peer_id: &str) -> bool {
        match self.inbound.get_mut(central_uuid) {
            Some(link) => {
                let first = link.peer_id.is_none();
                link.peer_id = Some(peer_id.to_string());
                first
            }
            None => false,
        }
    }

    // --- aggregate queries ---

    /// Connected outbound links as (device, characteristic) write targets.
    pub fn write_targets(&self) -> Vec<(String, Uuid)> {
        self.outbound
            .values()
            .filter(|l| l.state == OutboundState::Connected)
            .filter_map(|l| l.characteristic.map(|c| (l.device_uuid.clone(), c)))
            .collect()
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        self.inbound.keys().cloned().collect()
    }

    /// Every tracked outbound device, whatever its state.
    pub fn outbound_devices(&self) -> Vec<String> {
        self.outbound.keys().cloned().collect()
    }

    pub fn connected_outbound(&self) -> usize {
        self.outbound
            .values()
            .filter(|l| l.state == OutboundState::Connected)
            .count()
    }

    /// Direct links in both roles; drives relay policy and scan mode.
    pub fn direct_link_count(&self) -> usize {
        self.connected_outbound() + self.inbound.len()
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.len()
    }

    /// Smallest single-shot write accepted across all connected links,
    /// clamped by the default fragment size.
    pub fn effective_write_len(&self) -> usize {
        self.outbound
            .values()
            .filter(|l| l.state == OutboundState::Connected)
            .filter_map(|l| l.max_write_len)
            .min()
            .map(|len| len.min(DEFAULT_FRAGMENT_SIZE))
            .unwrap_or(DEFAULT_FRAGMENT_SIZE)
    }

    // --- backpressure buffer ---

    /// Queue a rejected notification update, dropping the oldest on overflow.
    pub fn push_pending_notify(&mut self, data: Vec<u8>, subscribers: Vec<String>) {
        if self.pending_notifies.len() >= PENDING_NOTIFY_CAP {
            self.pending_notifies.pop_front();
            debug!("pending notification buffer full, dropped oldest update");
        }
        self.pending_notifies.push_back((data, subscribers));
    }

    pub fn pop_pending_notify(&mut self) -> Option<(Vec<u8>, Vec<String>)> {
        self.pending_notifies.pop_front()
    }

    pub fn pending_notify_len(&self) -> usize {
        self.pending_notifies.len()
    }

    // --- maintenance ---

    /// Evict links that are neither Connected nor Connecting and whose last
    /// attempt is older than `timeout`. Returns peer ids that were bound to
    /// evicted links.
    pub fn evict_stale(&mut self, timeout: Duration, now: Instant) -> Vec<String> {
        let mut unbound = Vec::new();
        self.outbound.retain(|_, link| {
            let stale = !matches!(
                link.state,
                OutboundState::Connected | OutboundState::Connecting
            ) && now.duration_since(link.last_attempt) > timeout;
            if stale {
                if let Some(peer) = link.peer_id.take() {
                    unbound.push(peer);
                }
            }
            !stale
        });
        unbound
    }

    /// Park a link in Idle after a failed or timed-out attempt so the
    /// rate-limit history survives until maintenance clears it.
    pub fn park_idle(&mut self, device_uuid: &str) -> Option<String> {
        match self.outbound.get_mut(device_uuid) {
            Some(link) => {
                link.state = OutboundState::Idle;
                link.characteristic = None;
                link.max_write_len = None;
                link.peer_id.take()
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAR: Uuid = Uuid::from_u128(0xD8C4B5F2_1E6A_4F3D_9B7C_0A2E5D8F1C4B);

    /// A peer id that wins the tie-break against every sha256-derived
    /// candidate (no hex digest starts above "f").
    const DOMINANT_ID: &str = "ffffffffffffffff";
    /// A peer id that always yields.
    const TIMID_ID: &str = "0000000000000000";

    fn manager() -> LinkManager {
        LinkManager::new(DOMINANT_ID.to_string())
    }

    #[test]
    fn discovery_gate_order() {
        let mut links = manager();
        let now = Instant::now();

        assert_eq!(
            links.evaluate_discovery("dev-a", -50, true, now),
            ConnectVerdict::Proceed
        );

        links.begin_connect("dev-a", now);
        assert_eq!(
            links.evaluate_discovery("dev-a", -50, true, now),
            ConnectVerdict::AlreadyTracked
        );

        // Global rate limit applies across candidates.
        assert_eq!(
            links.evaluate_discovery("dev-b", -50, true, now + Duration::from_secs(1)),
            ConnectVerdict::RateLimited
        );

        let later = now + CONNECT_RATE_LIMIT + Duration::from_millis(1);
        assert_eq!(
            links.evaluate_discovery("dev-b", RSSI_CUTOFF_DBM, true, later),
            ConnectVerdict::WeakSignal
        );
        assert_eq!(
            links.evaluate_discovery("dev-b", -50, false, later),
            ConnectVerdict::NotConnectable
        );
    }

    #[test]
    fn budget_rejects_eleventh_link() {
        let mut links = manager();
        let mut now = Instant::now();
        for i in 0..MAX_OUTBOUND_LINKS {
            links.begin_connect(&format!("dev-{i}"), now);
            now += CONNECT_RATE_LIMIT + Duration::from_millis(1);
        }
        assert_eq!(
            links.evaluate_discovery("dev-extra", -50, true, now),
            ConnectVerdict::BudgetExhausted
        );
    }

    #[test]
    fn tie_break_yields_for_lower_local_id() {
        let timid = LinkManager::new(TIMID_ID.to_string());
        assert_eq!(
            timid.evaluate_discovery("dev-a", -50, true, Instant::now()),
            ConnectVerdict::YieldToPeer
        );
    }

    #[test]
    fn connect_lifecycle() {
        let mut links = manager();
        let now = Instant::now();

        links.begin_connect("dev-a", now);
        assert!(links.is_connecting("dev-a"));
        assert_eq!(links.connected_outbound(), 0);

        assert!(links.mark_connected("dev-a", CHAR, 180));
        assert!(!links.is_connecting("dev-a"));
        assert_eq!(links.connected_outbound(), 1);
        assert_eq!(links.write_targets(), vec![("dev-a".to_string(), CHAR)]);

        assert!(links.bind_outbound_peer("dev-a", "aaaaaaaaaaaaaaaa"));
        assert!(!links.bind_outbound_peer("dev-a", "aaaaaaaaaaaaaaaa"));
        assert_eq!(
            links.outbound_for_peer("aaaaaaaaaaaaaaaa"),
            Some("dev-a".to_string())
        );

        assert_eq!(
            links.remove_outbound("dev-a"),
            Some("aaaaaaaaaaaaaaaa".to_string())
        );
        assert_eq!(links.connected_outbound(), 0);
    }

    #[test]
    fn effective_write_len_is_min_clamped() {
        let mut links = manager();
        let now = Instant::now();

        // No connected links: fall back to the default.
        assert_eq!(links.effective_write_len(), DEFAULT_FRAGMENT_SIZE);

        links.begin_connect("dev-a", now);
        links.mark_connected("dev-a", CHAR, 100);
        links.begin_connect("dev-b", now + CONNECT_RATE_LIMIT);
        links.mark_connected("dev-b", CHAR, 512);

        assert_eq!(links.effective_write_len(), 100);

        // Large advertised writes clamp at the default.
        links.remove_outbound("dev-a");
        assert_eq!(links.effective_write_len(), DEFAULT_FRAGMENT_SIZE);
    }

    #[test]
    fn inbound_subscriptions() {
        let mut links = manager();
        links.subscribe("central-1");
        links.subscribe("central-2");
        assert_eq!(links.direct_link_count(), 2);

        assert!(links.bind_inbound_peer("central-1", "bbbbbbbbbbbbbbbb"));
        assert_eq!(
            links.unsubscribe("central-1"),
            Some("bbbbbbbbbbbbbbbb".to_string())
        );
        assert_eq!(links.unsubscribe("central-1"), None);
        assert_eq!(links.direct_link_count(), 1);
    }

    #[test]
    fn pending_notify_drops_oldest() {
        let mut links = manager();
        for i in 0..(PENDING_NOTIFY_CAP + 5) {
            links.push_pending_notify(vec![i as u8], vec![]);
        }
        assert_eq!(links.pending_notify_len(), PENDING_NOTIFY_CAP);
        // The first five were shed.
        assert_eq!(links.pop_pending_notify().unwrap().0, vec![5u8]);
    }

    #[test]
    fn stale_eviction_spares_live_links() {
        let mut links = manager();
        let now = Instant::now();

        links.begin_connect("dev-idle", now);
        links.park_idle("dev-idle");
        links.begin_connect("dev-live", now + CONNECT_RATE_LIMIT);
        links.mark_connected("dev-live", CHAR, 150);

        let evicted = links.evict_stale(
            Duration::from_secs(30),
            now + Duration::from_secs(40),
        );
        assert!(evicted.is_empty()); // idle link had no peer bound
        assert_eq!(links.outbound_count(), 1);
        assert_eq!(links.connected_outbound(), 1);
    }

    #[test]
    fn park_idle_hands_back_the_peer_binding() {
        let mut links = manager();
        let now = Instant::now();

        links.begin_connect("dev-a", now);
        links.mark_connected("dev-a", CHAR, 150);
        links.bind_outbound_peer("dev-a", "cccccccccccccccc");

        assert_eq!(
            links.park_idle("dev-a"),
            Some("cccccccccccccccc".to_string())
        );
        assert_eq!(links.connected_outbound(), 0);
        assert_eq!(links.outbound_count(), 1);

        // Maintenance clears the parked record once it goes stale.
        let evicted = links.evict_stale(
            Duration::from_secs(30),
            now + Duration::from_secs(40),
        );
        assert!(evicted.is_empty());
        assert_eq!(links.outbound_count(), 0);
    }
}
