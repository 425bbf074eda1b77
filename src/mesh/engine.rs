//! The mesh engine and its public service handle.
//!
//! One task owns every piece of mutable state: deduplicators, peer
//! registry, link maps, reassembly slots, the announce clock and the
//! traffic trace. Radio callbacks, upper-layer commands and timers all
//! arrive as events on a single queue, so no lock is shared across
//! components. Delayed work (relay jitter, fragment pacing, scheduled
//! announces, scan duty cycles) is a spawned task that sleeps and posts an
//! event back to the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::{
    ANNOUNCE_MIN_INTERVAL, CONNECT_TIMEOUT, DEDUP_MAX_FRAGMENTS, DEDUP_MAX_PACKETS,
    DEDUP_WINDOW_FRAGMENTS, DEDUP_WINDOW_PACKETS, FRAGMENT_SLOT_LIFETIME, MAINTENANCE_INTERVAL,
    MESSAGE_TTL, PEER_INACTIVITY, PERIODIC_ANNOUNCE, POST_CONNECT_ANNOUNCE_DELAY,
    RECIPROCAL_ANNOUNCE_DELAY, SERVICE_UUID, STARTUP_SETTLE,
};
use crate::mesh::assembler::Assembler;
use crate::mesh::dedup::Deduplicator;
use crate::mesh::links::{ConnectVerdict, LinkManager};
use crate::mesh::peers::{LinkDirection, PeerRegistry};
use crate::mesh::scanner::{AdaptiveScanner, ScanState};
use crate::protocol::fragment::{self, FragmentPayload};
use crate::protocol::peer_id;
use crate::protocol::{AnnouncePayload, Packet, PacketType};
use crate::radio::{PowerState, Radio, RadioCommand, RadioEvent};

/// Outbound packets parked while the radio is not powered on.
const DEFERRED_BROADCAST_CAP: usize = 50;

/// Events delivered to the embedding application.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    PublicMessage {
        peer_id: String,
        nickname: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    PeerConnected {
        peer_id: String,
    },
    PeerDisconnected {
        peer_id: String,
    },
    PeerListChanged {
        peers: Vec<String>,
    },
}

/// Point-in-time service snapshot for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub running: bool,
    pub peer_id: String,
    pub nickname: String,
    pub outbound_links: usize,
    pub connected_links: usize,
    pub subscribers: usize,
    pub known_peers: usize,
    pub pending_notifies: usize,
    pub scan_state: &'static str,
}

/// Which link carried an inbound frame.
#[derive(Debug, Clone)]
enum FrameSource {
    /// Notification from a peripheral we connected to.
    Outbound(String),
    /// Write from a central subscribed to us.
    Inbound(String),
}

enum EngineCommand {
    Start,
    Stop,
    SetNickname(String),
    SendMessage(String),
    Status(oneshot::Sender<MeshStatus>),
}

enum EngineEvent {
    Radio(RadioEvent),
    Command(EngineCommand),
    /// A scheduled announce came due; subject to the inter-announce throttle.
    AnnounceDue,
    /// Relay jitter elapsed; time to re-broadcast. `refragment` is set when
    /// the packet was reassembled from fragments and must go out split,
    /// whatever this node's own write length says.
    RelayDue { packet: Packet, refragment: bool },
    /// Scan duty-cycle edge for the given generation.
    ScanToggle { generation: u64 },
    ConnectTimeout { device: String },
    MaintenanceTick,
    PeriodicAnnounceTick,
}

/// Handle to a running mesh engine.
///
/// Cheap to clone; all mutation is forwarded to the engine task, peer
/// queries read the shared registry directly.
#[derive(Clone)]
pub struct MeshService {
    peer_id: String,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    peers: PeerRegistry,
}

impl MeshService {
    /// Spawn the engine over the given radio adapter. Returns the handle and
    /// the stream of [`MeshEvent`]s.
    pub fn new(
        radio: Arc<dyn Radio>,
        mut radio_events: mpsc::UnboundedReceiver<RadioEvent>,
        nickname: String,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let peers = PeerRegistry::new();
        let local_peer_id = peer_id::generate();

        let pump_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = radio_events.recv().await {
                if pump_tx.send(EngineEvent::Radio(event)).is_err() {
                    break;
                }
            }
        });

        let engine = MeshEngine::new(
            radio,
            events_tx.clone(),
            app_tx,
            peers.clone(),
            local_peer_id.clone(),
            nickname,
        );
        tokio::spawn(engine.run(events_rx));

        (
            Self {
                peer_id: local_peer_id,
                events_tx,
                peers,
            },
            app_rx,
        )
    }

    pub fn start_services(&self) -> Result<()> {
        self.send(EngineCommand::Start)
    }

    pub fn stop_services(&self) -> Result<()> {
        self.send(EngineCommand::Stop)
    }

    /// Rename ourselves; triggers a throttled announce.
    pub fn set_nickname(&self, nickname: impl Into<String>) -> Result<()> {
        self.send(EngineCommand::SetNickname(nickname.into()))
    }

    /// Broadcast a public message into the mesh.
    pub fn send_message(&self, content: impl Into<String>) -> Result<()> {
        self.send(EngineCommand::SendMessage(content.into()))
    }

    pub fn local_peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Peers currently reachable over a live link, sorted.
    pub fn connected_peer_ids(&self) -> Vec<String> {
        self.peers.connected_ids()
    }

    pub fn peer_nicknames(&self) -> HashMap<String, String> {
        self.peers.nicknames()
    }

    pub async fn status(&self) -> Result<MeshStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineCommand::Status(reply_tx))?;
        reply_rx.await.context("engine task gone")
    }

    fn send(&self, command: EngineCommand) -> Result<()> {
        self.events_tx
            .send(EngineEvent::Command(command))
            .map_err(|_| anyhow::anyhow!("engine task gone"))
    }
}

struct MeshEngine {
    radio: Arc<dyn Radio>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    app_events: mpsc::UnboundedSender<MeshEvent>,

    peer_id: String,
    sender_id: [u8; 8],
    nickname: String,

    peers: PeerRegistry,
    links: LinkManager,
    scanner: AdaptiveScanner,
    packet_dedup: Deduplicator,
    fragment_dedup: Deduplicator,
    /// Fragment ids we split ourselves; reflected echoes are dropped.
    sent_fragments: Deduplicator,
    assembler: Assembler,

    running: bool,
    tickers_started: bool,
    central_state: PowerState,
    peripheral_state: PowerState,
    settle_announced: bool,
    last_announce: Option<Instant>,
    deferred: VecDeque<(Packet, bool)>,
    scan_generation: u64,
    scan_on: bool,
}

impl MeshEngine {
    fn new(
        radio: Arc<dyn Radio>,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
        app_events: mpsc::UnboundedSender<MeshEvent>,
        peers: PeerRegistry,
        local_peer_id: String,
        nickname: String,
    ) -> Self {
        let now = Instant::now();
        let sender_id = peer_id::to_bytes(&local_peer_id).unwrap_or_default();
        Self {
            radio,
            events_tx,
            app_events,
            links: LinkManager::new(local_peer_id.clone()),
            peer_id: local_peer_id,
            sender_id,
            nickname,
            peers,
            scanner: AdaptiveScanner::new(),
            packet_dedup: Deduplicator::new(DEDUP_WINDOW_PACKETS, DEDUP_MAX_PACKETS, now),
            fragment_dedup: Deduplicator::new(DEDUP_WINDOW_FRAGMENTS, DEDUP_MAX_FRAGMENTS, now),
            sent_fragments: Deduplicator::new(DEDUP_WINDOW_FRAGMENTS, DEDUP_MAX_FRAGMENTS, now),
            assembler: Assembler::new(FRAGMENT_SLOT_LIFETIME),
            running: false,
            tickers_started: false,
            central_state: PowerState::Unknown,
            peripheral_state: PowerState::Unknown,
            settle_announced: false,
            last_announce: None,
            deferred: VecDeque::new(),
            scan_generation: 0,
            scan_on: false,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("engine event queue closed, shutting down");
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Radio(radio_event) => self.handle_radio_event(radio_event),
            EngineEvent::Command(command) => self.handle_command(command),
            EngineEvent::AnnounceDue => self.try_announce(),
            EngineEvent::RelayDue { packet, refragment } => {
                if self.running {
                    self.broadcast(packet, refragment);
                }
            }
            EngineEvent::ScanToggle { generation } => self.handle_scan_toggle(generation),
            EngineEvent::ConnectTimeout { device } => self.handle_connect_timeout(&device),
            EngineEvent::MaintenanceTick => self.run_maintenance(),
            EngineEvent::PeriodicAnnounceTick => {
                if self.running && self.links.direct_link_count() > 0 {
                    self.try_announce();
                }
            }
        }
    }

    // --- commands ---

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Start => self.start(),
            EngineCommand::Stop => self.stop(),
            EngineCommand::SetNickname(nickname) => {
                if nickname != self.nickname {
                    info!("nickname changed to {nickname}");
                    self.nickname = nickname;
                    if self.running {
                        self.try_announce();
                    }
                }
            }
            EngineCommand::SendMessage(content) => {
                if !self.running {
                    debug!("dropping message, services not started");
                    return;
                }
                let packet = Packet::new(
                    PacketType::Message,
                    MESSAGE_TTL,
                    self.sender_id,
                    content.into_bytes(),
                );
                self.broadcast(packet, false);
            }
            EngineCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn start(&mut self) {
        if self.running {
            return;
        }
        info!("starting mesh services as {}", self.peer_id);
        self.running = true;

        self.radio.submit(RadioCommand::StartAdvertising {
            service: SERVICE_UUID,
        });
        self.apply_scan_state(self.scanner.state());
        self.spawn_tickers();
        self.maybe_schedule_settle_announce();
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!("stopping mesh services");

        // Tell the mesh we are going before the links drop.
        let leave = Packet::new(PacketType::Leave, MESSAGE_TTL, self.sender_id, Vec::new());
        self.broadcast(leave, false);

        self.running = false;
        self.scan_generation += 1; // cancels in-flight duty-cycle toggles
        self.scan_on = false;
        self.radio.submit(RadioCommand::StopScan);
        self.radio.submit(RadioCommand::StopAdvertising);
        for device in self.links.outbound_devices() {
            self.radio.submit(RadioCommand::CancelConnect { device });
        }

        self.links = LinkManager::new(self.peer_id.clone());
        self.peers.clear();
        self.packet_dedup.reset();
        self.fragment_dedup.reset();
        self.sent_fragments.reset();
        self.deferred.clear();
        self.settle_announced = false;
        self.emit(MeshEvent::PeerListChanged { peers: Vec::new() });
    }

    fn status(&self) -> MeshStatus {
        MeshStatus {
            running: self.running,
            peer_id: self.peer_id.clone(),
            nickname: self.nickname.clone(),
            outbound_links: self.links.outbound_count(),
            connected_links: self.links.direct_link_count(),
            subscribers: self.links.subscriber_ids().len(),
            known_peers: self.peers.len(),
            pending_notifies: self.links.pending_notify_len(),
            scan_state: self.scanner.state().label(),
        }
    }

    // --- radio events ---

    fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::CentralState(state) => {
                info!("central role state: {state:?}");
                self.central_state = state;
                if state == PowerState::PoweredOn {
                    self.flush_deferred();
                }
                self.maybe_schedule_settle_announce();
            }
            RadioEvent::PeripheralState(state) => {
                info!("peripheral role state: {state:?}");
                self.peripheral_state = state;
                self.maybe_schedule_settle_announce();
            }
            RadioEvent::Discovered {
                device,
                rssi,
                connectable,
            } => self.handle_discovered(&device, rssi, connectable),
            RadioEvent::Connected { device } => {
                debug!("link up to {device}, discovering services");
                self.radio.submit(RadioCommand::DiscoverServices { device });
            }
            RadioEvent::ConnectFailed { device, error } => {
                warn!("connect to {device} failed: {error}");
                self.handle_link_down(&device);
            }
            RadioEvent::Disconnected { device } => {
                info!("link to {device} closed");
                self.handle_link_down(&device);
            }
            RadioEvent::CharacteristicDiscovered {
                device,
                characteristic,
                max_write_len,
            } => {
                if self.links.mark_connected(&device, characteristic, max_write_len) {
                    info!("link to {device} usable, single writes up to {max_write_len} bytes");
                    self.recompute_scan();
                    self.schedule(POST_CONNECT_ANNOUNCE_DELAY, EngineEvent::AnnounceDue);
                }
            }
            RadioEvent::NotificationReceived { device, data } => {
                self.handle_frame(&data, FrameSource::Outbound(device), false);
            }
            RadioEvent::WriteReceived { central, data } => {
                self.handle_frame(&data, FrameSource::Inbound(central), false);
            }
            RadioEvent::Subscribed { central } => {
                info!("central {central} subscribed");
                self.links.subscribe(&central);
                self.recompute_scan();
                self.schedule(POST_CONNECT_ANNOUNCE_DELAY, EngineEvent::AnnounceDue);
            }
            RadioEvent::Unsubscribed { central } => {
                info!("central {central} unsubscribed");
                if let Some(peer) = self.links.unsubscribe(&central) {
                    self.forget_peer(&peer);
                }
                self.recompute_scan();
            }
            RadioEvent::NotifyBacklogged { data, subscribers } => {
                self.links.push_pending_notify(data, subscribers);
            }
            RadioEvent::ReadyToNotify => {
                while let Some((data, subscribers)) = self.links.pop_pending_notify() {
                    self.radio.submit(RadioCommand::Notify {
                        data,
                        subscribers: Some(subscribers),
                    });
                }
            }
        }
    }

    fn handle_discovered(&mut self, device: &str, rssi: i16, connectable: bool) {
        if !self.running {
            return;
        }
        let now = Instant::now();
        match self.links.evaluate_discovery(device, rssi, connectable, now) {
            ConnectVerdict::Proceed => {
                info!("connecting to {device} (rssi {rssi})");
                self.links.begin_connect(device, now);
                self.radio.submit(RadioCommand::Connect {
                    device: device.to_string(),
                });
                self.schedule(
                    CONNECT_TIMEOUT,
                    EngineEvent::ConnectTimeout {
                        device: device.to_string(),
                    },
                );
            }
            verdict => debug!("skipping {device}: {verdict:?}"),
        }
    }

    fn handle_connect_timeout(&mut self, device: &str) {
        if !self.links.is_connecting(device) {
            return;
        }
        warn!("connect to {device} timed out");
        self.radio.submit(RadioCommand::CancelConnect {
            device: device.to_string(),
        });
        self.handle_link_down(device);
    }

    fn handle_link_down(&mut self, device: &str) {
        if let Some(peer) = self.links.park_idle(device) {
            self.forget_peer(&peer);
        }
        self.recompute_scan();
    }

    /// Drop a peer's nickname and tell the app it is gone.
    fn forget_peer(&mut self, peer: &str) {
        if self.peers.remove(peer) {
            self.emit(MeshEvent::PeerDisconnected {
                peer_id: peer.to_string(),
            });
            self.emit_peer_list();
        }
    }

    // --- receive pipeline ---

    fn handle_frame(&mut self, data: &[u8], source: FrameSource, was_fragmented: bool) {
        if !self.running {
            return;
        }
        let now = Instant::now();
        self.scanner.observe_packet(now);
        self.recompute_scan();

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("dropping malformed frame from {source:?}: {err}");
                return;
            }
        };

        let sender = peer_id::from_bytes(&packet.sender_id);
        self.peers.touch(&sender);

        if packet.packet_type != PacketType::Fragment {
            let id = packet.dedup_id();
            if self.packet_dedup.is_duplicate(&id, now) {
                debug!("duplicate packet {id}, dropping");
                return;
            }
            self.packet_dedup.mark_processed(id, now);
        }

        match packet.packet_type {
            PacketType::Announce => self.handle_announce(&packet, &source),
            PacketType::Message => self.handle_message(&packet, &sender),
            PacketType::Leave => self.handle_leave(&sender),
            PacketType::Fragment => {
                // Relay and reassembly both live in the fragment path.
                self.handle_fragment(packet, source, now);
                return;
            }
        }

        // A packet reassembled from fragments must leave fragmented again.
        self.maybe_relay(&packet, was_fragmented);
    }

    fn handle_announce(&mut self, packet: &Packet, source: &FrameSource) {
        let announce = match AnnouncePayload::decode(&packet.payload) {
            Ok(announce) => announce,
            Err(err) => {
                debug!("dropping bad announce: {err}");
                return;
            }
        };
        if !peer_id::is_valid(&announce.peer_id) || announce.peer_id == self.peer_id {
            return;
        }

        self.peers.record_announce(&announce.peer_id, &announce.nickname);

        let first_binding = match source {
            FrameSource::Outbound(device) => {
                let first = self.links.bind_outbound_peer(device, &announce.peer_id);
                self.peers.bind_link(&announce.peer_id, LinkDirection::Outbound);
                first
            }
            FrameSource::Inbound(central) => {
                let first = self.links.bind_inbound_peer(central, &announce.peer_id);
                self.peers.bind_link(&announce.peer_id, LinkDirection::Inbound);
                first
            }
        };

        if first_binding {
            info!("peer {} ({}) reachable", announce.peer_id, announce.nickname);
            self.emit(MeshEvent::PeerConnected {
                peer_id: announce.peer_id.clone(),
            });
            // Let them learn who we are too.
            self.schedule(RECIPROCAL_ANNOUNCE_DELAY, EngineEvent::AnnounceDue);
        }
        self.emit_peer_list();
    }

    fn handle_message(&mut self, packet: &Packet, sender: &str) {
        if sender == self.peer_id {
            return; // our own message echoed back
        }
        let content = String::from_utf8_lossy(&packet.payload).into_owned();
        let nickname = self
            .peers
            .nickname(sender)
            .unwrap_or_else(|| "anon".to_string());
        let timestamp = Utc
            .timestamp_millis_opt(packet.timestamp_ms as i64)
            .single()
            .unwrap_or_else(Utc::now);

        self.emit(MeshEvent::PublicMessage {
            peer_id: sender.to_string(),
            nickname,
            content,
            timestamp,
        });
    }

    fn handle_leave(&mut self, sender: &str) {
        info!("peer {sender} left the mesh");
        if let Some(device) = self.links.outbound_for_peer(sender) {
            self.radio.submit(RadioCommand::CancelConnect { device: device.clone() });
            self.links.park_idle(&device);
        }
        self.forget_peer(sender);
    }

    fn handle_fragment(&mut self, packet: Packet, source: FrameSource, now: Instant) {
        let fragment = match FragmentPayload::decode(&packet.payload) {
            Ok(fragment) => fragment,
            Err(err) => {
                debug!("dropping bad fragment: {err}");
                return;
            }
        };

        let arrival_key = fragment.arrival_key(&packet.sender_id);
        if self.fragment_dedup.is_duplicate(&arrival_key, now) {
            return;
        }
        self.fragment_dedup.mark_processed(arrival_key, now);

        // A fragment we split ourselves, reflected back by a neighbor.
        if self.sent_fragments.is_duplicate(&fragment.id_hex(), now) {
            return;
        }

        // Forward the raw fragment as-is; reassembly happens at every hop
        // but re-fragmentation never does.
        self.maybe_relay(&packet, false);

        let sender = peer_id::from_bytes(&packet.sender_id);
        if let Some(data) = self.assembler.insert(&sender, fragment, now) {
            debug!("reassembled {} bytes from {sender}", data.len());
            self.handle_frame(&data, source, true);
        }
    }

    // --- relay ---

    fn maybe_relay(&mut self, packet: &Packet, refragment: bool) {
        let Some(relay) = packet.decayed() else {
            return;
        };
        if !self.should_relay(relay.packet_type) {
            return;
        }
        // A short random delay decorrelates neighbors relaying the same
        // packet.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(10..=50));
        self.schedule(
            jitter,
            EngineEvent::RelayDue {
                packet: relay,
                refragment,
            },
        );
    }

    /// Density-dependent relay probability.
    fn should_relay(&self, packet_type: PacketType) -> bool {
        let direct = self.links.direct_link_count();
        if direct <= 2 {
            return true;
        }
        if direct > 5 {
            let probability = if packet_type == PacketType::Announce {
                0.3
            } else {
                0.5
            };
            return rand::thread_rng().gen_bool(probability);
        }
        true
    }

    // --- broadcast path ---

    /// Single exit point for every outgoing packet: messages, announces,
    /// leaves and relays. `force_fragment` keeps a packet that was
    /// reassembled from fragments on the fragmented transport even when it
    /// would fit this node's own write length.
    fn broadcast(&mut self, packet: Packet, force_fragment: bool) {
        if self.central_state != PowerState::PoweredOn {
            debug!("radio not powered on, deferring broadcast");
            if self.deferred.len() >= DEFERRED_BROADCAST_CAP {
                self.deferred.pop_front();
            }
            self.deferred.push_back((packet, force_fragment));
            return;
        }

        let encoded = match packet.encode(false) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("failed to encode outgoing packet: {err}");
                return;
            }
        };

        let now = Instant::now();
        // Pre-mark our own id so the local echo of a relay cannot loop.
        self.packet_dedup.mark_processed(packet.dedup_id(), now);

        let effective = self.links.effective_write_len();
        let oversize = encoded.len() > effective;
        if (oversize || force_fragment) && packet.packet_type != PacketType::Fragment {
            self.broadcast_fragmented(&packet, &encoded, effective, now);
        } else {
            self.write_to_mesh(encoded);
        }
    }

    fn broadcast_fragmented(
        &mut self,
        packet: &Packet,
        encoded: &[u8],
        effective_write_len: usize,
        now: Instant,
    ) {
        let fragments = fragment::split_packet(packet, encoded, effective_write_len);
        if fragments.len() < 2 {
            // A one-piece group is not valid on the wire; the whole packet
            // fits a single write anyway.
            self.write_to_mesh(encoded.to_vec());
            return;
        }
        if let Some(first) = fragments.first() {
            // First 8 payload bytes of every fragment are the group id.
            self.sent_fragments
                .mark_processed(hex::encode(&first.payload[..8]), now);
        }
        debug!(
            "splitting {} bytes into {} fragments",
            encoded.len(),
            fragments.len()
        );

        let targets = self.links.write_targets();
        let subscribers = self.links.subscriber_ids();
        let radio = Arc::clone(&self.radio);
        let delay = fragment::pacing_delay(fragments.len());

        // Writes are fire-and-forget, so pacing can run off-task; the
        // targets are a snapshot from the moment the split happened.
        tokio::spawn(async move {
            for (index, fragment_packet) in fragments.iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(delay).await;
                }
                let data = match fragment_packet.encode(false) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!("failed to encode fragment {index}: {err}");
                        return;
                    }
                };
                for (device, characteristic) in &targets {
                    radio.submit(RadioCommand::Write {
                        device: device.clone(),
                        characteristic: *characteristic,
                        data: data.clone(),
                        with_response: false,
                    });
                }
                if !subscribers.is_empty() {
                    radio.submit(RadioCommand::Notify {
                        data,
                        subscribers: None,
                    });
                }
            }
        });
    }

    fn write_to_mesh(&self, data: Vec<u8>) {
        for (device, characteristic) in self.links.write_targets() {
            self.radio.submit(RadioCommand::Write {
                device,
                characteristic,
                data: data.clone(),
                with_response: false,
            });
        }
        if !self.links.subscriber_ids().is_empty() {
            self.radio.submit(RadioCommand::Notify {
                data,
                subscribers: None,
            });
        }
    }

    fn flush_deferred(&mut self) {
        while let Some((packet, force_fragment)) = self.deferred.pop_front() {
            self.broadcast(packet, force_fragment);
        }
    }

    // --- announces ---

    fn maybe_schedule_settle_announce(&mut self) {
        let central_ready = self.central_state == PowerState::PoweredOn;
        let peripheral_ready = matches!(
            self.peripheral_state,
            PowerState::PoweredOn | PowerState::Unsupported
        );
        if self.running && central_ready && peripheral_ready && !self.settle_announced {
            self.settle_announced = true;
            self.schedule(STARTUP_SETTLE, EngineEvent::AnnounceDue);
        }
    }

    /// Announce unless one went out within the minimum interval.
    fn try_announce(&mut self) {
        if !self.running {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_announce {
            if now.duration_since(last) < ANNOUNCE_MIN_INTERVAL {
                return;
            }
        }
        let payload = match AnnouncePayload::new(self.nickname.clone(), self.peer_id.clone())
            .encode()
        {
            Ok(payload) => payload,
            Err(err) => {
                warn!("cannot encode announce: {err}");
                return;
            }
        };
        self.last_announce = Some(now);
        let packet = Packet::new(PacketType::Announce, MESSAGE_TTL, self.sender_id, payload);
        self.broadcast(packet, false);
    }

    // --- scanning ---

    fn recompute_scan(&mut self) {
        let direct = self.links.direct_link_count();
        if let Some(state) = self.scanner.recompute(Instant::now(), direct) {
            info!("scan state -> {} ({direct} direct links)", state.label());
            self.apply_scan_state(state);
        }
    }

    fn apply_scan_state(&mut self, state: ScanState) {
        if !self.running {
            return;
        }
        self.scan_generation += 1; // invalidates queued toggles
        match state {
            ScanState::Aggressive => {
                self.scan_on = true;
                self.radio.submit(RadioCommand::StartScan {
                    allow_duplicates: true,
                });
            }
            ScanState::Cycled(mode) => {
                self.scan_on = true;
                self.radio.submit(RadioCommand::StartScan {
                    allow_duplicates: false,
                });
                let (on_period, _) = mode.periods();
                self.schedule(
                    on_period,
                    EngineEvent::ScanToggle {
                        generation: self.scan_generation,
                    },
                );
            }
        }
    }

    fn handle_scan_toggle(&mut self, generation: u64) {
        if !self.running || generation != self.scan_generation {
            return; // stale timer from a cancelled cycle
        }
        let ScanState::Cycled(mode) = self.scanner.state() else {
            return;
        };
        let (on_period, off_period) = mode.periods();
        self.scan_on = !self.scan_on;
        let next = if self.scan_on {
            self.radio.submit(RadioCommand::StartScan {
                allow_duplicates: false,
            });
            on_period
        } else {
            self.radio.submit(RadioCommand::StopScan);
            off_period
        };
        self.schedule(
            next,
            EngineEvent::ScanToggle {
                generation: self.scan_generation,
            },
        );
    }

    // --- maintenance ---

    fn run_maintenance(&mut self) {
        if !self.running {
            return;
        }
        let now = Instant::now();

        for peer in self.links.evict_stale(PEER_INACTIVITY, now) {
            self.forget_peer(&peer);
        }
        self.assembler.sweep(now);

        let evicted = self.peers.evict_inactive(PEER_INACTIVITY);
        if !evicted.is_empty() {
            debug!("evicted {} inactive peers", evicted.len());
            self.emit_peer_list();
        }

        // Keeps the duty cycle honest after traffic dies down.
        self.recompute_scan();
    }

    // --- plumbing ---

    fn spawn_tickers(&mut self) {
        if self.tickers_started {
            return;
        }
        self.tickers_started = true;

        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                if tx.send(EngineEvent::MaintenanceTick).is_err() {
                    break;
                }
            }
        });

        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PERIODIC_ANNOUNCE);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(EngineEvent::PeriodicAnnounceTick).is_err() {
                    break;
                }
            }
        });
    }

    fn schedule(&self, delay: Duration, event: EngineEvent) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.app_events.send(event);
    }

    fn emit_peer_list(&self) {
        self.emit(MeshEvent::PeerListChanged {
            peers: self.peers.connected_ids(),
        });
    }
}
