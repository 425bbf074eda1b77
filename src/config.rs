//! Compile-time tunables for the mesh transport.
//!
//! Everything here is a constant on purpose: the mesh has no configuration
//! files, no environment variables, and no persisted state.

use std::time::Duration;
use uuid::Uuid;

/// Service UUID advertised and scanned for on the main mesh.
#[cfg(not(feature = "testnet"))]
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6B1E7A4C_9D2F_4E8B_A1C5_3F7D9E0B2A6D);

/// Service UUID for testnet builds, so test nodes never join the main mesh.
#[cfg(feature = "testnet")]
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6B1E7A4C_9D2F_4E8B_A1C5_3F7D9E0B2A6E);

/// The single write/notify characteristic all message exchange goes through.
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xD8C4B5F2_1E6A_4F3D_9B7C_0A2E5D8F1C4B);

/// Payloads at or above this size are candidates for zlib compression.
pub const COMPRESSION_THRESHOLD: usize = 256;

/// Fallback single-write size when no link has advertised its own limit,
/// and the clamp applied on top of whatever the links advertise.
pub const DEFAULT_FRAGMENT_SIZE: usize = 150;

/// Initial TTL for locally originated packets.
pub const MESSAGE_TTL: u8 = 8;

/// Seen-packet window for the packet deduplicator.
pub const DEDUP_WINDOW_PACKETS: Duration = Duration::from_secs(30);

/// Seen-fragment window for the fragment-arrival deduplicator.
pub const DEDUP_WINDOW_FRAGMENTS: Duration = Duration::from_secs(60);

/// Entry caps for the two deduplicators.
pub const DEDUP_MAX_PACKETS: usize = 1000;
pub const DEDUP_MAX_FRAGMENTS: usize = 2000;

/// Incomplete reassembly slots older than this are dropped.
pub const FRAGMENT_SLOT_LIFETIME: Duration = Duration::from_secs(30);

/// Peers and stale outbound links are evicted after this much inactivity.
pub const PEER_INACTIVITY: Duration = Duration::from_secs(30);

/// Budget of concurrent outgoing links (Connecting or Connected).
pub const MAX_OUTBOUND_LINKS: usize = 10;

/// Minimum spacing between connect attempts, across all candidates.
pub const CONNECT_RATE_LIMIT: Duration = Duration::from_secs(2);

/// A connect attempt that has not confirmed within this budget is dropped.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Discoveries at or below this signal strength are ignored.
pub const RSSI_CUTOFF_DBM: i16 = -80;

/// Minimum spacing between two announces, whatever triggered them.
pub const ANNOUNCE_MIN_INTERVAL: Duration = Duration::from_secs(2);

/// Periodic re-announce interval while at least one link is up.
pub const PERIODIC_ANNOUNCE: Duration = Duration::from_secs(30);

/// Engine maintenance sweep interval.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Settle delay before the first announce after both radio roles are ready.
pub const STARTUP_SETTLE: Duration = Duration::from_secs(1);

/// Delay before announcing on a link that just became usable.
pub const POST_CONNECT_ANNOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Delay before answering a peer's announce with our own.
pub const RECIPROCAL_ANNOUNCE_DELAY: Duration = Duration::from_millis(100);

/// Scan duty cycles as (scan-on, scan-off) pairs.
pub const SCAN_CYCLE_NORMAL: (Duration, Duration) =
    (Duration::from_secs(10), Duration::from_secs(5));
pub const SCAN_CYCLE_DENSE: (Duration, Duration) =
    (Duration::from_secs(5), Duration::from_secs(10));
pub const SCAN_CYCLE_SPARSE: (Duration, Duration) =
    (Duration::from_secs(5), Duration::from_secs(15));

/// Window over which received packets count toward the traffic estimate.
pub const TRAFFIC_WINDOW: Duration = Duration::from_secs(10);

/// Pending-notification buffer cap; oldest entries are dropped on overflow.
pub const PENDING_NOTIFY_CAP: usize = 50;
