//! blether: decentralized mesh messaging over Bluetooth LE.
//!
//! Nodes advertise a fixed service UUID, discover and connect to one another
//! opportunistically in both BLE roles, and flood short text messages
//! hop-by-hop with TTL decay. Delivery is best-effort by design: a
//! time-windowed deduplicator makes the relay layer idempotent, and there is
//! no retry, ordering or acknowledgment at the packet level.
//!
//! The engine runs as a single task owning all mutable state; radio
//! callbacks, timers and API calls reach it as events on one queue. The OS
//! BLE stack sits behind the [`radio::Radio`] contract, with
//! [`radio::BtleplugRadio`] as the shipped central-role implementation.
//!
//! ```no_run
//! use blether::{BtleplugRadio, MeshService};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let (radio, radio_events) = BtleplugRadio::new().await?;
//! let (mesh, mut events) = MeshService::new(Arc::new(radio), radio_events, "ember".into());
//! mesh.start_services()?;
//! mesh.send_message("hello out there")?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod mesh;
pub mod protocol;
pub mod radio;

pub use mesh::{MeshEvent, MeshService, MeshStatus, PeerInfo};
pub use protocol::{AnnouncePayload, FragmentPayload, Packet, PacketType, ProtocolError};
pub use radio::{BtleplugRadio, PowerState, Radio, RadioCommand, RadioEvent};
