//! Radio adapter contract.
//!
//! The engine never touches the OS BLE stack directly: it issues
//! [`RadioCommand`]s through a [`Radio`] handle and consumes [`RadioEvent`]s
//! from a channel. Devices and centrals are referred to by stable string
//! identifiers; whatever OS object backs an identifier stays inside the
//! adapter.

pub mod btleplug;

use serde::Serialize;
use uuid::Uuid;

pub use self::btleplug::BtleplugRadio;

/// Power state of a radio role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Unsupported,
    Unknown,
}

/// Operations the core requests from the platform BLE stack.
///
/// All commands are fire-and-forget; outcomes, where observable, come back
/// as [`RadioEvent`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioCommand {
    /// Scan for peripherals advertising the mesh service.
    StartScan { allow_duplicates: bool },
    StopScan,
    /// Open a link to a discovered device.
    Connect { device: String },
    /// Abort an in-flight attempt or tear down an established link.
    CancelConnect { device: String },
    /// Walk the device's GATT table for the mesh service and characteristic.
    DiscoverServices { device: String },
    /// Write to the device's mesh characteristic.
    Write {
        device: String,
        characteristic: Uuid,
        data: Vec<u8>,
        with_response: bool,
    },
    /// Advertise the mesh service and host the shared characteristic.
    StartAdvertising { service: Uuid },
    StopAdvertising,
    /// Update the characteristic value for subscribed centrals;
    /// `subscribers` narrows the update to a subset when present.
    Notify {
        data: Vec<u8>,
        subscribers: Option<Vec<String>>,
    },
}

/// Events the platform BLE stack delivers to the core.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    CentralState(PowerState),
    PeripheralState(PowerState),
    /// A peripheral advertising the mesh service came into view.
    Discovered {
        device: String,
        rssi: i16,
        connectable: bool,
    },
    Connected {
        device: String,
    },
    ConnectFailed {
        device: String,
        error: String,
    },
    Disconnected {
        device: String,
    },
    /// Service walk finished; the write characteristic is usable and the
    /// device accepts single writes up to `max_write_len` bytes.
    CharacteristicDiscovered {
        device: String,
        characteristic: Uuid,
        max_write_len: usize,
    },
    /// Notification arrived on a characteristic we subscribed to.
    NotificationReceived {
        device: String,
        data: Vec<u8>,
    },
    /// A central subscribed to our hosted characteristic.
    Subscribed {
        central: String,
    },
    Unsubscribed {
        central: String,
    },
    /// A central wrote to our hosted characteristic.
    WriteReceived {
        central: String,
        data: Vec<u8>,
    },
    /// The OS notification queue rejected an update; the core owns the
    /// backlog and may retry after `ReadyToNotify`.
    NotifyBacklogged {
        data: Vec<u8>,
        subscribers: Vec<String>,
    },
    /// The OS notification queue has room again.
    ReadyToNotify,
}

/// Handle through which the engine submits commands to an adapter.
///
/// Shared as `Arc<dyn Radio>` across the engine task and its spawned
/// pacing tasks, so implementations must be `Sync`.
pub trait Radio: Send + Sync + 'static {
    fn submit(&self, command: RadioCommand);
}
