//! Central-role radio adapter over btleplug.
//!
//! Implements the initiator half of the radio contract: filtered scanning,
//! connect-with-timeout, service and characteristic discovery, notification
//! pumping and writes. btleplug exposes no peripheral API, so the responder
//! half reports `Unsupported` and advertise/notify commands are dropped with
//! a warning; a platform adapter with a peripheral role can take over that
//! half without touching the core.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use btleplug::api::{
    Central, CentralEvent, CentralState as BtCentralState, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::config::{CHARACTERISTIC_UUID, CONNECT_TIMEOUT, DEFAULT_FRAGMENT_SIZE, SERVICE_UUID};
use crate::radio::{PowerState, Radio, RadioCommand, RadioEvent};

/// Some platforms silently stop delivering advertisements; restarting the
/// scan at this interval keeps discovery alive.
const SCAN_RESTART_INTERVAL: Duration = Duration::from_secs(30);

/// Command handle for the btleplug driver task.
pub struct BtleplugRadio {
    commands: mpsc::UnboundedSender<RadioCommand>,
}

impl Radio for BtleplugRadio {
    fn submit(&self, command: RadioCommand) {
        if self.commands.send(command).is_err() {
            warn!("btleplug driver task is gone, dropping radio command");
        }
    }
}

impl BtleplugRadio {
    /// Acquire the first Bluetooth adapter and spawn the driver task.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<RadioEvent>)> {
        let manager = Manager::new()
            .await
            .context("failed to create Bluetooth manager")?;
        let adapters = manager
            .adapters()
            .await
            .context("failed to enumerate Bluetooth adapters")?;
        let adapter = adapters
            .into_iter()
            .next()
            .context("no Bluetooth adapters found")?;
        info!("using Bluetooth adapter {:?}", adapter);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            adapter,
            events: events_tx,
            devices: HashMap::new(),
            characteristics: HashMap::new(),
            scanning: false,
            allow_duplicates: false,
            warned_peripheral: false,
        };
        tokio::spawn(driver.run(commands_rx));

        Ok((
            Self {
                commands: commands_tx,
            },
            events_rx,
        ))
    }
}

struct Driver {
    adapter: Adapter,
    events: mpsc::UnboundedSender<RadioEvent>,
    devices: HashMap<String, Peripheral>,
    characteristics: HashMap<String, Characteristic>,
    scanning: bool,
    allow_duplicates: bool,
    warned_peripheral: bool,
}

/// Stable string identifier for a device, the only form the core sees.
fn device_key(id: &PeripheralId) -> String {
    format!("{id:?}")
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RadioCommand>) {
        // The adapter is in hand, so the central role is usable; btleplug
        // has no peripheral role on any platform.
        self.emit(RadioEvent::CentralState(PowerState::PoweredOn));
        self.emit(RadioEvent::PeripheralState(PowerState::Unsupported));

        let mut central_events = match self.adapter.events().await {
            Ok(stream) => stream,
            Err(err) => {
                error!("cannot stream adapter events: {err}");
                self.emit(RadioEvent::CentralState(PowerState::PoweredOff));
                return;
            }
        };

        let mut restart = tokio::time::interval(SCAN_RESTART_INTERVAL);
        restart.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = central_events.next() => {
                    self.handle_central_event(event).await;
                }
                _ = restart.tick() => {
                    self.restart_scan_if_active().await;
                }
            }
        }
        debug!("radio command channel closed, driver exiting");
    }

    async fn handle_command(&mut self, command: RadioCommand) {
        match command {
            RadioCommand::StartScan { allow_duplicates } => {
                self.allow_duplicates = allow_duplicates;
                self.start_scan().await;
            }
            RadioCommand::StopScan => {
                self.scanning = false;
                if let Err(err) = self.adapter.stop_scan().await {
                    warn!("failed to stop scan: {err}");
                }
            }
            RadioCommand::Connect { device } => self.connect(&device),
            RadioCommand::CancelConnect { device } => {
                if let Some(peripheral) = self.devices.get(&device) {
                    if let Err(err) = peripheral.disconnect().await {
                        debug!("disconnect from {device} failed: {err}");
                    }
                }
            }
            RadioCommand::DiscoverServices { device } => {
                if let Err(err) = self.discover(&device).await {
                    warn!("service discovery on {device} failed: {err}");
                    self.emit(RadioEvent::ConnectFailed {
                        device,
                        error: err.to_string(),
                    });
                }
            }
            RadioCommand::Write {
                device,
                characteristic: _,
                data,
                with_response,
            } => self.write(&device, data, with_response).await,
            RadioCommand::StartAdvertising { .. }
            | RadioCommand::StopAdvertising
            | RadioCommand::Notify { .. } => {
                if !self.warned_peripheral {
                    self.warned_peripheral = true;
                    warn!("peripheral role not available through btleplug, dropping advertise/notify commands");
                }
            }
        }
    }

    async fn start_scan(&mut self) {
        let filter = ScanFilter {
            services: vec![SERVICE_UUID],
        };
        // btleplug offers no duplicate-filtering knob; duplicate-allow only
        // changes how often Discovered events reach the core.
        debug!(
            "scanning for mesh service (duplicates requested: {})",
            self.allow_duplicates
        );
        match self.adapter.start_scan(filter).await {
            Ok(()) => self.scanning = true,
            Err(err) => warn!("failed to start scan: {err}"),
        }
    }

    async fn restart_scan_if_active(&mut self) {
        if !self.scanning {
            return;
        }
        let _ = self.adapter.stop_scan().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.start_scan().await;
    }

    fn connect(&self, device: &str) {
        let Some(peripheral) = self.devices.get(device).cloned() else {
            self.emit(RadioEvent::ConnectFailed {
                device: device.to_string(),
                error: "unknown device".to_string(),
            });
            return;
        };
        let events = self.events.clone();
        let device = device.to_string();
        // Connect off-task: success surfaces as DeviceConnected from the
        // adapter event stream, only failures are reported here.
        tokio::spawn(async move {
            match tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    let _ = events.send(RadioEvent::ConnectFailed {
                        device,
                        error: err.to_string(),
                    });
                }
                Err(_) => {
                    let _ = events.send(RadioEvent::ConnectFailed {
                        device,
                        error: "connect timed out".to_string(),
                    });
                }
            }
        });
    }

    async fn discover(&mut self, device: &str) -> Result<()> {
        let peripheral = self
            .devices
            .get(device)
            .cloned()
            .context("unknown device")?;

        peripheral
            .discover_services()
            .await
            .context("failed to discover services")?;

        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == SERVICE_UUID)
            .context("mesh service not offered")?;
        let characteristic = service
            .characteristics
            .iter()
            .find(|c| c.uuid == CHARACTERISTIC_UUID)
            .context("mesh characteristic not offered")?
            .clone();

        peripheral
            .subscribe(&characteristic)
            .await
            .context("failed to subscribe to mesh characteristic")?;
        self.characteristics
            .insert(device.to_string(), characteristic.clone());

        // Pump notifications until the peripheral goes away.
        let events = self.events.clone();
        let device_name = device.to_string();
        let mut notifications = peripheral
            .notifications()
            .await
            .context("failed to open notification stream")?;
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != CHARACTERISTIC_UUID {
                    continue;
                }
                let _ = events.send(RadioEvent::NotificationReceived {
                    device: device_name.clone(),
                    data: notification.value,
                });
            }
            debug!("notification stream for {device_name} ended");
        });

        // btleplug exposes no portable MTU query; the engine clamps to the
        // default fragment size anyway.
        self.emit(RadioEvent::CharacteristicDiscovered {
            device: device.to_string(),
            characteristic: CHARACTERISTIC_UUID,
            max_write_len: DEFAULT_FRAGMENT_SIZE,
        });
        Ok(())
    }

    async fn write(&mut self, device: &str, data: Vec<u8>, with_response: bool) {
        let (Some(peripheral), Some(characteristic)) =
            (self.devices.get(device), self.characteristics.get(device))
        else {
            debug!("write to unknown device {device} dropped");
            return;
        };
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        if let Err(err) = peripheral.write(characteristic, &data, write_type).await {
            warn!("write to {device} failed: {err}");
        }
    }

    async fn handle_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                self.handle_discovered(id).await;
            }
            CentralEvent::DeviceConnected(id) => {
                self.emit(RadioEvent::Connected {
                    device: device_key(&id),
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                let device = device_key(&id);
                self.characteristics.remove(&device);
                self.emit(RadioEvent::Disconnected { device });
            }
            CentralEvent::StateUpdate(state) => {
                let mapped = match state {
                    BtCentralState::PoweredOn => PowerState::PoweredOn,
                    BtCentralState::PoweredOff => PowerState::PoweredOff,
                    _ => PowerState::Unknown,
                };
                self.emit(RadioEvent::CentralState(mapped));
            }
            _ => {}
        }
    }

    async fn handle_discovered(&mut self, id: PeripheralId) {
        let peripheral = match self.adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                debug!("cannot resolve discovered peripheral {id:?}: {err}");
                return;
            }
        };
        let device = device_key(&id);
        let properties = peripheral.properties().await.ok().flatten();

        // The scan filter should already restrict to the mesh service, but
        // some backends report everything.
        if let Some(props) = &properties {
            if !props.services.is_empty() && !props.services.contains(&SERVICE_UUID) {
                return;
            }
        }

        // Platforms that withhold RSSI should not starve discovery.
        let rssi = properties.and_then(|p| p.rssi).unwrap_or(0);
        self.devices.insert(device.clone(), peripheral);
        self.emit(RadioEvent::Discovered {
            device,
            rssi,
            connectable: true,
        });
    }

    fn emit(&self, event: RadioEvent) {
        if self.events.send(event).is_err() {
            debug!("radio event receiver gone");
        }
    }
}
