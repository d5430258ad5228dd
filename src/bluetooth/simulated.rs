// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-process transport.
//!
//! Lets the full discovery / pairing / connect flow run without a radio.
//! Each opened stream is one half of a `tokio::io::duplex` pair; the other
//! half is handed out as a [`SimulatedPeer`] that plays the device. With
//! auto-respond enabled, peers are driven by a [`SimulatedDevice`] that
//! answers commands the way the real firmware does.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::transport::{
    BondEvent, BondState, DeviceStream, DiscoveredDevice, DiscoveryEvent, Transport,
    TransportError,
};
use crate::protocol::{
    Channel, ChannelScaling, DeviceIdentification, DeviceTime, Frame, GpsFix, ScalingChannelUpdate,
    ScalingTable, SensorSnapshot, WorkMode,
};

const DUPLEX_BUFFER: usize = 4096;

struct SimState {
    permissions: bool,
    enabled: bool,
    devices: HashMap<String, DiscoveredDevice>,
    discovery: Option<mpsc::Sender<DiscoveryEvent>>,
    bond_requests: Vec<String>,
    open_failure: Option<String>,
    auto_respond: bool,
}

/// Scriptable in-memory transport.
pub struct SimulatedTransport {
    state: Mutex<SimState>,
    bond_tx: broadcast::Sender<BondEvent>,
    peer_tx: mpsc::UnboundedSender<SimulatedPeer>,
    peer_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SimulatedPeer>>,
}

impl SimulatedTransport {
    /// Create a transport with permissions granted and the adapter on.
    pub fn new() -> Self {
        let (bond_tx, _) = broadcast::channel(16);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        Self {
            state: Mutex::new(SimState {
                permissions: true,
                enabled: true,
                devices: HashMap::new(),
                discovery: None,
                bond_requests: Vec::new(),
                open_failure: None,
                auto_respond: false,
            }),
            bond_tx,
            peer_tx,
            peer_rx: tokio::sync::Mutex::new(peer_rx),
        }
    }

    /// Create a transport whose streams are answered by a [`SimulatedDevice`].
    pub fn with_auto_responder() -> Self {
        let transport = Self::new();
        transport.state.lock().auto_respond = true;
        transport
    }

    pub fn set_permissions(&self, granted: bool) {
        self.state.lock().permissions = granted;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    /// Register a device known to the host (bonded or not).
    pub fn add_device(&self, device: DiscoveredDevice) {
        self.state
            .lock()
            .devices
            .insert(device.address.clone(), device);
    }

    /// Report a device on the running discovery. Returns false if no
    /// discovery is active.
    pub fn announce(&self, device: DiscoveredDevice) -> bool {
        let tx = {
            let mut state = self.state.lock();
            state
                .devices
                .entry(device.address.clone())
                .or_insert_with(|| device.clone());
            state.discovery.clone()
        };

        match tx {
            Some(tx) => tx.try_send(DiscoveryEvent::DeviceFound(device)).is_ok(),
            None => false,
        }
    }

    /// End the running discovery as if the radio finished on its own.
    pub fn finish_discovery(&self) {
        let tx = self.state.lock().discovery.take();
        if let Some(tx) = tx {
            let _ = tx.try_send(DiscoveryEvent::Finished);
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.state.lock().discovery.is_some()
    }

    /// Resolve a pending bond, as the user accepting or rejecting it would.
    pub fn complete_bond(&self, address: &str, accepted: bool) {
        let state = if accepted {
            BondState::Bonded
        } else {
            BondState::None
        };
        if let Some(device) = self.state.lock().devices.get_mut(address) {
            device.bond_state = state;
        }
        let _ = self.bond_tx.send(BondEvent {
            address: address.to_string(),
            state,
        });
    }

    /// Addresses for which bonding was requested, oldest first.
    pub fn bond_requests(&self) -> Vec<String> {
        self.state.lock().bond_requests.clone()
    }

    /// Make the next `open_stream` call fail with the given message.
    pub fn fail_next_open(&self, message: impl Into<String>) {
        self.state.lock().open_failure = Some(message.into());
    }

    /// Wait for the device side of the next opened stream.
    pub async fn next_peer(&self) -> Option<SimulatedPeer> {
        self.peer_rx.lock().await.recv().await
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn has_permissions(&self) -> bool {
        self.state.lock().permissions
    }

    async fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    async fn bonded_devices(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let state = self.state.lock();
        let mut devices: Vec<_> = state
            .devices
            .values()
            .filter(|d| d.bond_state == BondState::Bonded)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }

    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
        let mut state = self.state.lock();
        if !state.enabled {
            return Err(TransportError::AdapterDisabled);
        }
        let (tx, rx) = mpsc::channel(32);
        state.discovery = Some(tx);
        debug!("Simulated discovery started");
        Ok(rx)
    }

    async fn stop_discovery(&self) -> Result<(), TransportError> {
        self.state.lock().discovery = None;
        Ok(())
    }

    async fn request_bond(&self, address: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.bond_requests.push(address.to_string());
        if let Some(device) = state.devices.get_mut(address) {
            device.bond_state = BondState::Bonding;
        }
        let _ = self.bond_tx.send(BondEvent {
            address: address.to_string(),
            state: BondState::Bonding,
        });
        Ok(())
    }

    fn bond_events(&self) -> broadcast::Receiver<BondEvent> {
        self.bond_tx.subscribe()
    }

    async fn open_stream(&self, address: &str) -> Result<DeviceStream, TransportError> {
        let auto_respond = {
            let mut state = self.state.lock();
            if let Some(message) = state.open_failure.take() {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    message,
                )));
            }
            state.auto_respond
        };

        let (client, device) = tokio::io::duplex(DUPLEX_BUFFER);
        let peer = SimulatedPeer {
            address: address.to_string(),
            stream: BufReader::new(device),
        };

        if auto_respond {
            tokio::spawn(peer.serve(SimulatedDevice::default()));
        } else if self.peer_tx.send(peer).is_err() {
            warn!("No listener for simulated peer {}", address);
        }

        let (reader, writer) = tokio::io::split(client);
        Ok(DeviceStream::new(reader, writer))
    }
}

/// Device end of a simulated stream.
pub struct SimulatedPeer {
    pub address: String,
    stream: BufReader<DuplexStream>,
}

impl SimulatedPeer {
    /// Write raw bytes to the session.
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(data).await?;
        stream.flush().await
    }

    /// Write one frame followed by a newline.
    pub async fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.send(format!("{}\n", frame).as_bytes()).await
    }

    /// Read one command line sent by the session (without the newline).
    /// Returns `None` once the session closed the stream.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end().to_string()))
    }

    /// Answer commands from `device` until the session hangs up.
    pub async fn serve(mut self, mut device: SimulatedDevice) {
        info!("Simulated device {} online", self.address);
        loop {
            let line = match self.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Simulated device read error: {}", e);
                    break;
                }
            };

            if let Some(frame) = device.handle(&line) {
                if let Err(e) = self.send_frame(&frame).await {
                    warn!("Simulated device write error: {}", e);
                    break;
                }
            }
        }
        info!("Simulated device {} offline", self.address);
    }
}

/// Firmware model answering commands with frames.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub identification: DeviceIdentification,
    pub epoch_seconds: i64,
    pub sensors: SensorSnapshot,
    pub work_mode: WorkMode,
    pub gps: GpsFix,
    pub scaling: ScalingTable,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            identification: DeviceIdentification {
                device_id: "SIM-0001".to_string(),
                firmware_version: "1.0.0".to_string(),
                hardware_version: "A".to_string(),
                last_configuration: "2026-01-01".to_string(),
            },
            epoch_seconds: 1_767_225_600,
            sensors: SensorSnapshot {
                digital_inputs: 5,
                analog_inputs: [1.2, 3.4, 0.5, 9.9],
                digital_outputs: 1,
                analog_outputs: [4.5, 2.1],
                battery_voltage: 3.7,
            },
            work_mode: WorkMode::Periodic {
                interval_minutes: 15,
                power_on_seconds: 30,
            },
            gps: GpsFix {
                latitude: -32.84068,
                longitude: -68.84,
                model: "SIM".to_string(),
                software_revision: "R01".to_string(),
                mobile_id: "000000".to_string(),
            },
            scaling: ScalingTable::default(),
        }
    }
}

impl SimulatedDevice {
    /// Apply one command line; returns the frame the firmware replies with.
    pub fn handle(&mut self, line: &str) -> Option<Frame> {
        let (keyword, body) = line.split_once(';')?;
        let fields: HashMap<&str, &str> = body
            .split(',')
            .filter_map(|token| token.split_once('='))
            .collect();
        let number = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok());
        let float = |name: &str| fields.get(name).and_then(|v| v.parse::<f32>().ok());

        match keyword {
            "GET_ID" => Some(Frame::Identification(self.identification.clone())),
            "GET_TIME" => Some(Frame::DeviceTime(DeviceTime {
                epoch_seconds: self.epoch_seconds,
            })),
            "GET_SENSORS" => Some(Frame::Sensors(self.sensors.clone())),
            "GET_MODE" => Some(Frame::WorkMode(self.work_mode.clone())),
            "GET_GPS" => Some(Frame::Gps(self.gps.clone())),
            "GET_SCALE" => Some(Frame::ScalingTable(self.scaling.clone())),
            "GET_SCALE_CH" => {
                let channel = Channel::parse(fields.get("CH")?)?;
                Some(Frame::ScalingChannel(ScalingChannelUpdate {
                    channel: channel.as_str().to_string(),
                    scaling: *self.scaling.channel(channel),
                }))
            }
            "SET_TIME" => {
                self.epoch_seconds = number("EPOCH")?;
                Some(Frame::DeviceTime(DeviceTime {
                    epoch_seconds: self.epoch_seconds,
                }))
            }
            "SET_DO" => {
                let channel = number("CH")?;
                if !(0..4).contains(&channel) {
                    return None;
                }
                let mask = 1u32 << channel;
                if number("STATE")? != 0 {
                    self.sensors.digital_outputs |= mask;
                } else {
                    self.sensors.digital_outputs &= !mask;
                }
                Some(Frame::Sensors(self.sensors.clone()))
            }
            "SET_SCALE" => {
                let channel = fields.get("CH")?.to_string();
                let scaling = ChannelScaling {
                    raw_min: number("RMIN")? as i32,
                    raw_max: number("RMAX")? as i32,
                    zero: float("ZERO")?,
                    full: float("FULL")?,
                };
                self.scaling = self.scaling.with_channel(&channel, scaling, 0)?;
                Some(Frame::ScalingChannel(ScalingChannelUpdate { channel, scaling }))
            }
            "SET_MODE" => {
                let frame = crate::protocol::decode_str(&format!("TYPE=MODE;{}", body))?;
                if let Frame::WorkMode(mode) = &frame {
                    self.work_mode = mode.clone();
                }
                Some(frame)
            }
            "SET_LOGOUT" => None,
            other => {
                debug!("Simulated device ignoring {}", other);
                None
            }
        }
    }
}
