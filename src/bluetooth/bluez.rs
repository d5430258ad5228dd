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

//! BlueZ transport (classic RFCOMM / SPP).

use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, Address, Device, ErrorKind};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{
    BondEvent, BondState, DeviceStream, DiscoveredDevice, DiscoveryEvent, Transport,
    TransportError,
};
use crate::config::BluetoothConfig;

/// Standard SPP UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            ErrorKind::NotAuthorized | ErrorKind::NotPermitted => TransportError::PermissionDenied,
            ErrorKind::AuthenticationCanceled
            | ErrorKind::AuthenticationFailed
            | ErrorKind::AuthenticationRejected
            | ErrorKind::AuthenticationTimeout => TransportError::PairingRejected,
            _ => TransportError::Backend(err.to_string()),
        }
    }
}

/// Transport backed by the system BlueZ daemon.
pub struct BluezTransport {
    adapter: Adapter,
    rfcomm_channel: u8,
    discovery: Mutex<Option<CancellationToken>>,
    bond_tx: broadcast::Sender<BondEvent>,
}

impl BluezTransport {
    /// Connect to BlueZ and select the configured (or default) adapter.
    pub async fn new(config: &BluetoothConfig) -> Result<Self, TransportError> {
        info!("Initializing BlueZ transport...");

        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = match &config.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());
        info!("Serial profile {} on RFCOMM channel {}", SPP_UUID, config.rfcomm_channel);

        let (bond_tx, _) = broadcast::channel(16);

        Ok(Self {
            adapter,
            rfcomm_channel: config.rfcomm_channel,
            discovery: Mutex::new(None),
            bond_tx,
        })
    }

    fn device(&self, address: &str) -> Result<(Address, Device), TransportError> {
        let addr: Address = address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
        let device = self.adapter.device(addr)?;
        Ok((addr, device))
    }
}

async fn describe(device: &Device, address: Address) -> DiscoveredDevice {
    let name = device.name().await.ok().flatten();
    let bond_state = match device.is_paired().await {
        Ok(true) => BondState::Bonded,
        _ => BondState::None,
    };
    DiscoveredDevice::new(address.to_string(), name, bond_state)
}

async fn discovery_loop(
    adapter: Adapter,
    cancel: CancellationToken,
    started: oneshot::Sender<Result<(), TransportError>>,
    event_tx: mpsc::Sender<DiscoveryEvent>,
) {
    let events = match adapter.discover_devices().await {
        Ok(events) => {
            let _ = started.send(Ok(()));
            events
        }
        Err(e) => {
            let _ = started.send(Err(e.into()));
            return;
        }
    };
    futures::pin_mut!(events);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Discovery cancelled");
                return;
            }
            event = events.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    let device = match adapter.device(address) {
                        Ok(device) => device,
                        Err(e) => {
                            warn!("Could not look up discovered device {}: {}", address, e);
                            continue;
                        }
                    };
                    let found = describe(&device, address).await;
                    if event_tx.send(DiscoveryEvent::DeviceFound(found)).await.is_err() {
                        return;
                    }
                }
                Some(_) => {}
                None => {
                    info!("Discovery finished by adapter");
                    let _ = event_tx.send(DiscoveryEvent::Finished).await;
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for BluezTransport {
    async fn has_permissions(&self) -> bool {
        // bluetoothd enforces its D-Bus policy per call; denials surface as
        // TransportError::PermissionDenied.
        true
    }

    async fn is_enabled(&self) -> bool {
        match self.adapter.is_powered().await {
            Ok(powered) => powered,
            Err(e) => {
                warn!("Could not query adapter power state: {}", e);
                false
            }
        }
    }

    async fn bonded_devices(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let mut devices = Vec::new();

        for addr in self.adapter.device_addresses().await? {
            let device = self.adapter.device(addr)?;
            if device.is_paired().await? {
                devices.push(describe(&device, addr).await);
            }
        }

        Ok(devices)
    }

    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.discovery.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let (event_tx, event_rx) = mpsc::channel(32);
        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(discovery_loop(
            self.adapter.clone(),
            cancel,
            started_tx,
            event_tx,
        ));

        match started_rx.await {
            Ok(Ok(())) => Ok(event_rx),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Backend("discovery task ended".to_string())),
        }
    }

    async fn stop_discovery(&self) -> Result<(), TransportError> {
        if let Some(cancel) = self.discovery.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }

    async fn request_bond(&self, address: &str) -> Result<(), TransportError> {
        let (_, device) = self.device(address)?;
        let address = address.to_string();
        let bond_tx = self.bond_tx.clone();

        let _ = bond_tx.send(BondEvent {
            address: address.clone(),
            state: BondState::Bonding,
        });

        tokio::spawn(async move {
            let state = match device.pair().await {
                Ok(()) => {
                    info!("Paired with {}", address);
                    if let Err(e) = device.set_trusted(true).await {
                        warn!("Could not mark {} as trusted: {}", address, e);
                    }
                    BondState::Bonded
                }
                Err(e) => {
                    warn!("Pairing with {} failed: {}", address, e);
                    BondState::None
                }
            };
            let _ = bond_tx.send(BondEvent { address, state });
        });

        Ok(())
    }

    fn bond_events(&self) -> broadcast::Receiver<BondEvent> {
        self.bond_tx.subscribe()
    }

    async fn open_stream(&self, address: &str) -> Result<DeviceStream, TransportError> {
        let (addr, _) = self.device(address)?;
        info!("Opening RFCOMM stream to {} on channel {}", addr, self.rfcomm_channel);

        let stream = Stream::connect(SocketAddr::new(addr, self.rfcomm_channel)).await?;
        let (reader, writer) = stream.into_split();

        Ok(DeviceStream::new(reader, writer))
    }
}
