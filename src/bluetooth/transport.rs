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

//! Transport abstraction.
//!
//! Everything radio-specific lives behind [`Transport`]: discovery, bonding
//! and opening the duplex byte stream. Both the BlueZ backend and the
//! in-process simulator implement it.

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

/// Errors reported by a transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    #[error("Bluetooth adapter is powered off")]
    AdapterDisabled,

    #[error("Missing permission to use Bluetooth")]
    PermissionDenied,

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Pairing rejected")]
    PairingRejected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Bluetooth backend error: {0}")]
    Backend(String),
}

/// Trust relationship with a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// A device seen during discovery or known from a previous bond.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub bond_state: BondState,
}

impl DiscoveredDevice {
    pub fn new(address: impl Into<String>, name: Option<String>, bond_state: BondState) -> Self {
        Self {
            address: address.into(),
            name,
            bond_state,
        }
    }

    /// Name for display, falling back to the address.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// Event produced while discovery is running.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    DeviceFound(DiscoveredDevice),
    /// The transport ended discovery on its own.
    Finished,
}

/// Result of a bonding attempt, published by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondEvent {
    pub address: String,
    pub state: BondState,
}

/// Duplex byte stream to a connected device.
pub struct DeviceStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl DeviceStream {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Radio backend used by the connection manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the process may use the radio at all.
    async fn has_permissions(&self) -> bool;

    /// Whether the adapter is present and powered.
    async fn is_enabled(&self) -> bool;

    /// Devices that are already bonded with this host.
    async fn bonded_devices(&self) -> Result<Vec<DiscoveredDevice>, TransportError>;

    /// Start discovery. Events arrive on the returned receiver until
    /// [`Transport::stop_discovery`] is called or the transport finishes.
    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError>;

    /// Stop a running discovery. Calling it when idle is harmless.
    async fn stop_discovery(&self) -> Result<(), TransportError>;

    /// Ask the transport to bond with a device. The outcome is published
    /// later on [`Transport::bond_events`].
    async fn request_bond(&self, address: &str) -> Result<(), TransportError>;

    /// Subscribe to bond state changes.
    fn bond_events(&self) -> broadcast::Receiver<BondEvent>;

    /// Open the byte stream to a bonded device.
    async fn open_stream(&self, address: &str) -> Result<DeviceStream, TransportError>;
}
