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

//! Bluetooth link to the field device.
//!
//! The [`Transport`] trait hides the radio; [`ConnectionManager`] drives
//! discovery, pairing and the serial stream on top of it.

mod bluez;
mod connection;
mod simulated;
mod transport;

pub use bluez::{BluezTransport, SPP_UUID};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, LinkError, LinkEvent};
pub use simulated::{SimulatedDevice, SimulatedPeer, SimulatedTransport};
pub use transport::{
    BondEvent, BondState, DeviceStream, DiscoveredDevice, DiscoveryEvent, Transport,
    TransportError,
};
