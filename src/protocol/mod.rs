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

//! Device frame protocol.
//!
//! Inbound frames are ASCII lines shaped `TYPE=<KIND>;<FIELD>=<VALUE>,...`;
//! outbound commands are `<COMMAND>;<FIELD>=<VALUE>,...`. Everything here is
//! pure: no I/O, no shared state.

mod commands;
mod frames;
mod framing;
mod parser;

pub use commands::Command;
pub use frames::{
    is_valid_time_format, Channel, ChannelScaling, DeviceIdentification, DeviceTime, Frame,
    GpsFix, ScalingChannelUpdate, ScalingTable, SensorSnapshot, WorkMode, DISABLED_SLOT,
    FIXED_SLOTS, GPS_SCALE, NOT_AVAILABLE,
};
pub use framing::{LineBuffer, DEFAULT_MAX_LINE_LENGTH};
pub use parser::{decode, decode_str};
