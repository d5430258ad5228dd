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

//! Typed records decoded from device frames.
//!
//! Every record implements `Display` producing the text the device itself
//! would send for it (without the trailing newline).

use std::fmt;

/// Placeholder the device format uses for unknown text fields.
pub const NOT_AVAILABLE: &str = "N/A";

/// Number of time slots in a fixed-schedule work mode.
pub const FIXED_SLOTS: usize = 5;

/// Time value marking a fixed-schedule slot as disabled.
pub const DISABLED_SLOT: &str = "24:00";

/// One analog I/O channel of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Ai0,
    Ai1,
    Ai2,
    Ai3,
    Ao0,
    Ao1,
}

impl Channel {
    /// All channels in wire order.
    pub const ALL: [Channel; 6] = [
        Channel::Ai0,
        Channel::Ai1,
        Channel::Ai2,
        Channel::Ai3,
        Channel::Ao0,
        Channel::Ao1,
    ];

    /// Parse from the wire name (case-sensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AI0" => Some(Self::Ai0),
            "AI1" => Some(Self::Ai1),
            "AI2" => Some(Self::Ai2),
            "AI3" => Some(Self::Ai3),
            "AO0" => Some(Self::Ao0),
            "AO1" => Some(Self::Ao1),
            _ => None,
        }
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai0 => "AI0",
            Self::Ai1 => "AI1",
            Self::Ai2 => "AI2",
            Self::Ai3 => "AI3",
            Self::Ao0 => "AO0",
            Self::Ao1 => "AO1",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identification block (`TYPE=ID`).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentification {
    pub device_id: String,
    pub firmware_version: String,
    pub hardware_version: String,
    pub last_configuration: String,
}

impl Default for DeviceIdentification {
    fn default() -> Self {
        Self {
            device_id: NOT_AVAILABLE.to_string(),
            firmware_version: NOT_AVAILABLE.to_string(),
            hardware_version: NOT_AVAILABLE.to_string(),
            last_configuration: NOT_AVAILABLE.to_string(),
        }
    }
}

impl fmt::Display for DeviceIdentification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TYPE=ID;DID={},FW={},HW={},CFG={}",
            self.device_id, self.firmware_version, self.hardware_version, self.last_configuration
        )
    }
}

/// Device clock (`TYPE=TIME`), seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceTime {
    pub epoch_seconds: i64,
}

impl DeviceTime {
    /// Device time as a UTC timestamp, if representable.
    pub fn to_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.epoch_seconds, 0)
    }
}

impl fmt::Display for DeviceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TYPE=TIME;EPOCH={}", self.epoch_seconds)
    }
}

/// I/O snapshot (`TYPE=SENSORS`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorSnapshot {
    /// Bitmask of the digital inputs.
    pub digital_inputs: u32,
    pub analog_inputs: [f32; 4],
    /// Bitmask of the digital outputs.
    pub digital_outputs: u32,
    pub analog_outputs: [f32; 2],
    pub battery_voltage: f32,
}

impl fmt::Display for SensorSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [ai0, ai1, ai2, ai3] = self.analog_inputs;
        let [ao0, ao1] = self.analog_outputs;
        write!(
            f,
            "TYPE=SENSORS;DI={},AI0={},AI1={},AI2={},AI3={},DO={},AO0={},AO1={},BATT={}",
            self.digital_inputs,
            ai0,
            ai1,
            ai2,
            ai3,
            self.digital_outputs,
            ao0,
            ao1,
            self.battery_voltage
        )
    }
}

/// Autonomous transmission schedule of the device.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkMode {
    Periodic {
        interval_minutes: u32,
        power_on_seconds: u32,
    },
    /// Up to five daily slots; an empty slot is unused, `24:00` disables it.
    Fixed {
        times: [String; FIXED_SLOTS],
        power_on_seconds: u32,
    },
    Continuous {
        interval_minutes: u32,
        power_on_seconds: u32,
    },
    Disabled,
}

impl WorkMode {
    /// Build a fixed schedule, padding with empty slots (or dropping extras)
    /// so exactly five are kept.
    pub fn fixed<S: AsRef<str>>(times: &[S], power_on_seconds: u32) -> Self {
        let times = std::array::from_fn(|i| {
            times
                .get(i)
                .map(|t| t.as_ref().to_string())
                .unwrap_or_default()
        });
        Self::Fixed {
            times,
            power_on_seconds,
        }
    }

    /// Wire name of the mode.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Periodic { .. } => "PERIODIC",
            Self::Fixed { .. } => "FIXED",
            Self::Continuous { .. } => "CONTINUOUS",
            Self::Disabled => "DISABLED",
        }
    }

    /// Body fields shared by `TYPE=MODE` frames and `SET_MODE` commands.
    pub(crate) fn wire_fields(&self) -> String {
        match self {
            Self::Periodic {
                interval_minutes,
                power_on_seconds,
            }
            | Self::Continuous {
                interval_minutes,
                power_on_seconds,
            } => format!(
                "MODE={},INT={},POWER={}",
                self.name(),
                interval_minutes,
                power_on_seconds
            ),
            Self::Fixed {
                times,
                power_on_seconds,
            } => {
                let slots = times
                    .iter()
                    .enumerate()
                    .map(|(i, t)| format!("T{}={}", i + 1, t))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("MODE=FIXED,{},POWER={}", slots, power_on_seconds)
            }
            Self::Disabled => "MODE=DISABLED".to_string(),
        }
    }
}

impl fmt::Display for WorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TYPE=MODE;{}", self.wire_fields())
    }
}

/// Check a fixed-schedule slot value.
///
/// Accepts the empty string (unused slot), `24:00` (disabled slot) and
/// `H:MM`/`HH:MM` with hours 0-23 and two-digit minutes 00-59.
pub fn is_valid_time_format(time: &str) -> bool {
    if time.trim().is_empty() {
        return true;
    }

    let Some((hours, minutes)) = time.split_once(':') else {
        return false;
    };

    if hours.is_empty()
        || hours.len() > 2
        || minutes.len() != 2
        || !hours.bytes().all(|b| b.is_ascii_digit())
        || !minutes.bytes().all(|b| b.is_ascii_digit())
    {
        return false;
    }

    let (Ok(h), Ok(m)) = (hours.parse::<u8>(), minutes.parse::<u8>()) else {
        return false;
    };

    if h == 24 {
        return m == 0;
    }

    h <= 23 && m <= 59
}

/// GPS position and modem identification (`TYPE=GPS`).
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    /// Degrees; transmitted as an integer scaled by 10^5.
    pub latitude: f64,
    /// Degrees; transmitted as an integer scaled by 10^5.
    pub longitude: f64,
    pub model: String,
    pub software_revision: String,
    pub mobile_id: String,
}

/// Scale factor of the integer GPS coordinates on the wire.
pub const GPS_SCALE: f64 = 100_000.0;

impl Default for GpsFix {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            model: NOT_AVAILABLE.to_string(),
            software_revision: NOT_AVAILABLE.to_string(),
            mobile_id: NOT_AVAILABLE.to_string(),
        }
    }
}

impl fmt::Display for GpsFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TYPE=GPS;LAT={},LON={},MOD={},SOF={},MID={}",
            (self.latitude * GPS_SCALE).round() as i64,
            (self.longitude * GPS_SCALE).round() as i64,
            self.model,
            self.software_revision,
            self.mobile_id
        )
    }
}

/// Linear raw-count to engineering-unit mapping of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelScaling {
    pub raw_min: i32,
    pub raw_max: i32,
    pub zero: f32,
    pub full: f32,
}

impl ChannelScaling {
    pub const DEFAULT_RAW_MIN: i32 = 800;
    pub const DEFAULT_RAW_MAX: i32 = 4000;
    pub const DEFAULT_ZERO: f32 = 0.0;
    pub const DEFAULT_FULL: f32 = 100.0;
}

impl Default for ChannelScaling {
    fn default() -> Self {
        Self {
            raw_min: Self::DEFAULT_RAW_MIN,
            raw_max: Self::DEFAULT_RAW_MAX,
            zero: Self::DEFAULT_ZERO,
            full: Self::DEFAULT_FULL,
        }
    }
}

/// Scaling of all six analog channels (`TYPE=SCALE`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScalingTable {
    pub ai0: ChannelScaling,
    pub ai1: ChannelScaling,
    pub ai2: ChannelScaling,
    pub ai3: ChannelScaling,
    pub ao0: ChannelScaling,
    pub ao1: ChannelScaling,
    /// Change tag assigned by the session; not part of the wire format.
    pub last_updated: u64,
}

impl ScalingTable {
    pub fn channel(&self, channel: Channel) -> &ChannelScaling {
        match channel {
            Channel::Ai0 => &self.ai0,
            Channel::Ai1 => &self.ai1,
            Channel::Ai2 => &self.ai2,
            Channel::Ai3 => &self.ai3,
            Channel::Ao0 => &self.ao0,
            Channel::Ao1 => &self.ao1,
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut ChannelScaling {
        match channel {
            Channel::Ai0 => &mut self.ai0,
            Channel::Ai1 => &mut self.ai1,
            Channel::Ai2 => &mut self.ai2,
            Channel::Ai3 => &mut self.ai3,
            Channel::Ao0 => &mut self.ao0,
            Channel::Ao1 => &mut self.ao1,
        }
    }

    /// Return a copy with one channel replaced and the change tag set.
    ///
    /// An unknown channel name yields `None`; the caller keeps its table.
    pub fn with_channel(&self, channel_name: &str, scaling: ChannelScaling, tag: u64) -> Option<Self> {
        let channel = Channel::parse(channel_name)?;
        let mut updated = self.clone();
        *updated.channel_mut(channel) = scaling;
        updated.last_updated = tag;
        Some(updated)
    }
}

impl fmt::Display for ScalingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TYPE=SCALE;")?;
        for (i, channel) in Channel::ALL.iter().enumerate() {
            let s = self.channel(*channel);
            if i > 0 {
                f.write_str(",")?;
            }
            write!(
                f,
                "{ch}RMIN={},{ch}RMAX={},{ch}Z={},{ch}F={}",
                s.raw_min,
                s.raw_max,
                s.zero,
                s.full,
                ch = channel.as_str()
            )?;
        }
        Ok(())
    }
}

/// Scaling of a single channel (`TYPE=SCALE_CH`).
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingChannelUpdate {
    /// Channel name as sent by the device; may be unknown to this client.
    pub channel: String,
    pub scaling: ChannelScaling,
}

impl fmt::Display for ScalingChannelUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TYPE=SCALE_CH;CH={},RMIN={},RMAX={},ZERO={},FULL={}",
            self.channel,
            self.scaling.raw_min,
            self.scaling.raw_max,
            self.scaling.zero,
            self.scaling.full
        )
    }
}

/// One decoded inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Identification(DeviceIdentification),
    DeviceTime(DeviceTime),
    Sensors(SensorSnapshot),
    WorkMode(WorkMode),
    Gps(GpsFix),
    ScalingTable(ScalingTable),
    ScalingChannel(ScalingChannelUpdate),
}

impl Frame {
    /// The `TYPE=` discriminator of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identification(_) => "ID",
            Self::DeviceTime(_) => "TIME",
            Self::Sensors(_) => "SENSORS",
            Self::WorkMode(_) => "MODE",
            Self::Gps(_) => "GPS",
            Self::ScalingTable(_) => "SCALE",
            Self::ScalingChannel(_) => "SCALE_CH",
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identification(v) => v.fmt(f),
            Self::DeviceTime(v) => v.fmt(f),
            Self::Sensors(v) => v.fmt(f),
            Self::WorkMode(v) => v.fmt(f),
            Self::Gps(v) => v.fmt(f),
            Self::ScalingTable(v) => v.fmt(f),
            Self::ScalingChannel(v) => v.fmt(f),
        }
    }
}
