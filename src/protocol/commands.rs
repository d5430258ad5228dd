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

//! Outbound commands (session -> device).

use super::frames::{Channel, ChannelScaling, WorkMode};

/// A command understood by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetIdentification,
    GetTime,
    GetSensors,
    GetWorkMode,
    GetScaling,
    GetGps,
    Logout,
    SetTime { epoch_seconds: i64 },
    SetDigitalOutput { channel: u8, state: bool },
    GetChannelScaling { channel: Channel },
    SetChannelScaling { channel: Channel, scaling: ChannelScaling },
    SetWorkMode(WorkMode),
}

impl Command {
    /// Set the device clock to the current UTC time.
    pub fn set_time_now() -> Self {
        Self::SetTime {
            epoch_seconds: chrono::Utc::now().timestamp(),
        }
    }

    pub fn set_time(epoch_seconds: i64) -> Self {
        Self::SetTime { epoch_seconds }
    }

    pub fn set_digital_output(channel: u8, state: bool) -> Self {
        Self::SetDigitalOutput { channel, state }
    }

    pub fn get_channel_scaling(channel: Channel) -> Self {
        Self::GetChannelScaling { channel }
    }

    pub fn set_channel_scaling(
        channel: Channel,
        raw_min: i32,
        raw_max: i32,
        zero: f32,
        full: f32,
    ) -> Self {
        Self::SetChannelScaling {
            channel,
            scaling: ChannelScaling {
                raw_min,
                raw_max,
                zero,
                full,
            },
        }
    }

    pub fn set_work_mode_periodic(interval_minutes: u32, power_on_seconds: u32) -> Self {
        Self::SetWorkMode(WorkMode::Periodic {
            interval_minutes,
            power_on_seconds,
        })
    }

    /// Always encodes five `Tn=` slots; missing ones are sent empty.
    pub fn set_work_mode_fixed<S: AsRef<str>>(times: &[S], power_on_seconds: u32) -> Self {
        Self::SetWorkMode(WorkMode::fixed(times, power_on_seconds))
    }

    pub fn set_work_mode_continuous(interval_minutes: u32, power_on_seconds: u32) -> Self {
        Self::SetWorkMode(WorkMode::Continuous {
            interval_minutes,
            power_on_seconds,
        })
    }

    pub fn set_work_mode_disabled() -> Self {
        Self::SetWorkMode(WorkMode::Disabled)
    }

    /// Command keyword (text before the `;`).
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::GetIdentification => "GET_ID",
            Self::GetTime => "GET_TIME",
            Self::GetSensors => "GET_SENSORS",
            Self::GetWorkMode => "GET_MODE",
            Self::GetScaling => "GET_SCALE",
            Self::GetGps => "GET_GPS",
            Self::Logout => "SET_LOGOUT",
            Self::SetTime { .. } => "SET_TIME",
            Self::SetDigitalOutput { .. } => "SET_DO",
            Self::GetChannelScaling { .. } => "GET_SCALE_CH",
            Self::SetChannelScaling { .. } => "SET_SCALE",
            Self::SetWorkMode(_) => "SET_MODE",
        }
    }

    /// Serialize to the newline-terminated wire string.
    pub fn encode(&self) -> String {
        let fields = match self {
            Self::GetIdentification
            | Self::GetTime
            | Self::GetSensors
            | Self::GetWorkMode
            | Self::GetScaling
            | Self::GetGps
            | Self::Logout => String::new(),
            Self::SetTime { epoch_seconds } => format!("EPOCH={}", epoch_seconds),
            Self::SetDigitalOutput { channel, state } => {
                format!("CH={},STATE={}", channel, u8::from(*state))
            }
            Self::GetChannelScaling { channel } => format!("CH={}", channel),
            Self::SetChannelScaling { channel, scaling } => format!(
                "CH={},RMIN={},RMAX={},ZERO={},FULL={}",
                channel,
                scaling.raw_min,
                scaling.raw_max,
                format_float(scaling.zero),
                format_float(scaling.full)
            ),
            Self::SetWorkMode(mode) => mode.wire_fields(),
        };

        format!("{};{}\n", self.keyword(), fields)
    }

    /// Serialize to bytes ready for the stream.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }
}

/// Floats always carry a decimal point on the wire (`0.0`, not `0`).
fn format_float(value: f32) -> String {
    let text = value.to_string();
    if value.is_finite() && !text.contains('.') {
        format!("{}.0", text)
    } else {
        text
    }
}
