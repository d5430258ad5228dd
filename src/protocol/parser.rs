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

//! Frame decoding.
//!
//! Decoding never fails loudly: an unknown `TYPE=` yields `None`, and a
//! missing or unparseable field takes its documented default. The only
//! field whose absence rejects a frame is the channel of `SCALE_CH`.

use std::str::FromStr;
use tracing::{debug, warn};

use super::frames::*;

/// Decode one frame from raw bytes (surrounding whitespace is ignored).
pub fn decode(data: &[u8]) -> Option<Frame> {
    let text = String::from_utf8_lossy(data);
    decode_str(text.trim())
}

/// Decode one frame from text.
pub fn decode_str(text: &str) -> Option<Frame> {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("TYPE=") else {
        debug!("Ignoring line without TYPE prefix: {}", text);
        return None;
    };
    let Some((kind, body)) = rest.split_once(';') else {
        debug!("Ignoring frame without body separator: {}", text);
        return None;
    };
    let fields = Fields::new(body);

    let frame = match kind {
        "ID" => Frame::Identification(parse_identification(&fields)),
        "TIME" => Frame::DeviceTime(DeviceTime {
            epoch_seconds: fields.number("EPOCH", 0),
        }),
        "SENSORS" => Frame::Sensors(parse_sensors(&fields)),
        "MODE" => Frame::WorkMode(parse_work_mode(&fields)),
        "GPS" => Frame::Gps(parse_gps(&fields)),
        "SCALE" => Frame::ScalingTable(parse_scaling_table(&fields)),
        "SCALE_CH" => match parse_scaling_channel(&fields) {
            Some(update) => Frame::ScalingChannel(update),
            None => {
                warn!("Dropping SCALE_CH frame without channel: {}", text);
                return None;
            }
        },
        other => {
            debug!("Ignoring unknown frame type {}", other);
            return None;
        }
    };

    Some(frame)
}

/// Comma-separated `NAME=VALUE` tokens of a frame body.
struct Fields<'a> {
    tokens: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(body: &'a str) -> Self {
        Self {
            tokens: body.split(',').map(str::trim).collect(),
        }
    }

    /// Raw value of the first token named `name`.
    fn raw(&self, name: &str) -> Option<&'a str> {
        self.tokens.iter().copied().find_map(|token| {
            token
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    fn text(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or(default).to_string()
    }

    fn number<T: FromStr>(&self, name: &str, default: T) -> T {
        match self.raw(name) {
            Some(value) => value.parse().unwrap_or_else(|_| {
                debug!("Field {} has unparseable value {:?}, using default", name, value);
                default
            }),
            None => default,
        }
    }

    fn scaling(&self, prefix: &str, names: [&str; 4]) -> ChannelScaling {
        let [rmin, rmax, zero, full] = names.map(|n| format!("{}{}", prefix, n));
        ChannelScaling {
            raw_min: self.number(&rmin, ChannelScaling::DEFAULT_RAW_MIN),
            raw_max: self.number(&rmax, ChannelScaling::DEFAULT_RAW_MAX),
            zero: self.number(&zero, ChannelScaling::DEFAULT_ZERO),
            full: self.number(&full, ChannelScaling::DEFAULT_FULL),
        }
    }
}

fn parse_identification(fields: &Fields) -> DeviceIdentification {
    DeviceIdentification {
        device_id: fields.text("DID", NOT_AVAILABLE),
        firmware_version: fields.text("FW", NOT_AVAILABLE),
        hardware_version: fields.text("HW", NOT_AVAILABLE),
        last_configuration: fields.text("CFG", NOT_AVAILABLE),
    }
}

fn parse_sensors(fields: &Fields) -> SensorSnapshot {
    SensorSnapshot {
        digital_inputs: fields.number("DI", 0),
        analog_inputs: ["AI0", "AI1", "AI2", "AI3"].map(|name| fields.number(name, 0.0)),
        digital_outputs: fields.number("DO", 0),
        analog_outputs: ["AO0", "AO1"].map(|name| fields.number(name, 0.0)),
        battery_voltage: fields.number("BATT", 0.0),
    }
}

fn parse_work_mode(fields: &Fields) -> WorkMode {
    let power_on_seconds = fields.number("POWER", 0);

    match fields.raw("MODE").unwrap_or("DISABLED") {
        "PERIODIC" => WorkMode::Periodic {
            interval_minutes: fields.number("INT", 0),
            power_on_seconds,
        },
        "CONTINUOUS" => WorkMode::Continuous {
            interval_minutes: fields.number("INT", 0),
            power_on_seconds,
        },
        "FIXED" => {
            let times = std::array::from_fn(|i| {
                let name = format!("T{}", i + 1);
                let value = fields.text(&name, "");
                if is_valid_time_format(&value) {
                    value
                } else {
                    debug!("Slot {} has invalid time {:?}, leaving it empty", name, value);
                    String::new()
                }
            });
            WorkMode::Fixed {
                times,
                power_on_seconds,
            }
        }
        _ => WorkMode::Disabled,
    }
}

fn parse_gps(fields: &Fields) -> GpsFix {
    let latitude: i64 = fields.number("LAT", 0);
    let longitude: i64 = fields.number("LON", 0);

    GpsFix {
        latitude: latitude as f64 / GPS_SCALE,
        longitude: longitude as f64 / GPS_SCALE,
        model: fields.text("MOD", NOT_AVAILABLE),
        software_revision: fields.text("SOF", NOT_AVAILABLE),
        mobile_id: fields.text("MID", NOT_AVAILABLE),
    }
}

fn parse_scaling_table(fields: &Fields) -> ScalingTable {
    let names = ["RMIN", "RMAX", "Z", "F"];
    ScalingTable {
        ai0: fields.scaling("AI0", names),
        ai1: fields.scaling("AI1", names),
        ai2: fields.scaling("AI2", names),
        ai3: fields.scaling("AI3", names),
        ao0: fields.scaling("AO0", names),
        ao1: fields.scaling("AO1", names),
        last_updated: 0,
    }
}

fn parse_scaling_channel(fields: &Fields) -> Option<ScalingChannelUpdate> {
    let channel = fields.raw("CH")?;
    if channel.is_empty() {
        return None;
    }

    Some(ScalingChannelUpdate {
        channel: channel.to_string(),
        scaling: fields.scaling("", ["RMIN", "RMAX", "ZERO", "FULL"]),
    })
}
