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

//! FieldLink command-line companion.

use anyhow::Result;
use std::fmt::Display;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fieldlink::bluetooth::{
    BluezTransport, BondState, DiscoveredDevice, SimulatedTransport, Transport,
};
use fieldlink::config::Config;
use fieldlink::protocol::Command;
use fieldlink::Session;

const SIMULATED_ADDRESS: &str = "00:11:22:33:44:55";

const HELP: &str = "\
Commands:
  scan                      start discovery
  stop                      stop discovery
  devices                   list discovered devices
  connect <address|index>   connect to a device
  disconnect                close the connection
  get <id|time|sensors|mode|scale|gps>
  settime                   set the device clock to now
  do <channel> <0|1>        switch a digital output
  logout                    end the device session
  state                     show the connection state
  quit";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    info!("Starting FieldLink v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", Config::path().display());

    let simulate = std::env::args().skip(1).any(|arg| arg == "--simulate");
    let transport: Arc<dyn Transport> = if simulate {
        info!("Using simulated transport");
        let transport = SimulatedTransport::with_auto_responder();
        transport.add_device(DiscoveredDevice::new(
            SIMULATED_ADDRESS,
            Some("FieldLogger-SIM".to_string()),
            BondState::Bonded,
        ));
        Arc::new(transport)
    } else {
        Arc::new(BluezTransport::new(&config.bluetooth).await?)
    };

    let session = Session::start(transport, &config);

    spawn_frame_logger("Identification", session.identification());
    spawn_frame_logger("Time", session.device_time());
    spawn_frame_logger("Sensors", session.sensors());
    spawn_frame_logger("Work mode", session.work_mode());
    spawn_frame_logger("GPS", session.gps());
    spawn_frame_logger("Scaling", session.scaling());

    let mut errors = session.errors();
    tokio::spawn(async move {
        while let Ok(e) = errors.recv().await {
            error!("{}", e);
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(&session, line.trim()).await {
                    break;
                }
            }
        }
    }

    session.shutdown().await;
    info!("Goodbye");
    Ok(())
}

/// Run one console command. Returns false to quit.
async fn handle_line(session: &Session, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return true;
    };

    match verb {
        "scan" => session.start_scan().await,
        "stop" => session.stop_scan().await,
        "devices" => {
            let devices = session.devices().borrow().clone();
            if devices.is_empty() {
                println!("No devices");
            }
            for (i, device) in devices.iter().enumerate() {
                println!(
                    "{:>2}  {}  {}  {:?}",
                    i,
                    device.address,
                    device.label(),
                    device.bond_state
                );
            }
        }
        "connect" => match words.next().and_then(|target| find_device(session, target)) {
            Some(device) => session.connect(&device).await,
            None => println!("Unknown device, run `scan` and `devices` first"),
        },
        "disconnect" => session.disconnect().await,
        "get" => {
            let command = match words.next() {
                Some("id") => Command::GetIdentification,
                Some("time") => Command::GetTime,
                Some("sensors") => Command::GetSensors,
                Some("mode") => Command::GetWorkMode,
                Some("scale") => Command::GetScaling,
                Some("gps") => Command::GetGps,
                _ => {
                    println!("Usage: get <id|time|sensors|mode|scale|gps>");
                    return true;
                }
            };
            session.send_command(&command).await;
        }
        "settime" => session.send_command(&Command::set_time_now()).await,
        "do" => {
            let channel = words.next().and_then(|w| w.parse::<u8>().ok());
            let state = match words.next() {
                Some("1") => Some(true),
                Some("0") => Some(false),
                _ => None,
            };
            match (channel, state) {
                (Some(channel), Some(state)) => {
                    session
                        .send_command(&Command::set_digital_output(channel, state))
                        .await
                }
                _ => println!("Usage: do <channel> <0|1>"),
            }
        }
        "logout" => session.send_command(&Command::Logout).await,
        "state" => println!("{}", session.current_state().as_str()),
        "help" => println!("{}", HELP),
        "quit" | "exit" => return false,
        other => warn!("Unknown command: {}", other),
    }

    true
}

fn find_device(session: &Session, target: &str) -> Option<DiscoveredDevice> {
    let devices = session.devices().borrow().clone();
    if let Ok(index) = target.parse::<usize>() {
        return devices.get(index).cloned();
    }
    devices
        .into_iter()
        .find(|d| d.address.eq_ignore_ascii_case(target))
}

fn spawn_frame_logger<T>(name: &'static str, mut rx: watch::Receiver<Option<T>>)
where
    T: Display + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let value = rx.borrow_and_update().clone();
            if let Some(value) = value {
                info!("{}: {}", name, value);
            }
        }
    });
}
