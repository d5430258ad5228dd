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

//! Session facade.
//!
//! Ties the connection manager to the frame codec: received bytes are split
//! into lines, decoded, and the latest value of each frame kind is published
//! on its own `watch` channel.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bluetooth::{
    ConnectionManager, ConnectionState, DiscoveredDevice, LinkError, LinkEvent, Transport,
};
use crate::config::Config;
use crate::protocol::{
    decode, Command, DeviceIdentification, DeviceTime, Frame, GpsFix, LineBuffer, ScalingTable,
    SensorSnapshot, WorkMode,
};

/// Latest decoded value of every frame kind.
pub struct FrameStore {
    identification: watch::Sender<Option<DeviceIdentification>>,
    device_time: watch::Sender<Option<DeviceTime>>,
    sensors: watch::Sender<Option<SensorSnapshot>>,
    work_mode: watch::Sender<Option<WorkMode>>,
    gps: watch::Sender<Option<GpsFix>>,
    scaling: watch::Sender<Option<ScalingTable>>,
    scaling_tag: AtomicU64,
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            identification: watch::channel(None).0,
            device_time: watch::channel(None).0,
            sensors: watch::channel(None).0,
            work_mode: watch::channel(None).0,
            gps: watch::channel(None).0,
            scaling: watch::channel(None).0,
            scaling_tag: AtomicU64::new(0),
        }
    }

    fn next_tag(&self) -> u64 {
        self.scaling_tag.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Store a decoded frame, notifying only that frame kind's observers.
    ///
    /// A single-channel scaling update is merged into the current table (or
    /// the default table if none was received yet). Unknown channel names
    /// leave the table untouched.
    pub fn apply(&self, frame: Frame) {
        match frame {
            Frame::Identification(id) => {
                self.identification.send_replace(Some(id));
            }
            Frame::DeviceTime(time) => {
                self.device_time.send_replace(Some(time));
            }
            Frame::Sensors(sensors) => {
                self.sensors.send_replace(Some(sensors));
            }
            Frame::WorkMode(mode) => {
                self.work_mode.send_replace(Some(mode));
            }
            Frame::Gps(fix) => {
                self.gps.send_replace(Some(fix));
            }
            Frame::ScalingTable(mut table) => {
                table.last_updated = self.next_tag();
                self.scaling.send_replace(Some(table));
            }
            Frame::ScalingChannel(update) => {
                let tag = self.next_tag();
                self.scaling.send_if_modified(|current| {
                    let base = current.clone().unwrap_or_default();
                    match base.with_channel(&update.channel, update.scaling, tag) {
                        Some(table) => {
                            *current = Some(table);
                            true
                        }
                        None => {
                            warn!("Scaling update for unknown channel {:?}", update.channel);
                            false
                        }
                    }
                });
            }
        }
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for talking to one field device.
pub struct Session {
    manager: ConnectionManager,
    frames: Arc<FrameStore>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create the connection manager on `transport` and start the frame pump.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(transport: Arc<dyn Transport>, config: &Config) -> Self {
        let manager = ConnectionManager::new(transport, config.connection());
        let frames = Arc::new(FrameStore::new());
        let cancel = CancellationToken::new();

        let events = manager.subscribe_events();
        let lines = LineBuffer::new(config.session.max_line_length);
        let pump = tokio::spawn(frame_pump(events, frames.clone(), lines, cancel.clone()));

        info!("Session started");

        Self {
            manager,
            frames,
            cancel,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Stop discovery, close the link and stop the background tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down session");
        self.manager.shutdown().await;
        self.cancel.cancel();

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!("Frame pump ended abnormally: {}", e);
            }
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.manager.current_state()
    }

    pub fn devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.manager.devices()
    }

    pub fn scanning(&self) -> watch::Receiver<bool> {
        self.manager.scanning()
    }

    pub fn is_scanning(&self) -> bool {
        self.manager.is_scanning()
    }

    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.manager.subscribe_events()
    }

    pub fn errors(&self) -> broadcast::Receiver<LinkError> {
        self.manager.subscribe_errors()
    }

    pub fn identification(&self) -> watch::Receiver<Option<DeviceIdentification>> {
        self.frames.identification.subscribe()
    }

    pub fn device_time(&self) -> watch::Receiver<Option<DeviceTime>> {
        self.frames.device_time.subscribe()
    }

    pub fn sensors(&self) -> watch::Receiver<Option<SensorSnapshot>> {
        self.frames.sensors.subscribe()
    }

    pub fn work_mode(&self) -> watch::Receiver<Option<WorkMode>> {
        self.frames.work_mode.subscribe()
    }

    pub fn gps(&self) -> watch::Receiver<Option<GpsFix>> {
        self.frames.gps.subscribe()
    }

    pub fn scaling(&self) -> watch::Receiver<Option<ScalingTable>> {
        self.frames.scaling.subscribe()
    }

    pub async fn start_scan(&self) {
        self.manager.start_scan().await;
    }

    pub async fn stop_scan(&self) {
        self.manager.stop_scan().await;
    }

    pub async fn connect(&self, device: &DiscoveredDevice) {
        self.manager.connect(device).await;
    }

    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }

    pub async fn send(&self, data: &[u8]) {
        self.manager.send(data).await;
    }

    pub async fn send_command(&self, command: &Command) {
        debug!("Sending {}", command.keyword());
        self.manager.send(&command.to_bytes()).await;
    }
}

async fn frame_pump(
    mut events: broadcast::Receiver<LinkEvent>,
    frames: Arc<FrameStore>,
    mut lines: LineBuffer,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Frame pump stopped");
                return;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(LinkEvent::Data(bytes)) => {
                for line in lines.push(&bytes) {
                    match decode(&line) {
                        Some(frame) => {
                            debug!("Decoded {} frame", frame.kind());
                            frames.apply(frame);
                        }
                        None => debug!("Dropped frame: {}", String::from_utf8_lossy(&line)),
                    }
                }
            }
            Ok(LinkEvent::State(state)) => {
                if state != ConnectionState::Connected {
                    if lines.pending() > 0 {
                        debug!("Discarding {} buffered bytes", lines.pending());
                    }
                    lines.reset();
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Frame pump lagged, {} events skipped", skipped);
                lines.reset();
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_str, ChannelScaling};

    fn apply(store: &FrameStore, text: &str) {
        store.apply(decode_str(text).unwrap());
    }

    #[test]
    fn test_latest_value_wins() {
        let store = FrameStore::new();
        let sensors = store.sensors.subscribe();

        apply(&store, "TYPE=SENSORS;DI=1,BATT=3.5");
        apply(&store, "TYPE=SENSORS;DI=2,BATT=3.4");

        let latest = sensors.borrow().clone().unwrap();
        assert_eq!(latest.digital_inputs, 2);
        assert!((latest.battery_voltage - 3.4).abs() < 1e-6);
    }

    #[test]
    fn test_only_matching_kind_notified() {
        let store = FrameStore::new();
        let mut identification = store.identification.subscribe();
        let mut gps = store.gps.subscribe();

        apply(&store, "TYPE=GPS;LAT=-3284068,LON=-7047381");

        assert!(gps.has_changed().unwrap());
        assert!(!identification.has_changed().unwrap());
        assert!(identification.borrow_and_update().is_none());
        let fix = gps.borrow_and_update().clone().unwrap();
        assert!((fix.latitude + 32.84068).abs() < 1e-9);
    }

    #[test]
    fn test_channel_update_merges_into_default_table() {
        let store = FrameStore::new();

        apply(
            &store,
            "TYPE=SCALE_CH;CH=AI2,RMIN=0,RMAX=4095,ZERO=-10.0,FULL=50.0",
        );

        let table = store.scaling.borrow().clone().unwrap();
        assert_eq!(table.ai2.raw_min, 0);
        assert_eq!(table.ai2.raw_max, 4095);
        assert_eq!(table.ai0, ChannelScaling::default());
        assert_eq!(table.last_updated, 1);
    }

    #[test]
    fn test_channel_update_merges_into_existing_table() {
        let store = FrameStore::new();

        apply(&store, "TYPE=SCALE;AI0RMIN=100,AI0RMAX=200,AO1Z=5.0");
        let before = store.scaling.borrow().clone().unwrap();

        apply(&store, "TYPE=SCALE_CH;CH=AO0,RMIN=1,RMAX=2,ZERO=3.0,FULL=4.0");
        let after = store.scaling.borrow().clone().unwrap();

        assert_eq!(after.ai0, before.ai0);
        assert_eq!(after.ao1, before.ao1);
        assert_eq!(after.ao0.raw_max, 2);
        assert!(after.last_updated > before.last_updated);
    }

    #[test]
    fn test_unknown_channel_leaves_table() {
        let store = FrameStore::new();
        apply(&store, "TYPE=SCALE;AI0RMIN=100");
        let mut scaling = store.scaling.subscribe();

        apply(&store, "TYPE=SCALE_CH;CH=AI9,RMIN=1");

        assert!(!scaling.has_changed().unwrap());
        assert_eq!(scaling.borrow().as_ref().unwrap().ai0.raw_min, 100);
    }
}
