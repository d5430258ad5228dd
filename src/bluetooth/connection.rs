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

//! Connection lifecycle of the single remote device.
//!
//! [`ConnectionManager`] owns the transport, the discovery / pairing /
//! connect state machine and the background receive loop. It is the only
//! writer of [`ConnectionState`], the discovered-device list and the
//! scanning flag; everyone else observes them through `watch` receivers.
//!
//! ```text
//! Idle --start_scan--> Discovering --stop_scan/finished--> Idle
//! Idle/Discovering --connect--> Connecting --(bond)--> Connecting --open--> Connected
//! Connecting --bond rejected--> Error("pairing failed")
//! Connecting --open failed--> Error("connect failed: ..")
//! Connected --read/write failure--> Error(..) --> Idle
//! Connected/Connecting/Error --disconnect--> Idle
//! ```

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::transport::{BondEvent, BondState, DiscoveredDevice, DiscoveryEvent, Transport};

/// Lifecycle state of the device link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Discovering,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Discovering => "Discovering...",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Error(message) => message,
        }
    }

    fn holds_link(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Error(_)
        )
    }
}

/// Ordered events published by the manager.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The connection state changed.
    State(ConnectionState),
    /// Raw bytes read from the stream.
    Data(Vec<u8>),
}

/// Errors reported to observers. None of them is fatal; the manager always
/// recovers to a state from which `connect` can be retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("Missing Bluetooth permissions")]
    PermissionDenied,

    #[error("Bluetooth is disabled")]
    AdapterDisabled,

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Pairing with {0} failed")]
    PairingFailed(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Tunables of the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Size of the bounded receive buffer.
    pub read_buffer_size: usize,
    /// Capacity of the event and error broadcast channels.
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            event_capacity: 64,
        }
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// The live (or pending) link to the target device.
#[derive(Default)]
struct Link {
    target: Option<String>,
    writer: Option<SharedWriter>,
    cancel: Option<CancellationToken>,
    /// Set while a bond requested for `target` is outstanding; only then do
    /// bond events resume the connection.
    awaiting_bond: bool,
    /// Bumped on every connect and teardown; stale attempts compare against it.
    attempt: u64,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    devices_tx: watch::Sender<Vec<DiscoveredDevice>>,
    scanning_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<LinkEvent>,
    error_tx: broadcast::Sender<LinkError>,
    link: Mutex<Link>,
    scan: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    bond_watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Owner of the device session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager on top of `transport`.
    ///
    /// Must be called within a Tokio runtime: a task following the
    /// transport's bond events is spawned here.
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (devices_tx, _) = watch::channel(Vec::new());
        let (scanning_tx, _) = watch::channel(false);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (error_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let bond_rx = transport.bond_events();

        let inner = Arc::new(Inner {
            transport,
            config,
            state_tx,
            devices_tx,
            scanning_tx,
            event_tx,
            error_tx,
            link: Mutex::new(Link::default()),
            scan: Mutex::new(None),
            shutdown: CancellationToken::new(),
            bond_watcher: Mutex::new(None),
        });

        let watcher = tokio::spawn(bond_watcher(
            Arc::downgrade(&inner),
            bond_rx,
            inner.shutdown.clone(),
        ));
        *inner.bond_watcher.lock() = Some(watcher);

        Self { inner }
    }

    /// Observe the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Observe the discovered devices, in discovery order.
    pub fn devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.inner.devices_tx.subscribe()
    }

    /// Observe whether discovery is running.
    pub fn scanning(&self) -> watch::Receiver<bool> {
        self.inner.scanning_tx.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        *self.inner.scanning_tx.borrow()
    }

    /// Subscribe to state changes and received bytes, in order.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Subscribe to reported errors.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<LinkError> {
        self.inner.error_tx.subscribe()
    }

    /// Start discovery.
    ///
    /// Rejected without a state change when permissions are missing or the
    /// adapter is off. The device list is reset to the bonded devices.
    pub async fn start_scan(&self) {
        if !self.inner.check_ready().await {
            warn!("Cannot scan: missing permissions or Bluetooth disabled");
            return;
        }
        if self.is_scanning() {
            debug!("Scan already running");
            return;
        }

        let bonded = match self.inner.transport.bonded_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Could not list bonded devices: {}", e);
                Vec::new()
            }
        };
        let mut seeded: Vec<DiscoveredDevice> = Vec::with_capacity(bonded.len());
        for device in bonded {
            if !seeded.iter().any(|d| d.address == device.address) {
                seeded.push(device);
            }
        }
        self.inner.devices_tx.send_replace(seeded);

        let events = match self.inner.transport.start_discovery().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to start discovery: {}", e);
                self.inner.report(LinkError::ScanFailed(e.to_string()));
                return;
            }
        };

        let cancel = CancellationToken::new();
        if let Some(previous) = self.inner.scan.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        info!("Discovery started");
        self.inner.scanning_tx.send_replace(true);
        self.inner.transition_if(
            |s| *s == ConnectionState::Idle,
            ConnectionState::Discovering,
        );

        tokio::spawn(discovery_task(self.inner.clone(), events, cancel));
    }

    /// Stop discovery. Harmless when no discovery is running.
    pub async fn stop_scan(&self) {
        let token = self.inner.scan.lock().take();
        let Some(token) = token else {
            return;
        };
        token.cancel();

        if let Err(e) = self.inner.transport.stop_discovery().await {
            warn!("Failed to stop discovery: {}", e);
        }
        info!("Discovery stopped");
        self.inner.finish_scan();
    }

    /// Connect to `device`, tearing down any previous link first.
    ///
    /// Resolves once the stream is open (bonded device) or pairing has been
    /// requested (unbonded device); the bond event resumes the latter.
    pub async fn connect(&self, device: &DiscoveredDevice) {
        if !self.inner.check_ready().await {
            warn!("Cannot connect: missing permissions or Bluetooth disabled");
            return;
        }

        self.stop_scan().await;
        self.disconnect().await;

        let address = device.address.clone();
        let attempt = {
            let mut link = self.inner.link.lock();
            link.attempt += 1;
            link.target = Some(address.clone());
            link.awaiting_bond = device.bond_state != BondState::Bonded;
            self.inner.set_state(ConnectionState::Connecting);
            link.attempt
        };
        info!("Connecting to {} [{}]", device.label(), address);

        match device.bond_state {
            BondState::Bonded => {
                debug!("Device already bonded, opening stream");
                self.inner.open_link(&address, attempt).await;
            }
            BondState::None => {
                info!("Device not bonded, requesting pairing");
                if let Err(e) = self.inner.transport.request_bond(&address).await {
                    warn!("Pairing request failed: {}", e);
                    self.inner.pairing_failed(&address, attempt);
                }
            }
            BondState::Bonding => {
                info!("Pairing already in progress");
            }
        }
    }

    /// Feed a bond state change for a device.
    ///
    /// Only acts when `event.address` is the pending connection target.
    pub async fn on_bond_event(&self, event: BondEvent) {
        self.inner.on_bond_event(event).await;
    }

    /// Close the link. Idempotent; a no-op on `Idle`.
    ///
    /// Never waits on a pending `send`: the link's token aborts it, and the
    /// stream closes once that send lets go of the writer.
    pub async fn disconnect(&self) {
        let writer = self.inner.release_link();
        if let Some(writer) = writer {
            match writer.try_lock() {
                Ok(mut writer) => {
                    if let Err(e) = writer.shutdown().await {
                        debug!("Stream shutdown: {}", e);
                    }
                }
                Err(_) => debug!("Writer busy, leaving close to the aborted send"),
            }
        }
    }

    /// Stop discovery, close the link and stop the bond watcher.
    pub async fn shutdown(&self) {
        self.stop_scan().await;
        self.disconnect().await;
        self.inner.shutdown.cancel();

        let watcher = self.inner.bond_watcher.lock().take();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                warn!("Bond watcher ended abnormally: {}", e);
            }
        }
    }

    /// Write bytes to the device.
    ///
    /// Dropped (and logged) unless the state is exactly `Connected`. A write
    /// failure is handled like a lost connection.
    pub async fn send(&self, data: &[u8]) {
        let (writer, cancel) = {
            let link = self.inner.link.lock();
            let connected = *self.inner.state_tx.borrow() == ConnectionState::Connected;
            match (&link.writer, &link.cancel) {
                (Some(writer), Some(cancel)) if connected => (writer.clone(), cancel.clone()),
                _ => {
                    warn!("Cannot send {} bytes: not connected", data.len());
                    return;
                }
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Send of {} bytes aborted, link closed", data.len());
                return;
            }
            result = write_to(&writer, data) => result,
        };

        match result {
            Ok(()) => debug!("Sent {} bytes", data.len()),
            Err(e) => {
                self.inner
                    .link_failed(&cancel, "send failed", LinkError::SendFailed(e.to_string()));
            }
        }
    }
}

impl Inner {
    /// Replace the state and publish the change.
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            info!("Connection state: {:?} -> {:?}", previous, state);
            let _ = self.event_tx.send(LinkEvent::State(state));
        }
    }

    fn transition_if(&self, condition: impl FnOnce(&ConnectionState) -> bool, state: ConnectionState) {
        let current = self.state_tx.borrow().clone();
        if condition(&current) {
            self.set_state(state);
        }
    }

    fn report(&self, error: LinkError) {
        let _ = self.error_tx.send(error);
    }

    async fn check_ready(&self) -> bool {
        if !self.transport.has_permissions().await {
            self.report(LinkError::PermissionDenied);
            return false;
        }
        if !self.transport.is_enabled().await {
            self.report(LinkError::AdapterDisabled);
            return false;
        }
        true
    }

    fn finish_scan(&self) {
        self.scan.lock().take();
        self.scanning_tx.send_replace(false);
        self.transition_if(
            |s| *s == ConnectionState::Discovering,
            ConnectionState::Idle,
        );
    }

    fn add_discovered(&self, device: DiscoveredDevice) {
        if device.name.is_none() {
            debug!("Ignoring unnamed device {}", device.address);
            return;
        }
        self.devices_tx.send_if_modified(|devices| {
            if devices.iter().any(|d| d.address == device.address) {
                return false;
            }
            info!("Found device {} [{}]", device.label(), device.address);
            devices.push(device);
            true
        });
    }

    async fn open_link(self: &Arc<Self>, address: &str, attempt: u64) {
        let result = self.transport.open_stream(address).await;

        let mut link = self.link.lock();
        if link.attempt != attempt || link.target.as_deref() != Some(address) {
            info!("Connection attempt to {} was superseded", address);
            return;
        }

        match result {
            Ok(_) if link.writer.is_some() => {
                warn!("Already connected to {}, dropping extra stream", address);
            }
            Ok(stream) => {
                let cancel = CancellationToken::new();
                link.writer = Some(Arc::new(tokio::sync::Mutex::new(stream.writer)));
                link.cancel = Some(cancel.clone());
                self.devices_tx.send_replace(Vec::new());
                self.set_state(ConnectionState::Connected);
                info!("Connected to {}", address);

                tokio::spawn(receive_loop(self.clone(), stream.reader, cancel));
            }
            Err(e) => {
                error!("Failed to open stream to {}: {}", address, e);
                link.target = None;
                link.attempt += 1;
                self.set_state(ConnectionState::Error(format!("connect failed: {}", e)));
                self.report(LinkError::ConnectFailed(e.to_string()));
            }
        }
    }

    fn pairing_failed(&self, address: &str, attempt: u64) {
        let mut link = self.link.lock();
        if link.attempt != attempt {
            return;
        }
        link.target = None;
        link.awaiting_bond = false;
        link.attempt += 1;
        self.set_state(ConnectionState::Error("pairing failed".to_string()));
        self.report(LinkError::PairingFailed(address.to_string()));
    }

    async fn on_bond_event(self: &Arc<Self>, event: BondEvent) {
        let attempt = {
            let mut link = self.link.lock();
            if !link.awaiting_bond || link.target.as_deref() != Some(event.address.as_str()) {
                debug!("Ignoring bond event for {}", event.address);
                return;
            }
            // One bond result resumes the attempt at most once.
            if event.state != BondState::Bonding {
                link.awaiting_bond = false;
            }
            link.attempt
        };

        match event.state {
            BondState::Bonded => {
                info!("Bonded with {}, opening stream", event.address);
                self.open_link(&event.address, attempt).await;
            }
            BondState::None => {
                warn!("Pairing with {} failed or was rejected", event.address);
                self.pairing_failed(&event.address, attempt);
            }
            BondState::Bonding => debug!("Bonding with {}...", event.address),
        }
    }

    /// Detach the link and go back to `Idle`. Returns the writer so the
    /// caller can shut it down outside the lock.
    fn release_link(&self) -> Option<SharedWriter> {
        let mut link = self.link.lock();
        if let Some(cancel) = link.cancel.take() {
            cancel.cancel();
        }
        let had_target = link.target.take().is_some();
        link.awaiting_bond = false;
        link.attempt += 1;
        let writer = link.writer.take();

        let state = self.state_tx.borrow().clone();
        if state.holds_link() {
            info!("Disconnecting");
            self.set_state(ConnectionState::Idle);
        } else if had_target || writer.is_some() {
            debug!("Released link while {:?}", state);
        }
        writer
    }

    /// Handle an I/O failure on the link guarded by `cancel`: report
    /// `Error(message)` then tear down to `Idle`. Does nothing if the link
    /// was already cancelled by an explicit disconnect.
    fn link_failed(&self, cancel: &CancellationToken, message: &str, error: LinkError) {
        let mut link = self.link.lock();
        if cancel.is_cancelled() {
            return;
        }
        warn!("{}", error);
        cancel.cancel();
        link.cancel = None;
        link.target = None;
        link.writer = None;
        link.attempt += 1;

        self.set_state(ConnectionState::Error(message.to_string()));
        self.report(error);
        self.set_state(ConnectionState::Idle);
    }
}

async fn write_to(writer: &SharedWriter, data: &[u8]) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(data).await?;
    writer.flush().await
}

async fn bond_watcher(
    inner: Weak<Inner>,
    mut events: broadcast::Receiver<BondEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Bond watcher stopped");
                return;
            }
            received = events.recv() => received,
        };
        let event = match received {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} bond events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.on_bond_event(event).await;
    }
}

async fn discovery_task(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(DiscoveryEvent::DeviceFound(device)) => inner.add_discovered(device),
                Some(DiscoveryEvent::Finished) | None => {
                    info!("Discovery finished");
                    if !cancel.is_cancelled() {
                        inner.finish_scan();
                    }
                    return;
                }
            }
        }
    }
}

async fn receive_loop(
    inner: Arc<Inner>,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; inner.config.read_buffer_size.max(1)];
    debug!("Receive loop started");

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Receive loop cancelled");
                return;
            }
            result = reader.read(&mut buffer) => result,
        };

        match result {
            Ok(0) => {
                inner.link_failed(
                    &cancel,
                    "connection lost",
                    LinkError::ConnectionLost("stream closed by remote".to_string()),
                );
                return;
            }
            Ok(n) => {
                debug!("Received {} bytes", n);
                let _ = inner.event_tx.send(LinkEvent::Data(buffer[..n].to_vec()));
            }
            Err(e) => {
                inner.link_failed(
                    &cancel,
                    "connection lost",
                    LinkError::ConnectionLost(e.to_string()),
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::simulated::SimulatedTransport;
    use crate::bluetooth::transport::{DeviceStream, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Simulated radio whose stream opens take a while. Only the first open
    /// succeeds, like a device that accepts a single RFCOMM link.
    struct SlowOpenTransport {
        radio: SimulatedTransport,
        opens: AtomicUsize,
    }

    impl SlowOpenTransport {
        fn new() -> Self {
            Self {
                radio: SimulatedTransport::new(),
                opens: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for SlowOpenTransport {
        async fn has_permissions(&self) -> bool {
            self.radio.has_permissions().await
        }

        async fn is_enabled(&self) -> bool {
            self.radio.is_enabled().await
        }

        async fn bonded_devices(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
            self.radio.bonded_devices().await
        }

        async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
            self.radio.start_discovery().await
        }

        async fn stop_discovery(&self) -> Result<(), TransportError> {
            self.radio.stop_discovery().await
        }

        async fn request_bond(&self, address: &str) -> Result<(), TransportError> {
            self.radio.request_bond(address).await
        }

        fn bond_events(&self) -> broadcast::Receiver<BondEvent> {
            self.radio.bond_events()
        }

        async fn open_stream(&self, address: &str) -> Result<DeviceStream, TransportError> {
            let previous = self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            if previous > 0 {
                return Err(TransportError::Backend("busy".to_string()));
            }
            self.radio.open_stream(address).await
        }
    }

    const ADDR: &str = "00:11:22:33:44:55";

    fn setup() -> (Arc<SimulatedTransport>, ConnectionManager) {
        let transport = Arc::new(SimulatedTransport::new());
        let manager = ConnectionManager::new(transport.clone(), ConnectionConfig::default());
        (transport, manager)
    }

    fn bonded() -> DiscoveredDevice {
        DiscoveredDevice::new(ADDR, Some("Logger".to_string()), BondState::Bonded)
    }

    async fn wait_state(manager: &ConnectionManager, wanted: ConnectionState) {
        let mut rx = manager.state();
        timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_connect_bonded_device() {
        let (transport, manager) = setup();
        let mut events = manager.subscribe_events();

        manager.connect(&bonded()).await;
        assert_eq!(manager.current_state(), ConnectionState::Connected);

        let peer = transport.next_peer().await.unwrap();
        assert_eq!(peer.address, ADDR);
        assert!(transport.bond_requests().is_empty());

        match events.recv().await.unwrap() {
            LinkEvent::State(state) => assert_eq!(state, ConnectionState::Connecting),
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await.unwrap() {
            LinkEvent::State(state) => assert_eq!(state, ConnectionState::Connected),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_unbonded_requests_pairing() {
        let (transport, manager) = setup();
        let device = DiscoveredDevice::new(ADDR, Some("Logger".to_string()), BondState::None);
        transport.add_device(device.clone());

        manager.connect(&device).await;
        assert_eq!(manager.current_state(), ConnectionState::Connecting);
        assert_eq!(transport.bond_requests(), vec![ADDR.to_string()]);

        transport.complete_bond(ADDR, true);
        wait_state(&manager, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_pairing_rejected() {
        let (transport, manager) = setup();
        let mut errors = manager.subscribe_errors();
        let device = DiscoveredDevice::new(ADDR, None, BondState::None);

        manager.connect(&device).await;
        transport.complete_bond(ADDR, false);

        wait_state(&manager, ConnectionState::Error("pairing failed".to_string())).await;
        assert_eq!(
            errors.recv().await.unwrap(),
            LinkError::PairingFailed(ADDR.to_string())
        );
    }

    #[tokio::test]
    async fn test_bond_event_for_other_device_ignored() {
        let (transport, manager) = setup();
        let device = DiscoveredDevice::new(ADDR, None, BondState::None);

        manager.connect(&device).await;
        transport.complete_bond("AA:BB:CC:DD:EE:FF", true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.current_state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_open_failure_sets_error() {
        let (transport, manager) = setup();
        transport.fail_next_open("refused");

        manager.connect(&bonded()).await;

        match manager.current_state() {
            ConnectionState::Error(message) => assert!(message.starts_with("connect failed")),
            other => panic!("unexpected state {:?}", other),
        }

        // An explicit action leaves the error state.
        manager.connect(&bonded()).await;
        assert_eq!(manager.current_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_peer_drop_goes_error_then_idle() {
        let (transport, manager) = setup();
        let mut events = manager.subscribe_events();

        manager.connect(&bonded()).await;
        let peer = transport.next_peer().await.unwrap();
        drop(peer);

        wait_state(&manager, ConnectionState::Idle).await;

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let LinkEvent::State(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Error("connection lost".to_string()),
                ConnectionState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_received_bytes_are_published() {
        let (transport, manager) = setup();
        let mut events = manager.subscribe_events();

        manager.connect(&bonded()).await;
        let mut peer = transport.next_peer().await.unwrap();
        peer.send(b"TYPE=GPS;").await.unwrap();

        let data = timeout(Duration::from_secs(2), async {
            loop {
                if let LinkEvent::Data(data) = events.recv().await.unwrap() {
                    return data;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(data, b"TYPE=GPS;".to_vec());
    }

    #[tokio::test]
    async fn test_send_reaches_device() {
        let (transport, manager) = setup();

        manager.connect(&bonded()).await;
        let mut peer = transport.next_peer().await.unwrap();

        manager.send(b"GET_ID\n").await;
        let line = peer.read_line().await.unwrap();
        assert_eq!(line.as_deref(), Some("GET_ID"));
    }

    #[tokio::test]
    async fn test_send_while_idle_is_dropped() {
        let (_transport, manager) = setup();
        let mut events = manager.subscribe_events();

        manager.send(b"GET_ID\n").await;

        assert_eq!(manager.current_state(), ConnectionState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (transport, manager) = setup();
        let mut errors = manager.subscribe_errors();

        manager.disconnect().await;
        assert_eq!(manager.current_state(), ConnectionState::Idle);

        manager.connect(&bonded()).await;
        let _peer = transport.next_peer().await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.current_state(), ConnectionState::Idle);
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_permission_rejection() {
        let (transport, manager) = setup();
        let mut errors = manager.subscribe_errors();
        transport.set_permissions(false);

        manager.connect(&bonded()).await;
        manager.start_scan().await;

        assert_eq!(manager.current_state(), ConnectionState::Idle);
        assert!(!manager.is_scanning());
        assert_eq!(errors.recv().await.unwrap(), LinkError::PermissionDenied);
        assert_eq!(errors.recv().await.unwrap(), LinkError::PermissionDenied);
    }

    #[tokio::test]
    async fn test_adapter_disabled() {
        let (transport, manager) = setup();
        let mut errors = manager.subscribe_errors();
        transport.set_enabled(false);

        manager.start_scan().await;

        assert_eq!(manager.current_state(), ConnectionState::Idle);
        assert_eq!(errors.recv().await.unwrap(), LinkError::AdapterDisabled);
    }

    #[tokio::test]
    async fn test_scan_collects_named_unique_devices() {
        let (transport, manager) = setup();
        transport.add_device(bonded());

        manager.start_scan().await;
        assert!(manager.is_scanning());
        assert_eq!(manager.current_state(), ConnectionState::Discovering);
        assert_eq!(manager.devices().borrow().len(), 1);

        let other = DiscoveredDevice::new("AA:BB:CC:DD:EE:FF", Some("Probe".into()), BondState::None);
        assert!(transport.announce(other.clone()));
        assert!(transport.announce(other));
        assert!(transport.announce(DiscoveredDevice::new(
            "11:11:11:11:11:11",
            None,
            BondState::None
        )));
        assert!(transport.announce(bonded()));
        transport.finish_discovery();

        let mut scanning = manager.scanning();
        timeout(Duration::from_secs(2), scanning.wait_for(|s| !*s))
            .await
            .unwrap()
            .unwrap();

        let devices = manager.devices().borrow().clone();
        let addresses: Vec<_> = devices.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec![ADDR, "AA:BB:CC:DD:EE:FF"]);
        assert_eq!(manager.current_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_stops_scan() {
        let (transport, manager) = setup();

        manager.start_scan().await;
        manager.connect(&bonded()).await;

        assert!(!manager.is_scanning());
        assert!(!transport.is_discovering());
        assert_eq!(manager.current_state(), ConnectionState::Connected);
        assert!(manager.devices().borrow().is_empty());
    }

    #[tokio::test]
    async fn test_connect_replaces_existing_link() {
        let (transport, manager) = setup();

        manager.connect(&bonded()).await;
        let mut first = transport.next_peer().await.unwrap();
        manager.connect(&bonded()).await;
        let _second = transport.next_peer().await.unwrap();

        // The old stream was shut down by the teardown.
        assert_eq!(first.read_line().await.unwrap(), None);
        assert_eq!(manager.current_state(), ConnectionState::Connected);
    }
    #[tokio::test]
    async fn test_bond_event_during_open_is_ignored() {
        let transport = Arc::new(SlowOpenTransport::new());
        let manager = ConnectionManager::new(transport.clone(), ConnectionConfig::default());

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(&bonded()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // A late result from an earlier pairing on the same address.
        transport.radio.complete_bond(ADDR, true);

        connecting.await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.current_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_repeated_bond_result_opens_once() {
        let (transport, manager) = setup();
        let device = DiscoveredDevice::new(ADDR, None, BondState::None);

        manager.connect(&device).await;
        transport.complete_bond(ADDR, true);
        transport.complete_bond(ADDR, true);
        wait_state(&manager, ConnectionState::Connected).await;

        let _peer = transport.next_peer().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(timeout(Duration::from_millis(50), transport.next_peer())
            .await
            .is_err());
        assert_eq!(manager.current_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_does_not_wait_for_stalled_send() {
        let (transport, manager) = setup();
        let mut errors = manager.subscribe_errors();

        manager.connect(&bonded()).await;
        // The device never reads, so a large write stalls.
        let _peer = transport.next_peer().await.unwrap();

        let sending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send(&vec![b'x'; 64 * 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        timeout(Duration::from_secs(2), manager.disconnect())
            .await
            .expect("disconnect blocked by pending send");
        timeout(Duration::from_secs(2), sending)
            .await
            .expect("send not aborted")
            .unwrap();

        assert_eq!(manager.current_state(), ConnectionState::Idle);
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_bond_watcher() {
        let (transport, manager) = setup();

        manager.connect(&bonded()).await;
        timeout(Duration::from_secs(2), manager.shutdown())
            .await
            .expect("shutdown did not finish");

        assert_eq!(manager.current_state(), ConnectionState::Idle);
        // Bond results after shutdown are not acted on.
        transport.complete_bond(ADDR, true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.current_state(), ConnectionState::Idle);
    }
}
