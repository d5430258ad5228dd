//! End-to-end session tests over the simulated transport.

use std::sync::Arc;
use std::time::Duration;

use fieldlink::bluetooth::{
    BondState, ConnectionState, DiscoveredDevice, LinkError, LinkEvent, SimulatedDevice,
    SimulatedTransport,
};
use fieldlink::config::Config;
use fieldlink::protocol::{Channel, Command, WorkMode};
use fieldlink::Session;
use tokio::sync::watch;
use tokio::time::timeout;

const ADDR: &str = "00:11:22:33:44:55";

fn device(bond_state: BondState) -> DiscoveredDevice {
    DiscoveredDevice::new(ADDR, Some("FieldLogger".to_string()), bond_state)
}

fn start(transport: &Arc<SimulatedTransport>) -> Session {
    Session::start(transport.clone(), &Config::default())
}

async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, condition: F)
where
    F: FnMut(&T) -> bool,
{
    timeout(Duration::from_secs(2), rx.wait_for(condition))
        .await
        .expect("timed out")
        .expect("channel closed");
}

#[tokio::test]
async fn test_sensor_frame_reaches_observers() {
    let transport = Arc::new(SimulatedTransport::new());
    let session = start(&transport);
    let mut sensors = session.sensors();

    session.connect(&device(BondState::Bonded)).await;
    assert_eq!(session.current_state(), ConnectionState::Connected);

    let mut peer = transport.next_peer().await.unwrap();
    peer.send(b"TYPE=SENSORS;DI=5,AI0=1.2,AI1=3.4,AI2=0.5,AI3=9.9,DO=1,AO0=4.5,AO1=2.1,BATT=3.7\n")
        .await
        .unwrap();

    wait_for(&mut sensors, |s| s.is_some()).await;
    let snapshot = sensors.borrow().clone().unwrap();
    assert_eq!(snapshot.digital_inputs, 5);
    assert_eq!(snapshot.analog_inputs, [1.2, 3.4, 0.5, 9.9]);
    assert_eq!(snapshot.digital_outputs, 1);
    assert_eq!(snapshot.analog_outputs, [4.5, 2.1]);
    assert!((snapshot.battery_voltage - 3.7).abs() < 1e-6);

    session.shutdown().await;
}

#[tokio::test]
async fn test_frame_split_across_reads() {
    let transport = Arc::new(SimulatedTransport::new());
    let session = start(&transport);
    let mut gps = session.gps();
    let mut time = session.device_time();

    session.connect(&device(BondState::Bonded)).await;
    let mut peer = transport.next_peer().await.unwrap();

    peer.send(b"TYPE=GPS;LAT=-3284").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.send(b"068,LON=-6884000\r\nTYPE=TIME;EPOCH=1700000000\n")
        .await
        .unwrap();

    wait_for(&mut gps, |g| g.is_some()).await;
    wait_for(&mut time, |t| t.is_some()).await;

    let fix = gps.borrow().clone().unwrap();
    assert!((fix.latitude + 32.84068).abs() < 1e-9);
    assert!((fix.longitude + 68.84).abs() < 1e-9);
    assert_eq!(time.borrow().as_ref().unwrap().epoch_seconds, 1_700_000_000);

    session.shutdown().await;
}

#[tokio::test]
async fn test_unknown_and_malformed_frames_are_dropped() {
    let transport = Arc::new(SimulatedTransport::new());
    let session = start(&transport);
    let mut identification = session.identification();

    session.connect(&device(BondState::Bonded)).await;
    let mut peer = transport.next_peer().await.unwrap();

    peer.send(b"TYPE=BATTERY;LEVEL=90\ngarbage\nTYPE=SCALE_CH;RMIN=1\nTYPE=ID;DID=ABC\n")
        .await
        .unwrap();

    wait_for(&mut identification, |i| i.is_some()).await;
    assert_eq!(
        identification.borrow().as_ref().unwrap().device_id,
        "ABC"
    );
    assert!(session.scaling().borrow().is_none());
    assert_eq!(session.current_state(), ConnectionState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_pairing_then_connect() {
    let transport = Arc::new(SimulatedTransport::new());
    transport.add_device(device(BondState::None));
    let session = start(&transport);
    let mut state = session.state();

    session.connect(&device(BondState::None)).await;
    assert_eq!(session.current_state(), ConnectionState::Connecting);
    assert_eq!(transport.bond_requests(), vec![ADDR.to_string()]);

    transport.complete_bond(ADDR, true);
    wait_for(&mut state, |s| *s == ConnectionState::Connected).await;

    session.shutdown().await;
    assert_eq!(session.current_state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_connection_loss_recovers_to_idle() {
    let transport = Arc::new(SimulatedTransport::new());
    let session = start(&transport);
    let mut events = session.events();
    let mut errors = session.errors();
    let mut state = session.state();

    session.connect(&device(BondState::Bonded)).await;
    let peer = transport.next_peer().await.unwrap();
    drop(peer);

    wait_for(&mut state, |s| *s == ConnectionState::Idle).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LinkEvent::State(state) = event {
            seen.push(state);
        }
    }
    assert!(seen.ends_with(&[
        ConnectionState::Error("connection lost".to_string()),
        ConnectionState::Idle,
    ]));
    assert!(matches!(
        errors.recv().await.unwrap(),
        LinkError::ConnectionLost(_)
    ));

    // A fresh connect works after the loss.
    session.connect(&device(BondState::Bonded)).await;
    assert_eq!(session.current_state(), ConnectionState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_raises_no_error() {
    let transport = Arc::new(SimulatedTransport::new());
    let session = start(&transport);
    let mut errors = session.errors();

    session.disconnect().await;
    session.connect(&device(BondState::Bonded)).await;
    let _peer = transport.next_peer().await.unwrap();
    session.disconnect().await;
    session.disconnect().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.current_state(), ConnectionState::Idle);
    assert!(errors.try_recv().is_err());

    session.shutdown().await;
}

#[tokio::test]
async fn test_send_while_disconnected_is_ignored() {
    let transport = Arc::new(SimulatedTransport::new());
    let session = start(&transport);
    let mut errors = session.errors();

    session.send_command(&Command::GetSensors).await;

    assert_eq!(session.current_state(), ConnectionState::Idle);
    assert!(errors.try_recv().is_err());

    session.shutdown().await;
}

#[tokio::test]
async fn test_permission_rejection_reports_error() {
    let transport = Arc::new(SimulatedTransport::new());
    transport.set_permissions(false);
    let session = start(&transport);
    let mut errors = session.errors();

    session.start_scan().await;

    assert!(!session.is_scanning());
    assert_eq!(session.current_state(), ConnectionState::Idle);
    assert_eq!(errors.recv().await.unwrap(), LinkError::PermissionDenied);

    session.shutdown().await;
}

#[tokio::test]
async fn test_scan_then_connect_clears_devices() {
    let transport = Arc::new(SimulatedTransport::new());
    transport.add_device(device(BondState::Bonded));
    let session = start(&transport);
    let mut devices = session.devices();

    session.start_scan().await;
    assert!(session.is_scanning());
    transport.announce(DiscoveredDevice::new(
        "AA:BB:CC:DD:EE:FF",
        Some("Probe".to_string()),
        BondState::None,
    ));
    wait_for(&mut devices, |d| d.len() == 2).await;

    let target = session.devices().borrow()[0].clone();
    assert_eq!(target.address, ADDR);
    session.connect(&target).await;

    assert!(!session.is_scanning());
    assert!(session.devices().borrow().is_empty());
    assert_eq!(session.current_state(), ConnectionState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_commands_against_simulated_device() {
    let transport = Arc::new(SimulatedTransport::new());
    let session = start(&transport);
    let mut sensors = session.sensors();
    let mut scaling = session.scaling();
    let mut mode = session.work_mode();

    session.connect(&device(BondState::Bonded)).await;
    let peer = transport.next_peer().await.unwrap();
    tokio::spawn(peer.serve(SimulatedDevice::default()));

    session
        .send_command(&Command::set_digital_output(2, true))
        .await;
    wait_for(&mut sensors, |s| {
        s.as_ref().map_or(false, |s| s.digital_outputs == 0b101)
    })
    .await;

    session
        .send_command(&Command::set_channel_scaling(Channel::Ai1, 0, 4095, -5.0, 5.0))
        .await;
    wait_for(&mut scaling, |t| t.is_some()).await;
    let table = scaling.borrow().clone().unwrap();
    assert_eq!(table.ai1.raw_max, 4095);
    assert_eq!(table.ai0.raw_min, 800);

    session
        .send_command(&Command::set_work_mode_fixed(&["08:00", "20:30"], 45))
        .await;
    wait_for(&mut mode, |m| m.is_some()).await;
    match mode.borrow().clone().unwrap() {
        WorkMode::Fixed {
            times,
            power_on_seconds,
        } => {
            assert_eq!(times[0], "08:00");
            assert_eq!(times[1], "20:30");
            assert_eq!(times[4], "");
            assert_eq!(power_on_seconds, 45);
        }
        other => panic!("unexpected mode {:?}", other),
    }

    session.shutdown().await;
}
