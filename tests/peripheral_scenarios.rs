//! End-to-end peripheral behaviour against the simulated device.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use gattlink::config::{ConnectOptions, PeripheralConfig};
use gattlink::gatt::event::{CharacteristicDescription, DescriptorDescription, ServiceDescription};
use gattlink::gatt::notification::NotificationKind;
use gattlink::gatt::simulated::{ConnectOutcome, ExecutorCall, SimulatedDevice};
use gattlink::gatt::types::{
    uuid_from_u16, AttributeId, ConnectionParameters, ConnectionPriority, Phy, PhyMask, PhyOption,
    PhyPair, CLIENT_CHARACTERISTIC_CONFIGURATION, DEFAULT_MTU,
};
use gattlink::gatt::{
    Capability, CharacteristicProperties, ConnectionState, DisconnectionReason, ExecutorCapabilities,
    GattError, GattEvent, GattStatus, Peripheral, RemoteCharacteristic, TransportError, WriteType,
};

const HEART_RATE: u16 = 0x180d;
const MEASUREMENT: u16 = 0x2a37;
const SENSOR_LOCATION: u16 = 0x2a38;
const CONTROL: u16 = 0xfff0;
const SETPOINT: u16 = 0xfff1;
const MODE: u16 = 0xfff2;
const ALARM: u16 = 0xfff3;
const RAW: u16 = 0xfff4;

fn cccd(instance_id: u16) -> DescriptorDescription {
    DescriptorDescription {
        uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
        instance_id,
    }
}

fn characteristic(
    uuid: u16,
    instance_id: u16,
    properties: CharacteristicProperties,
    descriptors: Vec<DescriptorDescription>,
) -> CharacteristicDescription {
    CharacteristicDescription {
        uuid: uuid_from_u16(uuid),
        instance_id,
        properties,
        descriptors,
    }
}

fn database() -> Vec<ServiceDescription> {
    vec![
        ServiceDescription {
            uuid: uuid_from_u16(HEART_RATE),
            instance_id: 1,
            primary: true,
            characteristics: vec![
                characteristic(MEASUREMENT, 2, CharacteristicProperties::NOTIFY, vec![cccd(3)]),
                characteristic(SENSOR_LOCATION, 4, CharacteristicProperties::READ, vec![]),
            ],
        },
        ServiceDescription {
            uuid: uuid_from_u16(CONTROL),
            instance_id: 10,
            primary: true,
            characteristics: vec![
                characteristic(
                    SETPOINT,
                    11,
                    CharacteristicProperties::READ | CharacteristicProperties::WRITE,
                    vec![],
                ),
                characteristic(MODE, 12, CharacteristicProperties::WRITE, vec![]),
                characteristic(
                    ALARM,
                    13,
                    CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE,
                    vec![cccd(14)],
                ),
                characteristic(RAW, 15, CharacteristicProperties::NOTIFY, vec![]),
            ],
        },
    ]
}

fn test_config() -> PeripheralConfig {
    PeripheralConfig::default()
}

fn direct(retry: u32) -> ConnectOptions {
    ConnectOptions::direct(Duration::from_secs(1), retry)
}

fn setup() -> (Arc<SimulatedDevice>, Arc<Peripheral>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(SimulatedDevice::new(database()));
    let peripheral = Peripheral::new(device.clone(), test_config());
    (device, peripheral)
}

async fn connected() -> (Arc<SimulatedDevice>, Arc<Peripheral>) {
    let (device, peripheral) = setup();
    peripheral.connect(direct(0)).await.unwrap();
    (device, peripheral)
}

async fn find(peripheral: &Peripheral, service: u16, uuid: u16) -> RemoteCharacteristic {
    peripheral
        .find_characteristic(uuid_from_u16(service), uuid_from_u16(uuid))
        .await
        .unwrap()
        .unwrap()
}

/// Poll until `condition` holds, failing the test if it never does.
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

async fn wait_for_state(peripheral: &Peripheral, wanted: ConnectionState) {
    let mut states = peripheral.state_changes();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *states.borrow_and_update() == wanted {
                return;
            }
            states.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never became {}", wanted));
}

fn cccd_writes(device: &SimulatedDevice, cccd: AttributeId, value: [u8; 2]) -> usize {
    device.count_calls(|call| {
        matches!(call, ExecutorCall::WriteDescriptor(id, v) if *id == cccd && v.as_slice() == value)
    })
}

fn connect_calls(device: &SimulatedDevice) -> usize {
    device.count_calls(|call| matches!(call, ExecutorCall::Connect { .. }))
}

// ----------------------------------------------------------------------
// Connection state machine
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_new_peripheral_is_closed() {
    let (device, peripheral) = setup();
    assert_eq!(peripheral.state(), ConnectionState::Closed);
    assert!(device.calls().is_empty());
    assert_eq!(
        peripheral.read_rssi().await.unwrap_err(),
        GattError::NotConnected
    );
}

#[tokio::test]
async fn test_connect_is_noop_when_connected() {
    let (device, peripheral) = connected().await;
    assert_eq!(peripheral.state(), ConnectionState::Connected);

    peripheral.connect(direct(0)).await.unwrap();
    assert_eq!(connect_calls(&device), 1);
}

#[tokio::test(start_paused = true)]
async fn test_direct_connect_retries_until_connected() {
    let (device, peripheral) = setup();
    let platform_timeout = DisconnectionReason::Timeout(Duration::from_secs(30));
    device.script_connect(ConnectOutcome::Fail(platform_timeout));
    device.script_connect(ConnectOutcome::Fail(platform_timeout));

    let before = tokio::time::Instant::now();
    peripheral.connect(direct(2)).await.unwrap();

    assert_eq!(connect_calls(&device), 3);
    assert_eq!(peripheral.state(), ConnectionState::Connected);
    assert!(before.elapsed() >= 2 * peripheral.config().retry_delay);
}

#[tokio::test(start_paused = true)]
async fn test_direct_connect_deadline_is_not_retried() {
    let (device, peripheral) = setup();
    device.script_connect(ConnectOutcome::Ignore);
    device.script_connect(ConnectOutcome::Ignore);
    device.script_connect(ConnectOutcome::Ignore);

    let before = tokio::time::Instant::now();
    let err = peripheral.connect(direct(2)).await.unwrap_err();

    let reason = DisconnectionReason::Timeout(Duration::from_secs(1));
    assert_eq!(err, GattError::ConnectionFailed(reason));
    assert_eq!(connect_calls(&device), 1);
    assert_eq!(peripheral.state(), ConnectionState::Disconnected(reason));
    assert!(before.elapsed() < Duration::from_secs(1) + peripheral.config().retry_delay);
}

#[tokio::test(start_paused = true)]
async fn test_direct_connect_timeout_without_retry() {
    let (device, peripheral) = setup();
    device.script_connect(ConnectOutcome::Ignore);

    let err = peripheral.connect(direct(0)).await.unwrap_err();
    let reason = DisconnectionReason::Timeout(Duration::from_secs(1));
    assert_eq!(err, GattError::ConnectionFailed(reason));
    assert_eq!(peripheral.state(), ConnectionState::Disconnected(reason));
    assert_eq!(device.count_calls(|c| *c == ExecutorCall::Close), 1);
}

#[tokio::test]
async fn test_link_loss_during_connect_fails_once() {
    let (device, peripheral) = setup();
    device.script_connect(ConnectOutcome::Fail(DisconnectionReason::LinkLoss));
    let mut states = peripheral.state_changes();

    let err = peripheral.connect(direct(0)).await.unwrap_err();

    assert_eq!(err, GattError::ConnectionFailed(DisconnectionReason::LinkLoss));
    assert_eq!(connect_calls(&device), 1);
    assert_eq!(
        *states.borrow_and_update(),
        ConnectionState::Disconnected(DisconnectionReason::LinkLoss)
    );
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_reason_skips_retries() {
    let (device, peripheral) = setup();
    device.script_connect(ConnectOutcome::Fail(
        DisconnectionReason::UnsupportedConfiguration,
    ));

    let err = peripheral.connect(direct(3)).await.unwrap_err();
    assert_eq!(
        err,
        GattError::ConnectionFailed(DisconnectionReason::UnsupportedConfiguration)
    );
    assert_eq!(connect_calls(&device), 1);
}

#[tokio::test]
async fn test_auto_connect_normalizes_generic_platform_error() {
    let (device, peripheral) = setup();
    device.script_connect(ConnectOutcome::Fail(DisconnectionReason::Unknown(133)));

    let err = peripheral.connect(ConnectOptions::auto()).await.unwrap_err();
    assert_eq!(
        err,
        GattError::ConnectionFailed(DisconnectionReason::UnsupportedAddress)
    );
    assert_eq!(
        device.calls()[0],
        ExecutorCall::Connect {
            auto_connect: true,
            preferred_phy: PhyMask::LE_1M
        }
    );
}

#[tokio::test]
async fn test_auto_connect_link_survives_disconnection() {
    let (device, peripheral) = setup();
    let _observer = peripheral.services_observer();
    peripheral.connect(ConnectOptions::auto()).await.unwrap();
    let first = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;

    device.drop_link(DisconnectionReason::LinkLoss);
    wait_for_state(
        &peripheral,
        ConnectionState::Disconnected(DisconnectionReason::LinkLoss),
    )
    .await;
    assert!(!first.is_valid());
    // The transport is kept for the platform to reconnect.
    assert_eq!(device.count_calls(|c| *c == ExecutorCall::Close), 0);

    assert!(device.reconnect());
    wait_for_state(&peripheral, ConnectionState::Connected).await;

    // Observed peripherals rediscover on their own after reconnecting.
    let mut services = peripheral.services_observer();
    tokio::time::timeout(Duration::from_secs(5), async {
        while services.borrow_and_update().is_none() {
            services.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    let again = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;
    assert!(again.is_valid());
    assert_eq!(
        device.count_calls(|c| *c == ExecutorCall::DiscoverServices),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_auto_connect_has_no_deadline() {
    let (device, peripheral) = setup();
    device.script_connect(ConnectOutcome::Ignore);

    let pending = {
        let peripheral = Arc::clone(&peripheral);
        tokio::spawn(async move { peripheral.connect(ConnectOptions::auto()).await })
    };
    tokio::time::sleep(peripheral.config().connect_timeout * 3).await;

    assert!(!pending.is_finished());
    assert_eq!(peripheral.state(), ConnectionState::Connecting);
    assert_eq!(connect_calls(&device), 1);

    assert!(device.reconnect());
    pending.await.unwrap().unwrap();
    assert_eq!(peripheral.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_direct_link_released_after_disconnection() {
    let (device, peripheral) = connected().await;
    device.drop_link(DisconnectionReason::PeerTerminate);

    wait_for_state(
        &peripheral,
        ConnectionState::Disconnected(DisconnectionReason::PeerTerminate),
    )
    .await;
    eventually(|| device.count_calls(|c| *c == ExecutorCall::Close) == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_dropping_connect_cancels_attempt() {
    let (device, peripheral) = setup();
    device.script_connect(ConnectOutcome::Ignore);

    let attempt = tokio::time::timeout(
        Duration::from_millis(100),
        peripheral.connect(ConnectOptions::direct(Duration::from_secs(30), 0)),
    )
    .await;

    assert!(attempt.is_err());
    assert_eq!(
        peripheral.state(),
        ConnectionState::Disconnected(DisconnectionReason::Cancelled)
    );
    assert_eq!(device.count_calls(|c| *c == ExecutorCall::Close), 1);
}

#[tokio::test]
async fn test_rejected_connect_restores_state() {
    let (device, peripheral) = setup();
    device.set_reject_requests(true);

    let err = peripheral.connect(direct(0)).await.unwrap_err();
    assert_eq!(err, GattError::RequestRejected("connect"));
    assert_eq!(peripheral.state(), ConnectionState::Closed);

    device.set_reject_requests(false);
    device.set_transport_fault(Some(TransportError::PermissionDenied(
        "BLUETOOTH_CONNECT".into(),
    )));
    let err = peripheral.connect(direct(0)).await.unwrap_err();
    assert!(matches!(
        err,
        GattError::Transport(TransportError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (device, peripheral) = connected().await;

    peripheral.disconnect().await;
    assert_eq!(
        peripheral.state(),
        ConnectionState::Disconnected(DisconnectionReason::LocalTerminate)
    );
    peripheral.disconnect().await;

    assert_eq!(device.count_calls(|c| *c == ExecutorCall::Disconnect), 1);
    assert_eq!(device.count_calls(|c| *c == ExecutorCall::Close), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_gives_up_after_grace_period() {
    let (device, peripheral) = connected().await;
    // The disconnection event arrives far too late.
    device.set_latency(Duration::from_secs(5));

    let before = tokio::time::Instant::now();
    peripheral.disconnect().await;
    let elapsed = before.elapsed();

    assert!(elapsed >= peripheral.config().disconnect_timeout);
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(
        peripheral.state(),
        ConnectionState::Disconnected(DisconnectionReason::LocalTerminate)
    );
    assert_eq!(device.count_calls(|c| *c == ExecutorCall::Close), 1);
}

#[tokio::test]
async fn test_close_resets_link_and_is_repeatable() {
    let (device, peripheral) = connected().await;
    assert_eq!(peripheral.request_mtu(185).await.unwrap(), 185);
    assert_eq!(peripheral.link_attributes().mtu, 185);
    let location = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;

    peripheral.close();
    peripheral.close();

    assert_eq!(peripheral.state(), ConnectionState::Closed);
    assert_eq!(peripheral.link_attributes().mtu, DEFAULT_MTU);
    assert!(!location.is_valid());
    assert!(peripheral.services_observer().borrow().is_none());
    assert_eq!(device.count_calls(|c| *c == ExecutorCall::Close), 1);
}

#[tokio::test]
async fn test_force_close_publishes_disconnection() {
    let (_device, peripheral) = connected().await;
    let mut events = peripheral.events();

    peripheral.force_close();

    assert_eq!(
        events.recv().await.unwrap(),
        GattEvent::ConnectionStateChanged(ConnectionState::Disconnected(
            DisconnectionReason::LocalTerminate
        ))
    );
    assert_eq!(peripheral.state(), ConnectionState::Closed);
}

// ----------------------------------------------------------------------
// Attribute operations
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_read_and_write_round_trip() {
    let (device, peripheral) = connected().await;
    let setpoint = find(&peripheral, CONTROL, SETPOINT).await;

    peripheral
        .write(&setpoint, &[0x2a, 0x00], WriteType::WithResponse)
        .await
        .unwrap();
    assert_eq!(
        device.count_calls(|c| matches!(c, ExecutorCall::WriteCharacteristic(..))),
        1
    );
    assert_eq!(peripheral.read(&setpoint).await.unwrap(), vec![0x2a, 0x00]);
}

#[tokio::test]
async fn test_missing_read_property_never_reaches_executor() {
    let (device, peripheral) = connected().await;
    let mode = find(&peripheral, CONTROL, MODE).await;

    let err = peripheral.read(&mode).await.unwrap_err();
    assert_eq!(err, GattError::MissingCapability(Capability::Read));
    assert_eq!(
        device.count_calls(|c| matches!(c, ExecutorCall::ReadCharacteristic(_))),
        0
    );

    let err = peripheral
        .write(&mode, &[1], WriteType::WithoutResponse)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GattError::MissingCapability(Capability::WriteWithoutResponse)
    );
}

#[tokio::test]
async fn test_write_failure_status_is_typed() {
    let (device, peripheral) = connected().await;
    let mode = find(&peripheral, CONTROL, MODE).await;
    device.set_status(mode.id(), GattStatus::InsufficientAuthentication);

    let err = peripheral
        .write(&mode, &[1], WriteType::WithResponse)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GattError::OperationFailed {
            op: "write characteristic",
            status: GattStatus::InsufficientAuthentication
        }
    );
}

#[tokio::test]
async fn test_rejected_request_releases_lock() {
    let (device, peripheral) = connected().await;
    let location = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;
    device.set_value(location.id(), &[1]);

    device.set_reject_requests(true);
    let err = peripheral.read(&location).await.unwrap_err();
    assert_eq!(err, GattError::RequestRejected("read characteristic"));

    device.set_reject_requests(false);
    assert_eq!(peripheral.read(&location).await.unwrap(), vec![1]);
}

#[tokio::test]
async fn test_pending_read_resolves_on_disconnection() {
    let (device, peripheral) = connected().await;
    let location = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;
    device.set_hold(true);

    let pending = {
        let peripheral = Arc::clone(&peripheral);
        let location = location.clone();
        tokio::spawn(async move { peripheral.read(&location).await })
    };
    eventually(|| device.held() == 1).await;

    device.drop_link(DisconnectionReason::LinkLoss);

    assert_eq!(pending.await.unwrap().unwrap_err(), GattError::NotConnected);
}

#[tokio::test]
async fn test_abandoned_read_releases_lock_and_keeps_tree() {
    let (device, peripheral) = connected().await;
    let setpoint = find(&peripheral, CONTROL, SETPOINT).await;
    device.set_hold(true);

    let abandoned = tokio::time::timeout(Duration::from_millis(50), peripheral.read(&setpoint)).await;
    assert!(abandoned.is_err());
    assert_eq!(device.held(), 1);

    device.set_hold(false);
    tokio::time::timeout(
        Duration::from_secs(1),
        peripheral.write(&setpoint, &[9], WriteType::WithResponse),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(setpoint.is_valid());
    assert_eq!(device.value(setpoint.id()), Some(vec![9]));
    assert_eq!(peripheral.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_one_request_in_flight() {
    let (device, peripheral) = connected().await;
    let setpoint = find(&peripheral, CONTROL, SETPOINT).await;
    let location = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;
    device.clear_calls();
    device.set_hold(true);

    let read = {
        let peripheral = Arc::clone(&peripheral);
        let location = location.clone();
        tokio::spawn(async move { peripheral.read(&location).await })
    };
    eventually(|| device.held() == 1).await;
    let write = {
        let peripheral = Arc::clone(&peripheral);
        let setpoint = setpoint.clone();
        tokio::spawn(async move {
            peripheral
                .write(&setpoint, &[7], WriteType::WithResponse)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The write is queued behind the read's lock.
    assert_eq!(device.calls(), vec![ExecutorCall::ReadCharacteristic(location.id())]);

    device.release_held();
    read.await.unwrap().unwrap();
    write.await.unwrap().unwrap();
    assert_eq!(device.max_outstanding(), 1);
}

#[tokio::test]
async fn test_concurrent_operations_never_overlap() {
    let (device, peripheral) = connected().await;
    device.set_latency(Duration::from_millis(2));
    let setpoint = find(&peripheral, CONTROL, SETPOINT).await;

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let peripheral = Arc::clone(&peripheral);
        let setpoint = setpoint.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                peripheral
                    .write(&setpoint, &[i], WriteType::WithResponse)
                    .await
                    .map(|_| ())
            } else {
                peripheral.read(&setpoint).await.map(|_| ())
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    peripheral.read_rssi().await.unwrap();
    assert_eq!(device.max_outstanding(), 1);
}

#[tokio::test]
async fn test_stale_attributes_after_disconnection() {
    let (device, peripheral) = connected().await;
    let location = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;
    let service = peripheral
        .find_service(uuid_from_u16(HEART_RATE))
        .await
        .unwrap()
        .unwrap();

    device.drop_link(DisconnectionReason::LinkLoss);
    wait_for_state(
        &peripheral,
        ConnectionState::Disconnected(DisconnectionReason::LinkLoss),
    )
    .await;

    assert!(!service.is_valid());
    assert!(!location.is_valid());
    assert_eq!(
        peripheral.read(&location).await.unwrap_err(),
        GattError::InvalidAttribute(location.id())
    );

    // A fresh connection hands out fresh nodes; the old ones stay dead.
    peripheral.connect(direct(0)).await.unwrap();
    let fresh = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;
    assert!(fresh.is_valid());
    assert!(!location.is_valid());
}

#[tokio::test]
async fn test_services_changed_invalidates_and_rediscovers() {
    let (device, peripheral) = connected().await;
    let mut services = peripheral.services_observer();
    let location = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;
    services.borrow_and_update();

    let mut changed = database();
    changed.truncate(1);
    device.change_services(changed);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            services.changed().await.unwrap();
            if let Some(tree) = services.borrow_and_update().as_ref() {
                assert_eq!(tree.len(), 1);
                return;
            }
        }
    })
    .await
    .unwrap();
    assert!(!location.is_valid());
    assert!(peripheral
        .find_service(uuid_from_u16(CONTROL))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_discovery_runs_once_per_connection() {
    let (device, peripheral) = setup();
    let _observer = peripheral.services_observer();
    peripheral.connect(direct(0)).await.unwrap();

    let (a, b) = tokio::join!(peripheral.services(), peripheral.services());
    assert_eq!(a.unwrap().len(), 2);
    assert_eq!(b.unwrap().len(), 2);
    peripheral.services().await.unwrap();

    assert_eq!(
        device.count_calls(|c| *c == ExecutorCall::DiscoverServices),
        1
    );
}

#[tokio::test]
async fn test_failed_discovery_is_reported() {
    let (device, peripheral) = connected().await;
    device.set_discovery_status(GattStatus::Failure);

    let err = peripheral.services().await.unwrap_err();
    assert_eq!(err, GattError::ServiceDiscoveryFailed(GattStatus::Failure));

    // The claim was released, so a later call tries again.
    device.set_discovery_status(GattStatus::Success);
    assert_eq!(peripheral.services().await.unwrap().len(), 2);
}

// ----------------------------------------------------------------------
// Link operations
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_link_operations_update_attributes() {
    let (device, peripheral) = connected().await;
    device.set_rssi(-72);
    device.set_peer_mtu(247);

    assert_eq!(peripheral.read_rssi().await.unwrap(), -72);
    assert_eq!(peripheral.request_mtu(600).await.unwrap(), 247);
    assert!(device
        .calls()
        .contains(&ExecutorCall::RequestMtu(517)));

    let phy = peripheral
        .request_phy(PhyMask::LE_2M, PhyMask::LE_2M, PhyOption::NoPreference)
        .await
        .unwrap();
    let fast = PhyPair {
        tx: Phy::Le2M,
        rx: Phy::Le2M,
    };
    assert_eq!(phy, fast);
    assert_eq!(peripheral.read_phy().await.unwrap(), fast);

    let parameters = peripheral
        .request_connection_priority(ConnectionPriority::High)
        .await
        .unwrap();
    assert_eq!(
        parameters,
        ConnectionParameters::for_priority(ConnectionPriority::High)
    );

    let link = peripheral.link_attributes();
    assert_eq!(link.mtu, 247);
    assert_eq!(link.phy, fast);
    assert_eq!(link.connection_parameters, Some(parameters));
}

#[tokio::test]
async fn test_synthesized_link_updates_treated_like_native() {
    let fast = PhyPair {
        tx: Phy::Le2M,
        rx: Phy::Le2M,
    };
    let high = ConnectionParameters::for_priority(ConnectionPriority::High);

    for synthesize_link_events in [false, true] {
        let device = Arc::new(
            SimulatedDevice::new(database())
                .with_capabilities(ExecutorCapabilities { synthesize_link_events }),
        );
        let peripheral = Peripheral::new(device.clone(), test_config());
        peripheral.connect(direct(0)).await.unwrap();

        let phy = peripheral
            .request_phy(PhyMask::LE_2M, PhyMask::LE_2M, PhyOption::NoPreference)
            .await
            .unwrap();
        let parameters = peripheral
            .request_connection_priority(ConnectionPriority::High)
            .await
            .unwrap();

        assert_eq!(phy, fast);
        assert_eq!(parameters, high);
        let link = peripheral.link_attributes();
        assert_eq!(link.phy, fast);
        assert_eq!(link.connection_parameters, Some(high));
        let expected_synthesized = if synthesize_link_events { 2 } else { 0 };
        assert_eq!(device.synthesized(), expected_synthesized);
    }
}

#[tokio::test]
async fn test_synthesized_phy_update_needs_no_platform_callback() {
    let device = Arc::new(SimulatedDevice::new(database()).with_capabilities(
        ExecutorCapabilities {
            synthesize_link_events: true,
        },
    ));
    let peripheral = Peripheral::new(device.clone(), test_config());
    peripheral.connect(direct(0)).await.unwrap();
    device.set_hold(true);

    let phy = tokio::time::timeout(
        Duration::from_secs(1),
        peripheral.request_phy(PhyMask::LE_2M, PhyMask::LE_2M, PhyOption::NoPreference),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(phy.tx, Phy::Le2M);
    assert_eq!(device.held(), 0);
}

// ----------------------------------------------------------------------
// Notifications
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_subscription_receives_notifications() {
    let (device, peripheral) = connected().await;
    let measurement = find(&peripheral, HEART_RATE, MEASUREMENT).await;
    let cccd = measurement.cccd().unwrap().id();

    let mut values = peripheral.subscribe(&measurement).await.unwrap();
    assert_eq!(cccd_writes(&device, cccd, [0x01, 0x00]), 1);

    device.notify(measurement.id(), &[0x00, 72]);
    device.notify(measurement.id(), &[0x00, 74]);
    assert_eq!(values.next().await, Some(vec![0x00, 72]));
    assert_eq!(values.next().await, Some(vec![0x00, 74]));

    device.drop_link(DisconnectionReason::LinkLoss);
    assert_eq!(values.next().await, None);
}

#[tokio::test]
async fn test_concurrent_subscribers_share_one_enable() {
    let (device, peripheral) = connected().await;
    let measurement = find(&peripheral, HEART_RATE, MEASUREMENT).await;
    let cccd = measurement.cccd().unwrap().id();

    let (first, second) = tokio::join!(
        peripheral.subscribe(&measurement),
        peripheral.subscribe(&measurement)
    );
    let first = first.unwrap();
    let mut second = second.unwrap();
    assert_eq!(cccd_writes(&device, cccd, [0x01, 0x00]), 1);

    // Dropping one subscriber leaves notifications on for the other.
    drop(first);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cccd_writes(&device, cccd, [0x00, 0x00]), 0);
    device.notify(measurement.id(), &[0x00, 80]);
    assert_eq!(second.next().await, Some(vec![0x00, 80]));

    // The last one disables them.
    drop(second);
    eventually(|| cccd_writes(&device, cccd, [0x00, 0x00]) == 1).await;
}

#[tokio::test]
async fn test_enable_is_idempotent() {
    let (device, peripheral) = connected().await;
    let measurement = find(&peripheral, HEART_RATE, MEASUREMENT).await;
    let cccd = measurement.cccd().unwrap().id();

    peripheral.set_notifications(&measurement, true).await.unwrap();
    peripheral.set_notifications(&measurement, true).await.unwrap();
    let _values = peripheral.subscribe(&measurement).await.unwrap();
    assert_eq!(cccd_writes(&device, cccd, [0x01, 0x00]), 1);

    peripheral
        .set_notifications(&measurement, false)
        .await
        .unwrap();
    assert_eq!(cccd_writes(&device, cccd, [0x00, 0x00]), 1);
}

#[tokio::test]
async fn test_indication_preferred_when_requested() {
    let (device, peripheral) = connected().await;
    let alarm = find(&peripheral, CONTROL, ALARM).await;
    let cccd = alarm.cccd().unwrap().id();

    let _values = peripheral
        .subscribe_with(&alarm, NotificationKind::Indicate)
        .await
        .unwrap();
    assert_eq!(cccd_writes(&device, cccd, [0x02, 0x00]), 1);
    assert_eq!(cccd_writes(&device, cccd, [0x01, 0x00]), 0);
}

#[tokio::test]
async fn test_switching_notification_kind_rewrites_cccd() {
    let (device, peripheral) = connected().await;
    let alarm = find(&peripheral, CONTROL, ALARM).await;
    let cccd = alarm.cccd().unwrap().id();

    let _notified = peripheral
        .subscribe_with(&alarm, NotificationKind::Notify)
        .await
        .unwrap();
    let _indicated = peripheral
        .subscribe_with(&alarm, NotificationKind::Indicate)
        .await
        .unwrap();
    let _again = peripheral
        .subscribe_with(&alarm, NotificationKind::Indicate)
        .await
        .unwrap();

    assert_eq!(cccd_writes(&device, cccd, [0x01, 0x00]), 1);
    assert_eq!(cccd_writes(&device, cccd, [0x02, 0x00]), 1);
    assert_eq!(device.value(cccd), Some(vec![0x02, 0x00]));
}

#[tokio::test]
async fn test_subscribe_requires_property_and_cccd() {
    let (device, peripheral) = connected().await;
    let raw = find(&peripheral, CONTROL, RAW).await;
    let location = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;

    assert_eq!(
        peripheral.subscribe(&raw).await.err(),
        Some(GattError::MissingCapability(
            Capability::ClientCharacteristicConfiguration
        ))
    );
    assert_eq!(
        peripheral.subscribe(&location).await.err(),
        Some(GattError::MissingCapability(Capability::Notify))
    );
    assert_eq!(
        device.count_calls(|c| matches!(c, ExecutorCall::WriteDescriptor(..))),
        0
    );
}

#[tokio::test]
async fn test_descriptor_read_and_write() {
    let (device, peripheral) = connected().await;
    let measurement = find(&peripheral, HEART_RATE, MEASUREMENT).await;
    let descriptor = measurement.cccd().unwrap().clone();

    peripheral
        .write_descriptor(&descriptor, &[0x01, 0x00])
        .await
        .unwrap();
    assert_eq!(device.value(descriptor.id()), Some(vec![0x01, 0x00]));
    assert_eq!(
        peripheral.read_descriptor(&descriptor).await.unwrap(),
        vec![0x01, 0x00]
    );
}

// ----------------------------------------------------------------------
// Reliable write
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_reliable_write_commits_all_values() {
    let (device, peripheral) = connected().await;
    let setpoint = find(&peripheral, CONTROL, SETPOINT).await;
    let mode = find(&peripheral, CONTROL, MODE).await;

    let mut transaction = peripheral.reliable_write();
    transaction.write(&setpoint, &[0x10, 0x20]).unwrap();
    transaction.write(&mode, &[0x03]).unwrap();
    assert_eq!(transaction.len(), 2);
    transaction.commit().await.unwrap();

    assert_eq!(device.value(setpoint.id()), Some(vec![0x10, 0x20]));
    assert_eq!(device.value(mode.id()), Some(vec![0x03]));
    assert_eq!(
        device.count_calls(|c| *c == ExecutorCall::ExecuteReliableWrite),
        1
    );
    assert_eq!(
        device.count_calls(|c| *c == ExecutorCall::AbortReliableWrite),
        0
    );
}

#[tokio::test]
async fn test_reliable_write_echo_mismatch_aborts() {
    let (device, peripheral) = connected().await;
    let setpoint = find(&peripheral, CONTROL, SETPOINT).await;
    let mode = find(&peripheral, CONTROL, MODE).await;
    device.corrupt_echo(setpoint.id());

    let mut transaction = peripheral.reliable_write();
    transaction
        .write(&mode, &[0x03])
        .unwrap()
        .write(&setpoint, &[0x10, 0x20])
        .unwrap();
    let err = transaction.commit().await.unwrap_err();

    assert_eq!(
        err,
        GattError::ValueMismatch {
            attribute: setpoint.id(),
            expected: vec![0x10, 0x20],
            actual: vec![0x10, 0xdf],
        }
    );
    assert_eq!(
        device.count_calls(|c| *c == ExecutorCall::AbortReliableWrite),
        1
    );
    assert_eq!(
        device.count_calls(|c| *c == ExecutorCall::ExecuteReliableWrite),
        0
    );
    // Nothing from the transaction reached the peer's values.
    assert_eq!(device.value(mode.id()), None);
    assert_eq!(device.value(setpoint.id()), None);
}

#[tokio::test]
async fn test_reliable_write_validates_when_queued() {
    let (_device, peripheral) = connected().await;
    let location = find(&peripheral, HEART_RATE, SENSOR_LOCATION).await;

    let mut transaction = peripheral.reliable_write();
    assert_eq!(
        transaction.write(&location, &[1]).err(),
        Some(GattError::MissingCapability(Capability::Write))
    );
    assert!(transaction.is_empty());
    transaction.commit().await.unwrap();
}
