//! Connection state machine: connect sequence, reconnect policy and timeouts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use blelink_core::radio::sim::{ConnectBehavior, OpBehavior, SimOp, SimulatedRadio};
use blelink_core::{AdapterState, BleSettings, ConnectionState, RequestBuilder, TelemetryChannel};
use common::{quiet_settings, registry, sensor, wait_until, EventLog, ADDRESS};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_connect_sequence_and_bootstrap_order() {
    let radio = SimulatedRadio::new();
    radio.add_peripheral(
        ADDRESS,
        sensor()
            .link_delay(Duration::from_millis(2000))
            .discovery_delay(Duration::from_millis(500)),
    );
    let registry = registry(&radio, BleSettings::default());
    let log = Arc::new(EventLog::default());
    registry.register_observer(&log).unwrap();
    let telemetry = TelemetryChannel::default();

    let started = Instant::now();
    let config = registry
        .default_configuration()
        .with_discover_services_delay(Duration::ZERO)
        .with_connect_timeout(Duration::from_millis(10_000));
    let connection = registry.connect_address(ADDRESS, config, None).unwrap();
    connection.execute(
        RequestBuilder::read_characteristic(telemetry.service, telemetry.notify_characteristic)
            .tag("app")
            .build()
            .unwrap(),
    );

    let done = || log.labels().contains(&"read:app".to_string());
    assert!(wait_until(done, Duration::from_secs(5)).await);

    assert_eq!(
        log.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::ServiceDiscovering,
            ConnectionState::ServiceDiscovered,
            ConnectionState::MtuSuccess,
        ]
    );
    let at = |state| {
        log.state_times()
            .into_iter()
            .find(|(s, _)| *s == state)
            .map(|(_, at)| at - started)
            .unwrap()
    };
    assert_eq!(at(ConnectionState::Connecting), Duration::ZERO);
    assert_eq!(at(ConnectionState::Connected), Duration::from_millis(2000));
    assert_eq!(at(ConnectionState::ServiceDiscovering), Duration::from_millis(2000));
    assert_eq!(at(ConnectionState::ServiceDiscovered), Duration::from_millis(2500));

    assert_eq!(
        log.labels(),
        vec!["mtu:503", "notification:true", "read:bootstrap", "read:app"]
    );
    assert_eq!(connection.mtu(), 503);
    assert!(connection.is_notification_enabled(telemetry.service, telemetry.notify_characteristic));
}

#[tokio::test(start_paused = true)]
async fn test_every_transition_is_legal() {
    let radio = SimulatedRadio::new();
    radio.add_peripheral(ADDRESS, sensor());
    let registry = registry(&radio, quiet_settings());
    let log = Arc::new(EventLog::default());
    registry.register_observer(&log).unwrap();

    let connection = registry
        .connect_address(ADDRESS, registry.default_configuration(), None)
        .unwrap();
    let ready = || connection.state() == ConnectionState::MtuSuccess;
    assert!(wait_until(ready, Duration::from_secs(5)).await);

    radio.drop_link(ADDRESS);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(wait_until(ready, Duration::from_secs(5)).await);
    assert_eq!(radio.open_attempts(ADDRESS), 2);

    connection.disconnect();
    let disconnected = || connection.state() == ConnectionState::Disconnected;
    assert!(wait_until(disconnected, Duration::from_secs(1)).await);
    connection.release();
    let released = || connection.is_released();
    assert!(wait_until(released, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let states = log.states();
    assert!(states.contains(&ConnectionState::ScanningForReconnection));
    assert_eq!(states.last(), Some(&ConnectionState::Released));
    let mut previous = ConnectionState::Disconnected;
    for state in states {
        assert!(
            previous.can_transition_to(state),
            "illegal transition {previous} -> {state}"
        );
        previous = state;
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_falls_back_to_scanning() {
    let radio = SimulatedRadio::new();
    radio.add_peripheral(ADDRESS, sensor());
    let registry = registry(&radio, quiet_settings());

    let config = registry
        .default_configuration()
        .with_reconnect_immediately_max_times(2)
        .with_try_reconnect_max_times(None);
    let connection = registry.connect_address(ADDRESS, config, None).unwrap();
    assert!(wait_until(|| connection.is_ready(), Duration::from_secs(5)).await);

    radio.set_connect_behavior(ADDRESS, ConnectBehavior::Fail(133));
    radio.drop_link(ADDRESS);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(radio.open_attempts(ADDRESS), 3);
    assert_eq!(connection.state(), ConnectionState::ScanningForReconnection);
    assert!(radio.is_scanning());

    radio.set_connect_behavior(ADDRESS, ConnectBehavior::Succeed);
    radio.advertise("11:22:33:44:55:66", Some("other"), -70);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(radio.open_attempts(ADDRESS), 3);

    radio.advertise(ADDRESS, Some("sensor"), -55);
    assert!(wait_until(|| connection.is_ready(), Duration::from_secs(5)).await);
    assert_eq!(radio.open_attempts(ADDRESS), 4);
    assert!(!radio.is_scanning());
    assert_eq!(connection.device().rssi, Some(-55));
}

#[tokio::test(start_paused = true)]
async fn test_failed_discovery_spends_the_immediate_budget() {
    let radio = SimulatedRadio::new();
    radio.add_peripheral(
        ADDRESS,
        sensor().behavior(SimOp::DiscoverServices, OpBehavior::Fail(133)),
    );
    let registry = registry(&radio, quiet_settings());
    let log = Arc::new(EventLog::default());
    registry.register_observer(&log).unwrap();

    let config = registry
        .default_configuration()
        .with_reconnect_immediately_max_times(2)
        .with_try_reconnect_max_times(None);
    let connection = registry.connect_address(ADDRESS, config, None).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    // One attempt plus two immediate retries, then a reconnection scan.
    assert_eq!(radio.open_attempts(ADDRESS), 3);
    assert_eq!(connection.state(), ConnectionState::ScanningForReconnection);
    assert!(radio.is_scanning());
    let failures = log
        .labels()
        .iter()
        .filter(|l| *l == "connect_failed:SERVICE_DISCOVERY_FAILED")
        .count();
    assert_eq!(failures, 3);

    radio.set_behavior(ADDRESS, SimOp::DiscoverServices, OpBehavior::Respond);
    radio.advertise(ADDRESS, Some("sensor"), -58);
    assert!(wait_until(|| connection.is_ready(), Duration::from_secs(5)).await);
    assert_eq!(radio.open_attempts(ADDRESS), 4);

    let mut previous = ConnectionState::Disconnected;
    for state in log.states() {
        assert!(
            previous.can_transition_to(state),
            "illegal transition {previous} -> {state}"
        );
        previous = state;
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_budget_is_bounded() {
    let radio = SimulatedRadio::new();
    radio.add_peripheral(ADDRESS, sensor());
    let registry = registry(&radio, quiet_settings());
    let log = Arc::new(EventLog::default());
    registry.register_observer(&log).unwrap();

    let config = registry
        .default_configuration()
        .with_reconnect_immediately_max_times(5)
        .with_try_reconnect_max_times(Some(2));
    let connection = registry.connect_address(ADDRESS, config, None).unwrap();
    assert!(wait_until(|| connection.is_ready(), Duration::from_secs(5)).await);

    radio.set_connect_behavior(ADDRESS, ConnectBehavior::Fail(133));
    radio.drop_link(ADDRESS);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(radio.open_attempts(ADDRESS), 3);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(log
        .labels()
        .contains(&"connect_failed:MAXIMUM_RECONNECTION".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_without_reconnect() {
    let radio = SimulatedRadio::new();
    radio.add_peripheral(ADDRESS, sensor().connect(ConnectBehavior::Never));
    let registry = registry(&radio, quiet_settings());
    let log = Arc::new(EventLog::default());
    registry.register_observer(&log).unwrap();

    let started = Instant::now();
    let config = registry
        .default_configuration()
        .with_auto_reconnect(false)
        .with_connect_timeout(Duration::from_secs(4));
    let connection = registry.connect_address(ADDRESS, config, None).unwrap();

    let failed = || {
        log.labels()
            .contains(&"connect_failed:CONNECT_TIMEOUT".to_string())
    };
    assert!(wait_until(failed, Duration::from_secs(10)).await);

    assert_eq!(
        log.labels(),
        vec!["timeout:CannotConnect", "connect_failed:CONNECT_TIMEOUT"]
    );
    let (state, at) = log.state_times().last().copied().unwrap();
    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(at - started, Duration::from_secs(4));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(radio.open_attempts(ADDRESS), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_reconnect_after_disconnect() {
    let radio = SimulatedRadio::new();
    radio.add_peripheral(ADDRESS, sensor());
    let registry = registry(&radio, quiet_settings());

    let connection = registry
        .connect_address(ADDRESS, registry.default_configuration(), None)
        .unwrap();
    assert!(wait_until(|| connection.is_ready(), Duration::from_secs(5)).await);

    registry.disconnect(ADDRESS).unwrap();
    let disconnected = || connection.state() == ConnectionState::Disconnected;
    assert!(wait_until(disconnected, Duration::from_secs(1)).await);
    assert!(!radio.is_linked(ADDRESS));

    // An active disconnect is not followed by an automatic reconnect.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(radio.open_attempts(ADDRESS), 1);

    registry.reconnect(ADDRESS).unwrap();
    assert!(wait_until(|| connection.is_ready(), Duration::from_secs(5)).await);
    assert_eq!(radio.open_attempts(ADDRESS), 2);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_off_drops_to_disconnected() {
    let radio = SimulatedRadio::new();
    radio.add_peripheral(ADDRESS, sensor());
    let registry = registry(&radio, quiet_settings());

    let connection = registry
        .connect_address(ADDRESS, registry.default_configuration(), None)
        .unwrap();
    assert!(wait_until(|| connection.is_ready(), Duration::from_secs(5)).await);

    radio.set_adapter(AdapterState::Off);
    let disconnected = || connection.state() == ConnectionState::Disconnected;
    assert!(wait_until(disconnected, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(radio.open_attempts(ADDRESS), 1);
}
