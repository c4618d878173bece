//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use blelink_core::radio::sim::{Peripheral, SimulatedRadio};
use blelink_core::{
    BleSettings, ConnectError, ConnectionState, Device, EventObserver, RadioStack, Registry,
    Request, RequestBuilder, RequestError, RequestInfo, RequestOutput, TelemetryChannel,
    TimeoutKind,
};
use parking_lot::Mutex;
use tokio::time::Instant;

pub const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

/// A peripheral exposing the default telemetry channel.
pub fn sensor() -> Peripheral {
    Peripheral::with_telemetry("sensor", &TelemetryChannel::default())
}

/// Settings with the telemetry bootstrap turned off, so only the MTU
/// request runs before application requests.
pub fn quiet_settings() -> BleSettings {
    let mut settings = BleSettings::default();
    settings.telemetry.bootstrap = false;
    settings
}

pub fn registry(radio: &Arc<SimulatedRadio>, settings: BleSettings) -> Registry {
    Registry::builder(Arc::clone(radio) as Arc<dyn RadioStack>)
        .settings(settings)
        .build()
        .unwrap()
}

/// Poll `check` every 10ms of virtual time until it holds or `limit` passes.
pub async fn wait_until(mut check: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Completed request: tag, result and the virtual time the callback ran.
pub type Outcome = (String, Result<RequestOutput, RequestError>, Instant);

/// Collects request callbacks.
#[derive(Clone, Default)]
pub struct Outcomes(Arc<Mutex<Vec<Outcome>>>);

impl Outcomes {
    /// Build `builder` with a callback recording under `tag`.
    pub fn track(&self, builder: RequestBuilder, tag: &str) -> Request {
        let sink = Arc::clone(&self.0);
        let name = tag.to_string();
        builder
            .tag(tag)
            .callback(move |_: &RequestInfo, result| {
                sink.lock().push((name, result, Instant::now()));
            })
            .build()
            .unwrap()
    }

    pub fn all(&self) -> Vec<Outcome> {
        self.0.lock().clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.0.lock().iter().map(|(tag, _, _)| tag.clone()).collect()
    }

    pub fn for_tag(&self, tag: &str) -> Vec<Outcome> {
        self.0
            .lock()
            .iter()
            .filter(|(t, _, _)| t == tag)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Records state transitions and request broadcasts in delivery order.
#[derive(Default)]
pub struct EventLog {
    states: Mutex<Vec<(ConnectionState, Instant)>>,
    labels: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().iter().map(|(state, _)| *state).collect()
    }

    pub fn state_times(&self) -> Vec<(ConnectionState, Instant)> {
        self.states.lock().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.labels.lock().clone()
    }

    fn label(&self, label: impl Into<String>) {
        self.labels.lock().push(label.into());
    }
}

impl EventObserver for EventLog {
    fn on_connection_state_changed(&self, device: &Device) {
        self.states.lock().push((device.state, Instant::now()));
    }

    fn on_connect_failed(&self, _device: &Device, error: &ConnectError) {
        self.label(format!("connect_failed:{}", error.error_code()));
    }

    fn on_connect_timeout(&self, _device: &Device, kind: TimeoutKind) {
        self.label(format!("timeout:{kind:?}"));
    }

    fn on_mtu_changed(&self, _info: &RequestInfo, mtu: u16) {
        self.label(format!("mtu:{mtu}"));
    }

    fn on_notification_changed(&self, _info: &RequestInfo, enabled: bool) {
        self.label(format!("notification:{enabled}"));
    }

    fn on_characteristic_read(&self, info: &RequestInfo, _value: &[u8]) {
        self.label(format!("read:{}", info.tag.as_deref().unwrap_or_default()));
    }

    fn on_rssi_read(&self, info: &RequestInfo, _rssi: i16) {
        self.label(format!("rssi:{}", info.tag.as_deref().unwrap_or_default()));
    }

    fn on_request_failed(&self, info: &RequestInfo, error: &RequestError) {
        self.label(format!(
            "failed:{}:{}",
            info.tag.as_deref().unwrap_or_default(),
            error.error_code()
        ));
    }
}
