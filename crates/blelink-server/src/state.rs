//! Application state shared across handlers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use blelink_core::{
    AdapterState, ConnectError, Device, EventKind, EventObserver, ObserverHandle, Registry, RequestError,
    RequestInfo, ScanError, ScanListener, TimeoutKind,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Events kept for `GET /api/events`.
pub const EVENT_CAPACITY: usize = 256;

/// Shared application state.
pub type SharedState = Arc<AppState>;

/// Everything the handlers need.
pub struct AppState {
    /// The connection registry.
    pub registry: Registry,
    /// Devices seen by any scan since startup.
    pub devices: Arc<DeviceCache>,
    /// Recent observer events.
    pub events: Arc<EventRing>,
    events_handle: ObserverHandle,
}

impl AppState {
    /// Attach the device cache and event ring to `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event ring cannot be registered.
    pub fn new(registry: Registry) -> anyhow::Result<SharedState> {
        let devices = Arc::new(DeviceCache::default());
        registry.add_scan_listener(Arc::clone(&devices) as Arc<dyn ScanListener>);

        let events = Arc::new(EventRing::new(EVENT_CAPACITY));
        let events_handle = registry.register_observer(&events)?;

        Ok(Arc::new(Self {
            registry,
            devices,
            events,
            events_handle,
        }))
    }

    /// Detach the observers and release every connection.
    pub fn shutdown(&self) {
        self.registry.unregister_observer(self.events_handle);
        self.registry.shutdown();
    }
}

// ============================================================================
// Device cache
// ============================================================================

/// Scan listener remembering the latest record per address.
#[derive(Debug, Default)]
pub struct DeviceCache {
    devices: Mutex<HashMap<String, Device>>,
    scanning: Mutex<bool>,
    last_error: Mutex<Option<String>>,
}

impl DeviceCache {
    /// Every device seen, strongest signal first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.lock().values().cloned().collect();
        devices.sort_by(|a, b| {
            b.rssi
                .unwrap_or(i16::MIN)
                .cmp(&a.rssi.unwrap_or(i16::MIN))
                .then_with(|| a.address().cmp(b.address()))
        });
        devices
    }

    /// Whether the last lifecycle callback was a start.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        *self.scanning.lock()
    }

    /// The last scan failure, cleared by the next start.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl ScanListener for DeviceCache {
    fn on_scan_start(&self) {
        *self.scanning.lock() = true;
        *self.last_error.lock() = None;
    }

    fn on_scan_stop(&self) {
        *self.scanning.lock() = false;
    }

    fn on_scan_result(&self, device: &Device) {
        self.devices
            .lock()
            .insert(device.address().to_string(), device.clone());
    }

    fn on_scan_error(&self, error: &ScanError) {
        *self.scanning.lock() = false;
        *self.last_error.lock() = Some(error.to_string());
    }
}

// ============================================================================
// Event ring
// ============================================================================

/// One recorded observer event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "kind": "connection_state_changed",
    "address": "AA:BB:CC:DD:EE:FF",
    "detail": "MTU_SUCCESS",
    "at_utc": "2025-01-15T03:30:00Z"
}))]
pub struct EventRecord {
    /// Event kind in snake case.
    #[schema(example = "connection_state_changed")]
    pub kind: String,

    /// Device the event concerns, if any.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub address: Option<String>,

    /// Human-readable summary.
    #[schema(example = "MTU_SUCCESS")]
    pub detail: String,

    /// When the event was delivered.
    #[schema(example = "2025-01-15T03:30:00Z")]
    pub at_utc: String,
}

/// Bounded buffer of the most recent events. Scan results are not recorded.
#[derive(Debug)]
pub struct EventRing {
    capacity: usize,
    records: Mutex<VecDeque<EventRecord>>,
}

impl EventRing {
    /// A ring holding at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Records in delivery order, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let records = self.records.lock();
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    fn push(&self, kind: &str, address: Option<&str>, detail: String) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(EventRecord {
            kind: kind.to_string(),
            address: address.map(str::to_string),
            detail,
            at_utc: Utc::now().to_rfc3339(),
        });
    }

    fn push_request(&self, kind: &str, info: &RequestInfo, detail: String) {
        self.push(kind, Some(info.device.address()), detail);
    }
}

impl EventObserver for EventRing {
    fn subscriptions(&self, kind: EventKind) -> bool {
        kind != EventKind::ScanResult
    }

    fn on_connection_state_changed(&self, device: &Device) {
        self.push(
            "connection_state_changed",
            Some(device.address()),
            device.state.as_str().to_string(),
        );
    }

    fn on_connect_failed(&self, device: &Device, error: &ConnectError) {
        self.push("connect_failed", Some(device.address()), error.to_string());
    }

    fn on_connect_timeout(&self, device: &Device, kind: TimeoutKind) {
        self.push("connect_timeout", Some(device.address()), kind.to_string());
    }

    fn on_adapter_state_changed(&self, state: AdapterState) {
        self.push("adapter_state_changed", None, format!("{state:?}").to_lowercase());
    }

    fn on_characteristic_changed(
        &self,
        device: &Device,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) {
        self.push(
            "characteristic_changed",
            Some(device.address()),
            format!("{characteristic}: {}", hex::encode(value)),
        );
    }

    fn on_characteristic_read(&self, info: &RequestInfo, value: &[u8]) {
        self.push_request("characteristic_read", info, hex::encode(value));
    }

    fn on_notification_changed(&self, info: &RequestInfo, enabled: bool) {
        self.push_request("notification_changed", info, enabled.to_string());
    }

    fn on_mtu_changed(&self, info: &RequestInfo, mtu: u16) {
        self.push_request("mtu_changed", info, mtu.to_string());
    }

    fn on_request_failed(&self, info: &RequestInfo, error: &RequestError) {
        self.push_request("request_failed", info, format!("{}: {error}", info.kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ring_drops_oldest() {
        let ring = EventRing::new(2);
        for i in 0..3 {
            ring.on_adapter_state_changed(if i % 2 == 0 {
                AdapterState::On
            } else {
                AdapterState::Off
            });
        }
        let recent = ring.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].detail, "off");
        assert_eq!(recent[1].detail, "on");
        assert_eq!(ring.recent(1).len(), 1);
    }

    #[test]
    fn test_device_cache_orders_by_signal() {
        let cache = DeviceCache::default();
        let mut weak = Device::new("AA:BB:CC:DD:EE:01").unwrap();
        weak.rssi = Some(-90);
        let mut strong = Device::new("AA:BB:CC:DD:EE:02").unwrap();
        strong.rssi = Some(-40);
        cache.on_scan_start();
        cache.on_scan_result(&weak);
        cache.on_scan_result(&strong);

        let devices = cache.snapshot();
        assert_eq!(devices[0].address(), "AA:BB:CC:DD:EE:02");
        assert_eq!(devices.len(), 2);
        assert!(cache.is_scanning());

        cache.on_scan_error(&ScanError::ScanFailed("adapter busy".into()));
        assert!(!cache.is_scanning());
        assert!(cache.last_error().is_some());
    }
}
