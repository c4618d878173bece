//! Observer fan-out of scan results, registration changes during delivery and
//! per-connection observers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blelink_core::radio::sim::SimulatedRadio;
use blelink_core::{
    ConnectionState, Device, Dispatcher, EventKind, EventObserver, ObserverHandle, RequestBuilder,
    RequestInfo,
};
use common::{quiet_settings, registry, sensor, wait_until, EventLog, ADDRESS};
use parking_lot::Mutex;

#[derive(Default)]
struct ScanCounter {
    seen: AtomicUsize,
}

impl EventObserver for ScanCounter {
    fn on_scan_result(&self, _device: &Device) {
        self.seen.fetch_add(1, Ordering::SeqCst);
    }

    fn subscriptions(&self, kind: EventKind) -> bool {
        kind == EventKind::ScanResult
    }
}

/// Unregisters itself after `limit` scan results.
struct SelfRemoving {
    seen: AtomicUsize,
    limit: usize,
    registration: Mutex<Option<(Arc<Dispatcher>, ObserverHandle)>>,
}

impl EventObserver for SelfRemoving {
    fn on_scan_result(&self, _device: &Device) {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == self.limit {
            if let Some((dispatcher, handle)) = self.registration.lock().take() {
                assert!(dispatcher.unregister(handle));
            }
        }
    }
}

fn address(i: usize) -> String {
    format!("10:00:00:00:00:{i:02X}")
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_observer_stops_receiving() {
    let radio = SimulatedRadio::new();
    let registry = registry(&radio, quiet_settings());
    let a = Arc::new(ScanCounter::default());
    let b = Arc::new(ScanCounter::default());
    registry.register_observer(&a).unwrap();
    let b_handle = registry.register_observer(&b).unwrap();

    assert!(registry.start_scan());
    for i in 0..10 {
        radio.advertise(&address(i), None, -50);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.unregister_observer(b_handle));
    for i in 10..20 {
        radio.advertise(&address(i), None, -50);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(a.seen.load(Ordering::SeqCst), 20);
    assert_eq!(b.seen.load(Ordering::SeqCst), 10);
    assert!(!registry.unregister_observer(b_handle));
    assert_eq!(registry.devices().len(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_observer_can_unregister_during_delivery() {
    let radio = SimulatedRadio::new();
    let registry = registry(&radio, quiet_settings());
    let observer = Arc::new(SelfRemoving {
        seen: AtomicUsize::new(0),
        limit: 5,
        registration: Mutex::new(None),
    });
    let handle = registry.register_observer(&observer).unwrap();
    *observer.registration.lock() = Some((Arc::clone(registry.dispatcher()), handle));

    assert!(registry.start_scan());
    for i in 0..12 {
        radio.advertise(&address(i), None, -50);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(observer.seen.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_observer_is_skipped() {
    let radio = SimulatedRadio::new();
    let registry = registry(&radio, quiet_settings());
    let kept = Arc::new(ScanCounter::default());
    registry.register_observer(&kept).unwrap();
    {
        let dropped = Arc::new(ScanCounter::default());
        registry.register_observer(&dropped).unwrap();
    }

    assert!(registry.start_scan());
    radio.advertise(&address(1), None, -50);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(kept.seen.load(Ordering::SeqCst), 1);
    assert_eq!(registry.dispatcher().observer_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_callback_replaces_broadcast_for_its_request() {
    let radio = SimulatedRadio::new();
    radio.add_peripheral(ADDRESS, sensor());
    let registry = registry(&radio, quiet_settings());
    let global = Arc::new(EventLog::default());
    registry.register_observer(&global).unwrap();
    let direct = Arc::new(EventLog::default());

    let connection = registry
        .connect_address(
            ADDRESS,
            registry.default_configuration(),
            Some(Arc::clone(&direct) as Arc<dyn EventObserver>),
        )
        .unwrap();

    let called = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&called);
    connection.execute(
        RequestBuilder::read_rssi()
            .tag("quiet")
            .callback(move |_: &RequestInfo, result| {
                assert!(result.is_ok());
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap(),
    );
    connection.execute(RequestBuilder::read_rssi().tag("loud").build().unwrap());

    let done = || global.labels().contains(&"rssi:loud".to_string());
    assert!(wait_until(done, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(called.load(Ordering::SeqCst), 1);
    assert!(!global.labels().contains(&"rssi:quiet".to_string()));
    assert!(direct.labels().contains(&"rssi:quiet".to_string()));
    assert!(direct.labels().contains(&"rssi:loud".to_string()));
    assert_eq!(direct.states().last(), Some(&ConnectionState::MtuSuccess));
    assert_eq!(global.states(), direct.states());
}
