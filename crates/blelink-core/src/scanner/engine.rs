use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::advertisement::{device_from, ParsedAdvertisement};
use super::{ScanError, ScanListener};
use crate::config::{PowerProfile, ScanSettings};
use crate::radio::{Advertisement, RadioStack, StackScanSettings};
use crate::types::Device;

/// Where discovery filters are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FilterMode {
    Stack,
    Software,
}

#[derive(Default)]
struct EngineState {
    scanning: bool,
    generation: u64,
    devices: HashMap<String, Device>,
    tasks: Vec<JoinHandle<()>>,
}

struct EngineInner {
    radio: Arc<dyn RadioStack>,
    settings: ScanSettings,
    mode: FilterMode,
    handle: Handle,
    state: Mutex<EngineState>,
    listeners: Mutex<Vec<Arc<dyn ScanListener>>>,
}

/// Scan lifecycle, device cache and listener fan-out shared by both
/// strategies.
pub struct ScanEngine {
    inner: Arc<EngineInner>,
}

impl ScanEngine {
    pub(super) fn new(
        radio: Arc<dyn RadioStack>,
        settings: ScanSettings,
        mode: FilterMode,
        handle: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                radio,
                settings,
                mode,
                handle,
                state: Mutex::new(EngineState::default()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(super) fn start(&self) -> bool {
        let inner = &self.inner;
        let (tx, rx) = mpsc::unbounded_channel();
        let stack_settings = inner.stack_settings();

        let generation = {
            let mut state = inner.state.lock();
            if state.scanning {
                return true;
            }
            if let Err(err) = inner.radio.start_scan(&stack_settings, tx) {
                drop(state);
                warn!(error = %err, "scan failed to start");
                inner.notify(|l| l.on_scan_error(&err));
                return false;
            }

            state.scanning = true;
            state.generation += 1;
            state.devices.clear();

            let generation = state.generation;
            let weak = Arc::downgrade(inner);
            state
                .tasks
                .push(inner.handle.spawn(pump(weak.clone(), rx, generation)));

            let period = Duration::from_millis(inner.settings.scan_period_ms);
            if !period.is_zero() {
                state
                    .tasks
                    .push(inner.handle.spawn(stop_after(weak, period, generation)));
            }
            generation
        };

        debug!(generation, mode = ?inner.mode, "scan started");
        inner.notify(|l| l.on_scan_start());
        true
    }

    pub(super) fn stop(&self, quietly: bool) {
        self.inner.stop(quietly, None);
    }

    pub(super) fn is_scanning(&self) -> bool {
        self.inner.state.lock().scanning
    }

    pub(super) fn add_listener(&self, listener: Arc<dyn ScanListener>) {
        self.inner.listeners.lock().push(listener);
    }

    pub(super) fn remove_listener(&self, listener: &Arc<dyn ScanListener>) -> bool {
        let target = Arc::as_ptr(listener).cast::<()>();
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l).cast::<()>() != target);
        listeners.len() != before
    }

    pub(super) fn discovered(&self, address: &str) -> Option<Device> {
        self.inner
            .state
            .lock()
            .devices
            .get(&address.to_ascii_uppercase())
            .cloned()
    }

    pub(super) fn devices(&self) -> Vec<Device> {
        self.inner.state.lock().devices.values().cloned().collect()
    }

    pub(super) fn release(&self) {
        self.inner.stop(true, None);
        self.inner.listeners.lock().clear();
    }
}

impl fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanEngine")
            .field("mode", &self.inner.mode)
            .field("scanning", &self.is_scanning())
            .finish_non_exhaustive()
    }
}

impl Drop for ScanEngine {
    fn drop(&mut self) {
        self.inner.stop(true, None);
    }
}

impl EngineInner {
    fn stack_settings(&self) -> StackScanSettings {
        match self.mode {
            FilterMode::Stack => StackScanSettings {
                power_profile: self.settings.power_profile,
                report_delay: Duration::from_millis(self.settings.report_delay_ms),
                filters: (!self.settings.filters.is_empty()).then(|| self.settings.filters.clone()),
            },
            FilterMode::Software => StackScanSettings {
                power_profile: PowerProfile::Balanced,
                report_delay: Duration::ZERO,
                filters: None,
            },
        }
    }

    /// Stop the scan; with `generation` set, only if it is still that scan.
    fn stop(&self, quietly: bool, generation: Option<u64>) {
        {
            let mut state = self.state.lock();
            if !state.scanning || generation.is_some_and(|g| g != state.generation) {
                return;
            }
            state.scanning = false;
            for task in state.tasks.drain(..) {
                task.abort();
            }
            self.radio.stop_scan();
        }

        debug!(quietly, "scan stopped");
        if !quietly {
            self.notify(|l| l.on_scan_stop());
        }
    }

    fn handle_advertisement(&self, adv: &Advertisement, generation: u64) {
        let parsed = ParsedAdvertisement::parse(&adv.data);

        if self.mode == FilterMode::Software {
            let name = adv.name.as_deref().or(parsed.local_name.as_deref());
            if !self
                .settings
                .filters
                .matches(&adv.address, name, adv.rssi, &parsed.service_uuids)
            {
                return;
            }
        }

        let device = {
            let mut state = self.state.lock();
            if !state.scanning || state.generation != generation {
                return;
            }
            let key = adv.address.to_ascii_uppercase();
            let Some(device) = device_from(adv, &parsed, state.devices.get(&key)) else {
                trace!(address = %adv.address, "ignoring advertisement with malformed address");
                return;
            };
            state.devices.insert(key, device.clone());
            device
        };

        trace!(address = %device.address(), rssi = adv.rssi, "scan result");
        self.notify(|l| l.on_scan_result(&device));
    }

    fn notify(&self, f: impl Fn(&dyn ScanListener)) {
        let snapshot = self.listeners.lock().clone();
        for listener in &snapshot {
            f(listener.as_ref());
        }
    }
}

async fn pump(
    inner: Weak<EngineInner>,
    mut rx: mpsc::UnboundedReceiver<Advertisement>,
    generation: u64,
) {
    while let Some(adv) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_advertisement(&adv, generation);
    }
}

async fn stop_after(inner: Weak<EngineInner>, period: Duration, generation: u64) {
    tokio::time::sleep(period).await;
    if let Some(inner) = inner.upgrade() {
        debug!(period_ms = period.as_millis(), "scan period elapsed");
        inner.stop(false, Some(generation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanFilters;
    use crate::radio::sim::SimulatedRadio;
    use crate::scanner::{LegacyScanner, ModernScanner, Scanner};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        starts: AtomicUsize,
        stops: AtomicUsize,
        results: Mutex<Vec<Device>>,
        errors: Mutex<Vec<ScanError>>,
    }

    impl ScanListener for Recorder {
        fn on_scan_start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_scan_stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn on_scan_result(&self, device: &Device) {
            self.results.lock().push(device.clone());
        }

        fn on_scan_error(&self, error: &ScanError) {
            self.errors.lock().push(error.clone());
        }
    }

    fn settings(filters: ScanFilters) -> ScanSettings {
        ScanSettings {
            scan_period_ms: 0,
            filters,
            ..ScanSettings::default()
        }
    }

    fn name_filter(name: &str) -> ScanFilters {
        ScanFilters {
            names: vec![name.to_string()],
            ..ScanFilters::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_results_reach_listeners() {
        let radio = SimulatedRadio::new();
        let scanner = LegacyScanner::new(radio.clone(), settings(ScanFilters::default()), Handle::current());
        let recorder = Arc::new(Recorder::default());
        scanner.add_listener(recorder.clone());

        assert!(scanner.start());
        radio.advertise("AA:BB:CC:DD:EE:01", Some("Sensor"), -50);
        radio.advertise("AA:BB:CC:DD:EE:02", None, -70);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.results.lock().len(), 2);
        assert_eq!(
            scanner.discovered("aa:bb:cc:dd:ee:01").unwrap().name.as_deref(),
            Some("Sensor")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_filters_in_software() {
        let radio = SimulatedRadio::new();
        let scanner = LegacyScanner::new(radio.clone(), settings(name_filter("Wanted")), Handle::current());
        let recorder = Arc::new(Recorder::default());
        scanner.add_listener(recorder.clone());

        scanner.start();
        radio.advertise("AA:BB:CC:DD:EE:01", Some("Wanted"), -50);
        radio.advertise("AA:BB:CC:DD:EE:02", Some("Other"), -50);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let results = recorder.results.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].address(), "AA:BB:CC:DD:EE:01");
    }

    #[tokio::test(start_paused = true)]
    async fn test_modern_filters_in_stack() {
        let radio = SimulatedRadio::new();
        let scanner = ModernScanner::new(radio.clone(), settings(name_filter("Wanted")), Handle::current());
        let recorder = Arc::new(Recorder::default());
        scanner.add_listener(recorder.clone());

        scanner.start();
        radio.advertise("AA:BB:CC:DD:EE:01", Some("Wanted"), -50);
        radio.advertise("AA:BB:CC:DD:EE:02", Some("Other"), -50);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(recorder.results.lock().len(), 1);
        assert_eq!(radio.last_scan_filters(), Some(name_filter("Wanted")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_stop_does_not_notify() {
        let radio = SimulatedRadio::new();
        let scanner = ModernScanner::new(radio.clone(), settings(ScanFilters::default()), Handle::current());
        let recorder = Arc::new(Recorder::default());
        scanner.add_listener(recorder.clone());

        scanner.start();
        scanner.on_adapter_off();
        assert!(!scanner.is_scanning());
        assert!(!radio.is_scanning());
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 0);

        scanner.start();
        scanner.stop(false);
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_is_reported_to_listeners() {
        let radio = SimulatedRadio::new();
        radio.fail_next_scan(ScanError::PermissionDenied);
        let scanner = ModernScanner::new(radio.clone(), settings(ScanFilters::default()), Handle::current());
        let recorder = Arc::new(Recorder::default());
        scanner.add_listener(recorder.clone());

        assert!(!scanner.start());
        assert!(!scanner.is_scanning());
        assert_eq!(*recorder.errors.lock(), vec![ScanError::PermissionDenied]);
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_period_stops_scan() {
        let radio = SimulatedRadio::new();
        let settings = ScanSettings {
            scan_period_ms: 1_000,
            ..ScanSettings::default()
        };
        let scanner = ModernScanner::new(radio.clone(), settings, Handle::current());
        let recorder = Arc::new(Recorder::default());
        scanner.add_listener(recorder.clone());

        scanner.start();
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(scanner.is_scanning());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!scanner.is_scanning());
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_listener() {
        let radio = SimulatedRadio::new();
        let scanner = LegacyScanner::new(radio.clone(), settings(ScanFilters::default()), Handle::current());
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn ScanListener> = recorder.clone();
        scanner.add_listener(listener.clone());

        assert!(scanner.remove_listener(&listener));
        assert!(!scanner.remove_listener(&listener));

        scanner.start();
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);
    }
}
