//! Process-wide entry point.
//!
//! A [`Registry`] owns the radio stack, the active scanner strategy, the
//! observer dispatcher and every live [`Connection`]. Build one at startup
//! with [`Registry::builder`] and pass it around, or [`install`] it as the
//! process global.
//!
//! [`install`]: Registry::install

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BleSettings, BondPolicy, ConnectionConfiguration};
use crate::connection::{ConnectError, Connection, ConnectionContext};
use crate::dispatch::{DirectObserver, Dispatcher, ObserverHandle};
use crate::error::{BleError, Result};
use crate::event::BleEvent;
use crate::observer::EventObserver;
use crate::poster::{MainExecutor, Poster, SerialExecutor};
use crate::radio::RadioStack;
use crate::scanner::{new_scanner, ScanListener, Scanner};
use crate::types::{AdapterState, BondState, Device};

/// Delay before connecting to a device we just asked to bond with.
pub const BOND_CONNECT_DELAY: Duration = Duration::from_millis(1_500);

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Builder for [`Registry`].
pub struct RegistryBuilder {
    radio: Arc<dyn RadioStack>,
    settings: BleSettings,
    bond_policy: Option<BondPolicy>,
    main_executor: Option<Arc<dyn MainExecutor>>,
}

impl RegistryBuilder {
    /// Library settings. Defaults to [`BleSettings::default`].
    #[must_use]
    pub fn settings(mut self, settings: BleSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Devices accepted by `policy` are bonded before connecting.
    #[must_use]
    pub fn bond_policy(mut self, policy: impl Fn(&Device) -> bool + Send + Sync + 'static) -> Self {
        self.bond_policy = Some(Arc::new(policy));
        self
    }

    /// Executor behind [`ExecutionContext::Main`]. Defaults to a
    /// [`SerialExecutor`] on the current runtime.
    ///
    /// [`ExecutionContext::Main`]: crate::poster::ExecutionContext::Main
    #[must_use]
    pub fn main_executor(mut self, executor: Arc<dyn MainExecutor>) -> Self {
        self.main_executor = Some(executor);
        self
    }

    /// Build the registry on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::NoRuntime`] outside a runtime, or a configuration
    /// error if the settings do not validate.
    pub fn build(self) -> Result<Registry> {
        let handle = Handle::try_current().map_err(|_| BleError::NoRuntime)?;
        self.settings.validate()?;

        let main = self
            .main_executor
            .unwrap_or_else(|| Arc::new(SerialExecutor::spawn(&handle, "main")));
        let poster = Poster::new(
            &handle,
            main,
            self.settings.background_workers,
            self.settings.default_execution_context,
        );
        let dispatcher = Arc::new(Dispatcher::new(poster));

        let scanner = new_scanner(
            Arc::clone(&self.radio),
            self.settings.scan.clone(),
            handle.clone(),
        );
        scanner.add_listener(Arc::new(ScanRelay {
            dispatcher: Arc::clone(&dispatcher),
        }));

        let inner = Arc::new(RegistryInner {
            radio: self.radio,
            settings: self.settings,
            bond_policy: self.bond_policy,
            dispatcher,
            scanner,
            handle,
            connections: Mutex::new(Vec::new()),
            next_affinity: AtomicU64::new(0),
            adapter_watcher: Mutex::new(None),
        });
        let watcher = inner.handle.spawn(watch_adapter(Arc::downgrade(&inner)));
        *inner.adapter_watcher.lock() = Some(watcher);

        info!(
            scanner = ?inner.scanner.kind(),
            adapter = ?inner.radio.adapter_state(),
            "registry ready"
        );
        Ok(Registry { inner })
    }
}

/// Single access point for scanning, connections and observers.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    radio: Arc<dyn RadioStack>,
    settings: BleSettings,
    bond_policy: Option<BondPolicy>,
    dispatcher: Arc<Dispatcher>,
    scanner: Arc<dyn Scanner>,
    handle: Handle,
    /// Live connections in connect order.
    connections: Mutex<Vec<Connection>>,
    next_affinity: AtomicU64,
    adapter_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryInner {
    fn on_adapter_changed(&self, state: AdapterState) {
        info!(state = ?state, "adapter state changed");
        if state == AdapterState::Off {
            self.scanner.on_adapter_off();
        }
        for connection in self.connections.lock().iter() {
            connection.adapter_changed(state == AdapterState::On);
        }
        self.dispatcher
            .broadcast(BleEvent::AdapterStateChanged { state });
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(watcher) = self.adapter_watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

async fn watch_adapter(inner: Weak<RegistryInner>) {
    let Some(mut rx) = inner.upgrade().map(|inner| inner.radio.watch_adapter()) else {
        return;
    };
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_adapter_changed(state);
    }
}

/// Forwards scan results to broadcast observers.
struct ScanRelay {
    dispatcher: Arc<Dispatcher>,
}

impl ScanListener for ScanRelay {
    fn on_scan_result(&self, device: &Device) {
        self.dispatcher.broadcast(BleEvent::ScanResult {
            device: device.clone(),
        });
    }
}

impl Registry {
    /// Start building a registry over `radio`.
    #[must_use]
    pub fn builder(radio: Arc<dyn RadioStack>) -> RegistryBuilder {
        RegistryBuilder {
            radio,
            settings: BleSettings::default(),
            bond_policy: None,
            main_executor: None,
        }
    }

    /// Make this registry the process global.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::AlreadyInitialized`] if one is already installed.
    pub fn install(self) -> Result<&'static Self> {
        let mut installed = false;
        let registry = GLOBAL.get_or_init(|| {
            installed = true;
            self
        });
        if installed {
            Ok(registry)
        } else {
            Err(BleError::AlreadyInitialized)
        }
    }

    /// The installed global registry, if any.
    #[must_use]
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get()
    }

    /// Settings the registry was built with.
    #[must_use]
    pub fn settings(&self) -> &BleSettings {
        &self.inner.settings
    }

    /// Connection configuration derived from the settings.
    #[must_use]
    pub fn default_configuration(&self) -> ConnectionConfiguration {
        ConnectionConfiguration::from(&self.inner.settings)
    }

    /// Current adapter power state.
    #[must_use]
    pub fn adapter_state(&self) -> AdapterState {
        self.inner.radio.adapter_state()
    }

    // ===== Connections =====

    /// Connect to `device`.
    ///
    /// `observer` receives this connection's events and request results in
    /// addition to the broadcast observers.
    ///
    /// # Errors
    ///
    /// - [`BleError::Connect`] with [`ConnectError::Unconnectable`] if the
    ///   device advertised as non-connectable
    /// - [`BleError::AlreadyConnecting`] if a live connection exists for the
    ///   address
    pub fn connect(
        &self,
        mut device: Device,
        config: ConnectionConfiguration,
        observer: Option<Arc<dyn EventObserver>>,
    ) -> Result<Connection> {
        if device.connectable == Some(false) {
            warn!(address = %device.address(), "refusing to connect to unconnectable device");
            self.inner.dispatcher.broadcast(BleEvent::ConnectFailed {
                device,
                error: ConnectError::Unconnectable,
            });
            return Err(ConnectError::Unconnectable.into());
        }

        if self.has_live_connection(device.address()) {
            return Err(BleError::AlreadyConnecting(device.address().to_string()));
        }

        let start_delay = self.bond_if_needed(&device, &config);
        device.state = crate::types::ConnectionState::Disconnected;
        let affinity = self.inner.next_affinity.fetch_add(1, Ordering::Relaxed);
        let observer = observer.map(|observer| DirectObserver::new(observer, affinity));

        info!(address = %device.address(), delay_ms = start_delay.as_millis(), "connecting");
        let connection = Connection::spawn(
            device,
            Arc::new(config),
            ConnectionContext {
                radio: Arc::clone(&self.inner.radio),
                scanner: Arc::clone(&self.inner.scanner),
                dispatcher: Arc::clone(&self.inner.dispatcher),
                handle: self.inner.handle.clone(),
            },
            observer,
            affinity,
            start_delay,
        );

        let mut connections = self.inner.connections.lock();
        connections.retain(|c| !c.is_released());
        if connections
            .iter()
            .any(|c| c.address() == connection.address())
        {
            drop(connections);
            connection.release_quietly();
            return Err(BleError::AlreadyConnecting(connection.address().to_string()));
        }
        connections.push(connection.clone());
        Ok(connection)
    }

    fn has_live_connection(&self, address: &str) -> bool {
        let mut connections = self.inner.connections.lock();
        connections.retain(|c| !c.is_released());
        connections.iter().any(|c| c.address() == address)
    }

    /// Connect by address, reusing the scan record when there is one.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect), plus [`BleError::InvalidAddress`].
    pub fn connect_address(
        &self,
        address: &str,
        config: ConnectionConfiguration,
        observer: Option<Arc<dyn EventObserver>>,
    ) -> Result<Connection> {
        let device = match self.inner.scanner.discovered(address) {
            Some(device) => device,
            None => Device::new(address)?,
        };
        self.connect(device, config, observer)
    }

    fn bond_if_needed(&self, device: &Device, config: &ConnectionConfiguration) -> Duration {
        let Some(policy) = config.bond_policy.as_ref().or(self.inner.bond_policy.as_ref()) else {
            return Duration::ZERO;
        };
        if !policy(device) || self.inner.radio.bond_state(device.address()) != BondState::None {
            return Duration::ZERO;
        }
        if self.inner.radio.create_bond(device.address()) {
            debug!(address = %device.address(), "bonding before connect");
            BOND_CONNECT_DELAY
        } else {
            warn!(address = %device.address(), "stack refused to bond");
            Duration::ZERO
        }
    }

    /// The live connection for `address`.
    #[must_use]
    pub fn connection(&self, address: &str) -> Option<Connection> {
        self.inner
            .connections
            .lock()
            .iter()
            .find(|c| !c.is_released() && c.address().eq_ignore_ascii_case(address))
            .cloned()
    }

    /// Live connections in connect order.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        let mut connections = self.inner.connections.lock();
        connections.retain(|c| !c.is_released());
        connections.clone()
    }

    /// The oldest live connection.
    #[must_use]
    pub fn first_connection(&self) -> Option<Connection> {
        self.connections().into_iter().next()
    }

    /// The newest live connection.
    #[must_use]
    pub fn last_connection(&self) -> Option<Connection> {
        self.connections().pop()
    }

    fn require(&self, address: &str) -> Result<Connection> {
        self.connection(address)
            .ok_or_else(|| BleError::ConnectionNotFound(address.to_string()))
    }

    /// Disconnect `address` without reconnecting.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::ConnectionNotFound`] if there is no live connection.
    pub fn disconnect(&self, address: &str) -> Result<()> {
        self.require(address)?.disconnect();
        Ok(())
    }

    /// Release `address` and forget it.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::ConnectionNotFound`] if there is no live connection.
    pub fn release(&self, address: &str) -> Result<()> {
        let connection = self.require(address)?;
        connection.release();
        self.inner
            .connections
            .lock()
            .retain(|c| !c.address().eq_ignore_ascii_case(address));
        Ok(())
    }

    /// Restart the connect sequence for `address` unless it is ready.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::ConnectionNotFound`] if there is no live connection.
    pub fn reconnect(&self, address: &str) -> Result<()> {
        let connection = self.require(address)?;
        if !connection.is_ready() {
            connection.reconnect();
        }
        Ok(())
    }

    /// Disconnect every connection.
    pub fn disconnect_all(&self) {
        for connection in self.connections() {
            connection.disconnect();
        }
    }

    /// Reconnect every connection that is not ready.
    pub fn reconnect_all(&self) {
        for connection in self.connections() {
            if !connection.is_ready() {
                connection.reconnect();
            }
        }
    }

    /// Release and forget every connection.
    pub fn release_all(&self) {
        let connections = std::mem::take(&mut *self.inner.connections.lock());
        for connection in connections {
            connection.release();
        }
    }

    // ===== Observers =====

    /// Register a broadcast observer.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::DuplicateObserver`] if it is already registered.
    pub fn register_observer<O: EventObserver>(&self, observer: &Arc<O>) -> Result<ObserverHandle> {
        self.inner.dispatcher.register(observer)
    }

    /// Unregister by handle. Returns `false` if it was not registered.
    pub fn unregister_observer(&self, handle: ObserverHandle) -> bool {
        self.inner.dispatcher.unregister(handle)
    }

    /// Unregister by instance. Returns `false` if it was not registered.
    pub fn unregister_observer_instance<O: EventObserver>(&self, observer: &Arc<O>) -> bool {
        self.inner.dispatcher.unregister_observer(observer)
    }

    /// The dispatcher behind the registry.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    // ===== Scanning =====

    /// Start discovery with the configured strategy.
    pub fn start_scan(&self) -> bool {
        self.inner.scanner.start()
    }

    /// Stop discovery.
    pub fn stop_scan(&self) {
        self.inner.scanner.stop(false);
    }

    /// Stop discovery without notifying listeners.
    pub fn stop_scan_quietly(&self) {
        self.inner.scanner.stop(true);
    }

    /// Returns `true` while discovery is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.inner.scanner.is_scanning()
    }

    /// Add a scan listener.
    pub fn add_scan_listener(&self, listener: Arc<dyn ScanListener>) {
        self.inner.scanner.add_listener(listener);
    }

    /// Remove a scan listener.
    pub fn remove_scan_listener(&self, listener: &Arc<dyn ScanListener>) -> bool {
        self.inner.scanner.remove_listener(listener)
    }

    /// Devices seen by the current scan.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.inner.scanner.devices()
    }

    /// Stop scanning, release every connection quietly and drop all
    /// observers.
    pub fn shutdown(&self) {
        info!("registry shutting down");
        self.inner.scanner.stop(true);
        let connections = std::mem::take(&mut *self.inner.connections.lock());
        for connection in connections {
            connection.release_quietly();
        }
        self.inner.dispatcher.clear();
        if let Some(watcher) = self.inner.adapter_watcher.lock().take() {
            watcher.abort();
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("scanner", &self.inner.scanner.kind())
            .field("connections", &self.inner.connections.lock().len())
            .finish_non_exhaustive()
    }
}
