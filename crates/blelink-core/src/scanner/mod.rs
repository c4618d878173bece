//! Device discovery.
//!
//! Two interchangeable strategies share the [`Scanner`] contract:
//!
//! - [`ModernScanner`] hands filters and the power profile to the radio stack
//! - [`LegacyScanner`] runs unfiltered discovery and filters in software
//!
//! Both normalize raw advertisements through
//! [`ParsedAdvertisement`](advertisement::ParsedAdvertisement) before updating
//! the device cache and notifying [`ScanListener`]s, so consumers never see
//! which strategy is active. Failures are classified into [`ScanError`] and
//! reported to listeners instead of being returned.

pub mod advertisement;
mod engine;

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;

use crate::config::{ScanSettings, ScannerKind};
use crate::radio::RadioStack;
use crate::types::Device;

pub use engine::ScanEngine;

/// Classified scan failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// The platform denied scanning.
    #[error("permission to scan was denied")]
    PermissionDenied,

    /// Scanning requires location services, which are off.
    #[error("location services are disabled")]
    LocationServiceDisabled,

    /// The stack reported a failure.
    #[error("scan failed: {0}")]
    ScanFailed(String),
}

impl ScanError {
    /// Machine-readable code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "SCAN_PERMISSION_DENIED",
            Self::LocationServiceDisabled => "LOCATION_SERVICE_DISABLED",
            Self::ScanFailed(_) => "SCAN_FAILED",
        }
    }
}

/// Receives scan lifecycle and results.
#[allow(unused_variables)]
pub trait ScanListener: Send + Sync {
    /// Discovery started.
    fn on_scan_start(&self) {}

    /// Discovery stopped (not called for quiet stops).
    fn on_scan_stop(&self) {}

    /// A device was found or its advertisement refreshed.
    fn on_scan_result(&self, device: &Device) {}

    /// Discovery could not start or failed while running.
    fn on_scan_error(&self, error: &ScanError) {}
}

/// Scan lifecycle shared by every strategy.
pub trait Scanner: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> ScannerKind;

    /// Start discovery. Returns `true` if a scan is running afterwards;
    /// failures are reported through [`ScanListener::on_scan_error`].
    fn start(&self) -> bool;

    /// Stop discovery. A quiet stop does not notify listeners.
    fn stop(&self, quietly: bool);

    /// Returns `true` while discovery is running.
    fn is_scanning(&self) -> bool;

    /// The adapter was powered off.
    fn on_adapter_off(&self) {
        self.stop(true);
    }

    /// Add a listener.
    fn add_listener(&self, listener: Arc<dyn ScanListener>);

    /// Remove a listener. Returns `false` if it was not registered.
    fn remove_listener(&self, listener: &Arc<dyn ScanListener>) -> bool;

    /// The cached record for `address` from the current scan.
    fn discovered(&self, address: &str) -> Option<Device>;

    /// All devices seen by the current scan.
    fn devices(&self) -> Vec<Device>;

    /// Stop quietly and drop every listener.
    fn release(&self);
}

/// Strategies built on [`ScanEngine`].
trait EngineBacked: Send + Sync {
    const KIND: ScannerKind;

    fn engine(&self) -> &ScanEngine;
}

impl<T: EngineBacked> Scanner for T {
    fn kind(&self) -> ScannerKind {
        T::KIND
    }

    fn start(&self) -> bool {
        self.engine().start()
    }

    fn stop(&self, quietly: bool) {
        self.engine().stop(quietly);
    }

    fn is_scanning(&self) -> bool {
        self.engine().is_scanning()
    }

    fn add_listener(&self, listener: Arc<dyn ScanListener>) {
        self.engine().add_listener(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn ScanListener>) -> bool {
        self.engine().remove_listener(listener)
    }

    fn discovered(&self, address: &str) -> Option<Device> {
        self.engine().discovered(address)
    }

    fn devices(&self) -> Vec<Device> {
        self.engine().devices()
    }

    fn release(&self) {
        self.engine().release();
    }
}

/// Applies filters and the power profile in the radio stack.
#[derive(Debug)]
pub struct ModernScanner {
    engine: ScanEngine,
}

impl ModernScanner {
    /// Create a scanner over `radio`.
    #[must_use]
    pub fn new(radio: Arc<dyn RadioStack>, settings: ScanSettings, handle: Handle) -> Self {
        Self {
            engine: ScanEngine::new(radio, settings, engine::FilterMode::Stack, handle),
        }
    }
}

impl EngineBacked for ModernScanner {
    const KIND: ScannerKind = ScannerKind::Modern;

    fn engine(&self) -> &ScanEngine {
        &self.engine
    }
}

/// Unfiltered discovery with software filtering.
#[derive(Debug)]
pub struct LegacyScanner {
    engine: ScanEngine,
}

impl LegacyScanner {
    /// Create a scanner over `radio`.
    #[must_use]
    pub fn new(radio: Arc<dyn RadioStack>, settings: ScanSettings, handle: Handle) -> Self {
        Self {
            engine: ScanEngine::new(radio, settings, engine::FilterMode::Software, handle),
        }
    }
}

impl EngineBacked for LegacyScanner {
    const KIND: ScannerKind = ScannerKind::Legacy;

    fn engine(&self) -> &ScanEngine {
        &self.engine
    }
}

/// Build the strategy selected by `settings.scanner`.
#[must_use]
pub fn new_scanner(
    radio: Arc<dyn RadioStack>,
    settings: ScanSettings,
    handle: Handle,
) -> Arc<dyn Scanner> {
    match settings.scanner {
        ScannerKind::Modern => Arc::new(ModernScanner::new(radio, settings, handle)),
        ScannerKind::Legacy => Arc::new(LegacyScanner::new(radio, settings, handle)),
    }
}
