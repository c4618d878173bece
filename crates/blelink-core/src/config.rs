//! Library configuration management.
//!
//! Handles loading, saving, and validating blelink settings including:
//! - Connect and request timeouts
//! - Auto-reconnect policy
//! - Default execution context for observer delivery
//! - Scanner strategy, power profile and filters
//! - MTU policy and the telemetry channel identifiers
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables prefixed with `BLELINK_` (nested keys use `__`, e.g.
//! `BLELINK_SCAN__SCAN_PERIOD_MS=5000`).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::{uuid, Uuid};

use crate::poster::ExecutionContext;
use crate::request::{WriteOptions, MAX_MTU, MIN_MTU};
use crate::types::{is_valid_address, Device};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "BLELINK";

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while loading, saving or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The settings file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The settings file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The layered sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The settings could not be serialized to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field failed validation.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

// =============================================================================
// SETTINGS
// =============================================================================

/// Top-level library settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSettings {
    /// Budget for one connect attempt, from `CONNECTING` to `SERVICE_DISCOVERED`.
    pub connect_timeout_ms: u64,

    /// Default per-request timeout.
    pub request_timeout_ms: u64,

    /// Reconnect automatically after an unexpected link loss.
    pub auto_reconnect: bool,

    /// Direct reconnect attempts before falling back to scanning.
    pub reconnect_immediately_max_times: u32,

    /// Upper bound on reconnect attempts; `None` retries forever.
    pub try_reconnect_max_times: Option<u32>,

    /// Pause between link-up and service discovery.
    pub discover_services_delay_ms: u64,

    /// Where observer callbacks run unless they ask otherwise.
    pub default_execution_context: ExecutionContext,

    /// Size of the background delivery pool.
    pub background_workers: usize,

    /// Scanner settings.
    pub scan: ScanSettings,

    /// MTU negotiated after service discovery.
    pub mtu: MtuPolicy,

    /// Identifiers of the peripheral's telemetry channel.
    pub telemetry: TelemetryChannel,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 3_000,
            auto_reconnect: true,
            reconnect_immediately_max_times: 3,
            try_reconnect_max_times: None,
            discover_services_delay_ms: 600,
            default_execution_context: ExecutionContext::Main,
            background_workers: 4,
            scan: ScanSettings::default(),
            mtu: MtuPolicy::default(),
            telemetry: TelemetryChannel::default(),
        }
    }
}

/// Which discovery strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerKind {
    /// Filters and power profile are applied by the stack.
    #[default]
    Modern,
    /// Unfiltered discovery; filters are applied in software.
    Legacy,
}

/// Scan power/latency trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerProfile {
    /// Long scan interval.
    LowPower,
    /// Middle ground.
    #[default]
    Balanced,
    /// Continuous scanning.
    LowLatency,
}

/// Scanner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Discovery strategy.
    pub scanner: ScannerKind,
    /// Power profile for the modern strategy.
    pub power_profile: PowerProfile,
    /// Batching window for scan results; 0 reports immediately.
    pub report_delay_ms: u64,
    /// A scan stops by itself after this long; 0 scans until stopped.
    pub scan_period_ms: u64,
    /// Discovery filters.
    pub filters: ScanFilters,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            scanner: ScannerKind::Modern,
            power_profile: PowerProfile::Balanced,
            report_delay_ms: 0,
            scan_period_ms: 10_000,
            filters: ScanFilters::default(),
        }
    }
}

/// Discovery filters. Empty lists match everything; non-empty lists must each
/// contain a match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanFilters {
    /// Exact advertised names.
    pub names: Vec<String>,
    /// Hardware addresses.
    pub addresses: Vec<String>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Weakest acceptable RSSI.
    pub min_rssi: Option<i16>,
}

impl ScanFilters {
    /// Returns `true` if no filter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
            && self.addresses.is_empty()
            && self.service_uuids.is_empty()
            && self.min_rssi.is_none()
    }

    /// Applies the filters to one advertisement.
    #[must_use]
    pub fn matches(
        &self,
        address: &str,
        name: Option<&str>,
        rssi: i16,
        service_uuids: &[Uuid],
    ) -> bool {
        if let Some(min) = self.min_rssi {
            if rssi < min {
                return false;
            }
        }
        if !self.addresses.is_empty()
            && !self
                .addresses
                .iter()
                .any(|a| a.eq_ignore_ascii_case(address))
        {
            return false;
        }
        if !self.names.is_empty() && !name.is_some_and(|n| self.names.iter().any(|f| f == n)) {
            return false;
        }
        if !self.service_uuids.is_empty()
            && !self.service_uuids.iter().any(|u| service_uuids.contains(u))
        {
            return false;
        }
        true
    }
}

/// MTU requested once services are discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtuPolicy {
    /// MTU for most peripherals.
    pub default_mtu: u16,
    /// MTU for peripherals matching [`Self::constrained_name_patterns`].
    pub constrained_mtu: u16,
    /// Case-insensitive name substrings that select the constrained MTU.
    pub constrained_name_patterns: Vec<String>,
}

impl Default for MtuPolicy {
    fn default() -> Self {
        Self {
            default_mtu: 503,
            constrained_mtu: 185,
            constrained_name_patterns: Vec::new(),
        }
    }
}

impl MtuPolicy {
    /// Returns `true` if the device name matches a constrained pattern.
    #[must_use]
    pub fn is_constrained(&self, device: &Device) -> bool {
        let Some(name) = device.name.as_deref() else {
            return false;
        };
        let name = name.to_ascii_lowercase();
        self.constrained_name_patterns
            .iter()
            .any(|p| !p.is_empty() && name.contains(&p.to_ascii_lowercase()))
    }
}

/// The three identifiers addressing the peripheral's telemetry channel.
///
/// Defaults are the Nordic UART service layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryChannel {
    /// Primary service.
    pub service: Uuid,
    /// Characteristic the peripheral notifies on.
    pub notify_characteristic: Uuid,
    /// Characteristic the host writes to.
    pub write_characteristic: Uuid,
    /// Enable notifications and read the channel once services are discovered.
    pub bootstrap: bool,
}

impl Default for TelemetryChannel {
    fn default() -> Self {
        Self {
            service: uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e"),
            notify_characteristic: uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e"),
            write_characteristic: uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e"),
            bootstrap: true,
        }
    }
}

impl BleSettings {
    /// Load settings from `path`, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file does not exist, or a parse or
    /// validation error.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::layered(Some(path))
    }

    /// Load settings from `path` if it exists, otherwise from defaults; environment
    /// overrides apply either way.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation error.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::layered(Some(path))
        } else {
            Self::layered(None)
        }
    }

    fn layered(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Write settings to `path` as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default settings file location for the current user.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "blelink")
            .map(|dirs| dirs.config_dir().join("blelink.toml"))
    }

    /// Validate every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`] or
    /// [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.connect_timeout_ms == 0 {
            errors.push(ConfigError::invalid("connect_timeout_ms", "must be greater than 0"));
        }
        if self.request_timeout_ms == 0 {
            errors.push(ConfigError::invalid("request_timeout_ms", "must be greater than 0"));
        }
        if self.background_workers == 0 {
            errors.push(ConfigError::invalid("background_workers", "must be at least 1"));
        }
        for (field, mtu) in [
            ("mtu.default_mtu", self.mtu.default_mtu),
            ("mtu.constrained_mtu", self.mtu.constrained_mtu),
        ] {
            if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
                errors.push(ConfigError::invalid(
                    field,
                    format!("{mtu} is outside {MIN_MTU}..={MAX_MTU}"),
                ));
            }
        }
        for address in &self.scan.filters.addresses {
            if !is_valid_address(address) {
                errors.push(ConfigError::invalid(
                    "scan.filters.addresses",
                    format!("'{address}' is not a valid address"),
                ));
            }
        }
        let telemetry = &self.telemetry;
        for (field, id) in [
            ("telemetry.service", telemetry.service),
            ("telemetry.notify_characteristic", telemetry.notify_characteristic),
            ("telemetry.write_characteristic", telemetry.write_characteristic),
        ] {
            if id.is_nil() {
                errors.push(ConfigError::invalid(field, "must not be the nil UUID"));
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

// =============================================================================
// PER-CONNECTION CONFIGURATION
// =============================================================================

/// Predicate deciding whether a device should be bonded before connecting.
pub type BondPolicy = Arc<dyn Fn(&Device) -> bool + Send + Sync>;

/// Predicate overriding the MTU name heuristic.
pub type DevicePredicate = Arc<dyn Fn(&Device) -> bool + Send + Sync>;

/// Settings frozen into one connection at connect time.
#[derive(Clone)]
pub struct ConnectionConfiguration {
    /// Budget for one connect attempt.
    pub connect_timeout: Duration,
    /// Default per-request timeout.
    pub request_timeout: Duration,
    /// Reconnect after unexpected link loss.
    pub auto_reconnect: bool,
    /// Direct reconnect attempts before scanning.
    pub reconnect_immediately_max_times: u32,
    /// Upper bound on reconnect attempts; `None` is unbounded.
    pub try_reconnect_max_times: Option<u32>,
    /// Pause between link-up and service discovery.
    pub discover_services_delay: Duration,
    /// Optional bond-acceptance policy.
    pub bond_policy: Option<BondPolicy>,
    /// Extra filters a reconnection scan result must pass.
    pub reconnect_filters: Option<ScanFilters>,
    /// MTU requested after discovery.
    pub mtu: MtuPolicy,
    /// Selects the constrained MTU instead of the name patterns when set.
    pub constrained_device: Option<DevicePredicate>,
    /// Telemetry channel identifiers.
    pub telemetry: TelemetryChannel,
    /// Write options used when a write request carries none.
    pub default_write_options: HashMap<(Uuid, Uuid), WriteOptions>,
}

impl ConnectionConfiguration {
    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable or disable auto-reconnect.
    #[must_use]
    pub const fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the number of direct reconnect attempts.
    #[must_use]
    pub const fn with_reconnect_immediately_max_times(mut self, times: u32) -> Self {
        self.reconnect_immediately_max_times = times;
        self
    }

    /// Bound the total reconnect attempts.
    #[must_use]
    pub const fn with_try_reconnect_max_times(mut self, times: Option<u32>) -> Self {
        self.try_reconnect_max_times = times;
        self
    }

    /// Set the discovery delay.
    #[must_use]
    pub const fn with_discover_services_delay(mut self, delay: Duration) -> Self {
        self.discover_services_delay = delay;
        self
    }

    /// Install a bond-acceptance policy.
    #[must_use]
    pub fn with_bond_policy(mut self, policy: impl Fn(&Device) -> bool + Send + Sync + 'static) -> Self {
        self.bond_policy = Some(Arc::new(policy));
        self
    }

    /// Install a predicate that selects the constrained MTU.
    #[must_use]
    pub fn with_constrained_device(
        mut self,
        predicate: impl Fn(&Device) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.constrained_device = Some(Arc::new(predicate));
        self
    }

    /// Set the telemetry channel.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: TelemetryChannel) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Register default write options for one characteristic.
    #[must_use]
    pub fn with_write_options(mut self, service: Uuid, characteristic: Uuid, options: WriteOptions) -> Self {
        self.default_write_options
            .insert((service, characteristic), options);
        self
    }

    /// MTU to request for `device`.
    #[must_use]
    pub fn mtu_for(&self, device: &Device) -> u16 {
        let constrained = self
            .constrained_device
            .as_ref()
            .map_or_else(|| self.mtu.is_constrained(device), |predicate| predicate(device));
        if constrained {
            self.mtu.constrained_mtu
        } else {
            self.mtu.default_mtu
        }
    }
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        Self::from(&BleSettings::default())
    }
}

impl From<&BleSettings> for ConnectionConfiguration {
    fn from(settings: &BleSettings) -> Self {
        Self {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            auto_reconnect: settings.auto_reconnect,
            reconnect_immediately_max_times: settings.reconnect_immediately_max_times,
            try_reconnect_max_times: settings.try_reconnect_max_times,
            discover_services_delay: Duration::from_millis(settings.discover_services_delay_ms),
            bond_policy: None,
            reconnect_filters: None,
            mtu: settings.mtu.clone(),
            constrained_device: None,
            telemetry: settings.telemetry.clone(),
            default_write_options: HashMap::new(),
        }
    }
}

impl fmt::Debug for ConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfiguration")
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("auto_reconnect", &self.auto_reconnect)
            .field(
                "reconnect_immediately_max_times",
                &self.reconnect_immediately_max_times,
            )
            .field("try_reconnect_max_times", &self.try_reconnect_max_times)
            .field("discover_services_delay", &self.discover_services_delay)
            .field("bond_policy", &self.bond_policy.is_some())
            .field("reconnect_filters", &self.reconnect_filters)
            .field("mtu", &self.mtu)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = BleSettings::default();
        assert_eq!(settings.connect_timeout_ms, 10_000);
        assert_eq!(settings.request_timeout_ms, 3_000);
        assert!(settings.auto_reconnect);
        assert_eq!(settings.reconnect_immediately_max_times, 3);
        assert_eq!(settings.try_reconnect_max_times, None);
        assert_eq!(settings.default_execution_context, ExecutionContext::Main);
        assert_eq!(settings.scan.scanner, ScannerKind::Modern);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("blelink.toml");

        let mut settings = BleSettings::default();
        settings.connect_timeout_ms = 5_000;
        settings.scan.scanner = ScannerKind::Legacy;
        settings.mtu.constrained_name_patterns = vec!["thermal".into()];
        settings.save(&path).unwrap();

        let loaded = BleSettings::load(&path).unwrap();
        assert_eq!(loaded.connect_timeout_ms, 5_000);
        assert_eq!(loaded.scan.scanner, ScannerKind::Legacy);
        assert_eq!(loaded.mtu.constrained_name_patterns, vec!["thermal".to_string()]);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blelink.toml");
        std::fs::write(&path, "request_timeout_ms = 7000\n[scan]\nscan_period_ms = 2000\n").unwrap();

        let loaded = BleSettings::load(&path).unwrap();
        assert_eq!(loaded.request_timeout_ms, 7_000);
        assert_eq!(loaded.scan.scan_period_ms, 2_000);
        assert_eq!(loaded.connect_timeout_ms, 10_000);
        assert_eq!(loaded.telemetry, TelemetryChannel::default());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = BleSettings::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let settings = BleSettings::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(settings.mtu, MtuPolicy::default());
    }

    #[test]
    fn test_malformed_uuid_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blelink.toml");
        std::fs::write(&path, "[telemetry]\nservice = \"not-a-uuid\"\n").unwrap();

        let err = BleSettings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut settings = BleSettings::default();
        settings.connect_timeout_ms = 0;
        settings.background_workers = 0;
        settings.mtu.default_mtu = 1000;

        match settings.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_validation_error() {
        let mut settings = BleSettings::default();
        settings.scan.filters.addresses = vec!["nope".into()];

        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
        assert!(err.to_string().contains("scan.filters.addresses"));
    }

    #[test]
    fn test_scan_filters() {
        let sensor = uuid!("0000180d-0000-1000-8000-00805f9b34fb");
        let filters = ScanFilters {
            names: vec!["Sensor".into()],
            addresses: Vec::new(),
            service_uuids: vec![sensor],
            min_rssi: Some(-80),
        };

        assert!(filters.matches("AA:BB:CC:DD:EE:FF", Some("Sensor"), -60, &[sensor]));
        assert!(!filters.matches("AA:BB:CC:DD:EE:FF", Some("Other"), -60, &[sensor]));
        assert!(!filters.matches("AA:BB:CC:DD:EE:FF", None, -60, &[sensor]));
        assert!(!filters.matches("AA:BB:CC:DD:EE:FF", Some("Sensor"), -90, &[sensor]));
        assert!(!filters.matches("AA:BB:CC:DD:EE:FF", Some("Sensor"), -60, &[]));
        assert!(ScanFilters::default().matches("AA:BB:CC:DD:EE:FF", None, -100, &[]));
    }

    #[test]
    fn test_mtu_policy_name_patterns() {
        let mut config = ConnectionConfiguration::default();
        config.mtu.constrained_name_patterns = vec!["tc00".into()];

        let constrained = Device::new("AA:BB:CC:DD:EE:01").unwrap().with_name("TC001-Plus");
        let regular = Device::new("AA:BB:CC:DD:EE:02").unwrap().with_name("Sensor");
        let unnamed = Device::new("AA:BB:CC:DD:EE:03").unwrap();

        assert_eq!(config.mtu_for(&constrained), 185);
        assert_eq!(config.mtu_for(&regular), 503);
        assert_eq!(config.mtu_for(&unnamed), 503);
    }

    #[test]
    fn test_mtu_predicate_overrides_patterns() {
        let config = ConnectionConfiguration::default()
            .with_constrained_device(|device| device.address().ends_with("02"));

        let regular = Device::new("AA:BB:CC:DD:EE:01").unwrap();
        let constrained = Device::new("AA:BB:CC:DD:EE:02").unwrap();

        assert_eq!(config.mtu_for(&regular), 503);
        assert_eq!(config.mtu_for(&constrained), 185);
    }

    #[test]
    fn test_connection_configuration_from_settings() {
        let mut settings = BleSettings::default();
        settings.request_timeout_ms = 7_000;
        settings.auto_reconnect = false;

        let config = ConnectionConfiguration::from(&settings);
        assert_eq!(config.request_timeout, Duration::from_millis(7_000));
        assert!(!config.auto_reconnect);
        assert!(config.bond_policy.is_none());
    }
}
