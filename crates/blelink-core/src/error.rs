//! Unified error types for the blelink core library.
//!
//! This module provides a unified error type [`BleError`] that covers every failure
//! a caller can observe synchronously. Each module also has its own specific error
//! type ([`ConnectError`], [`RequestError`], [`ScanError`], [`BuildError`],
//! [`StackError`], [`ConfigError`]) which converts into it.
//!
//! # Design Principles
//!
//! - **Programming errors fail fast**: duplicate registration, double connect and
//!   malformed requests are returned as `Err` at the call site
//! - **Transport errors never unwind**: link, request and scan failures are
//!   delivered through request callbacks and observer events, not `?`
//! - **HTTP-ready**: error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use blelink_core::error::{BleError, Result};
//! use blelink_core::types::is_valid_address;
//!
//! fn check(address: &str) -> Result<()> {
//!     if !is_valid_address(address) {
//!         return Err(BleError::InvalidAddress(address.to_string()));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! [`ConnectError`]: crate::connection::ConnectError
//! [`RequestError`]: crate::request::RequestError
//! [`ScanError`]: crate::scanner::ScanError
//! [`BuildError`]: crate::request::BuildError
//! [`StackError`]: crate::radio::StackError
//! [`ConfigError`]: crate::config::ConfigError

use std::path::PathBuf;
use thiserror::Error;

use crate::connection::ConnectError;
use crate::radio::StackError;
use crate::request::{BuildError, RequestError};
use crate::scanner::ScanError;

/// The unified error type for all blelink operations.
#[derive(Debug, Error)]
pub enum BleError {
    // =========================================================================
    // PROGRAMMING ERRORS
    // =========================================================================
    /// A live connection already exists for this address.
    #[error("A connection to {0} already exists. Release it before connecting again.")]
    AlreadyConnecting(String),

    /// The observer instance is already registered.
    #[error("Observer is already registered")]
    DuplicateObserver,

    /// The process-wide registry has already been installed.
    #[error("The registry has already been initialized")]
    AlreadyInitialized,

    /// The string is not a `XX:XX:XX:XX:XX:XX` hardware address.
    #[error("Invalid Bluetooth address: '{0}'. Expected format 'AA:BB:CC:DD:EE:FF'.")]
    InvalidAddress(String),

    /// A registry was built outside of a tokio runtime.
    #[error("No tokio runtime is available. Build the registry from within a runtime.")]
    NoRuntime,

    /// A request could not be built.
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] BuildError),

    // =========================================================================
    // CONNECTION ERRORS
    // =========================================================================
    /// No connection is registered for this address.
    #[error("No connection for device {0}")]
    ConnectionNotFound(String),

    /// A connection attempt failed.
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// A GATT request failed.
    #[error("Request failed: {0}")]
    Request(#[from] RequestError),

    // =========================================================================
    // SCAN & RADIO ERRORS
    // =========================================================================
    /// Device discovery could not be started.
    #[error("Scan failed: {0}")]
    Scan(#[from] ScanError),

    /// The radio stack refused or could not perform an operation.
    #[error("Radio stack error: {0}")]
    Stack(#[from] StackError),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for blelink operations.
pub type Result<T> = std::result::Result<T, BleError>;

impl BleError {
    /// Returns `true` if this error indicates a misuse of the API rather than a
    /// transport failure.
    #[inline]
    #[must_use]
    pub const fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyConnecting(_)
                | Self::DuplicateObserver
                | Self::AlreadyInitialized
                | Self::InvalidAddress(_)
                | Self::NoRuntime
                | Self::InvalidRequest(_)
        )
    }

    /// Returns `true` if this error came from the radio link, a request or a scan.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Request(_) | Self::Scan(_) | Self::Stack(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if retrying the same call later may succeed.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Request(err) => err.is_retryable(),
            Self::Connect(ConnectError::ConnectTimeout(_) | ConnectError::StackUnavailable)
            | Self::Scan(ScanError::ScanFailed(_))
            | Self::Stack(StackError::Unavailable) => true,
            _ => false,
        }
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidAddress(_) | Self::InvalidRequest(_) => 400,

            // 403 Forbidden - the platform refused
            Self::Scan(ScanError::PermissionDenied) => 403,

            // 404 Not Found
            Self::ConnectionNotFound(_)
            | Self::ConfigNotFound(_)
            | Self::Request(
                RequestError::ServiceNotFound(_)
                | RequestError::CharacteristicNotFound(_)
                | RequestError::DescriptorNotFound(_),
            ) => 404,

            // 409 Conflict - state prevents the operation
            Self::AlreadyConnecting(_) | Self::DuplicateObserver | Self::AlreadyInitialized => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::Connect(ConnectError::Unconnectable)
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::NoRuntime | Self::PersistenceError(_) | Self::IoError(_) => 500,

            // 502 Bad Gateway - the peripheral answered with an error
            Self::Request(RequestError::Rejected(_) | RequestError::GattStatus(_)) => 502,

            // 504 Gateway Timeout - the peripheral never answered
            Self::Request(RequestError::RequestTimeout) => 504,

            // 503 Service Unavailable - radio or link is down
            Self::Connect(_) | Self::Request(_) | Self::Scan(_) | Self::Stack(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyConnecting(_) => "ALREADY_CONNECTING",
            Self::DuplicateObserver => "DUPLICATE_OBSERVER",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::NoRuntime => "NO_RUNTIME",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            Self::Connect(err) => err.error_code(),
            Self::Request(err) => err.error_code(),
            Self::Scan(err) => err.error_code(),
            Self::Stack(_) => "STACK_ERROR",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for BleError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {}: {}", path.display(), source))
            }
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {}", path.display(), source))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeoutKind;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_programming_error_classification() {
        assert!(BleError::AlreadyConnecting("AA:BB:CC:DD:EE:FF".into()).is_programming_error());
        assert!(BleError::DuplicateObserver.is_programming_error());
        assert!(BleError::AlreadyInitialized.is_programming_error());
        assert!(BleError::InvalidRequest(BuildError::EmptyPayload).is_programming_error());

        assert!(!BleError::Request(RequestError::RequestTimeout).is_programming_error());
    }

    #[test]
    fn test_transport_error_classification() {
        assert!(BleError::Request(RequestError::GattUnavailable).is_transport_error());
        assert!(BleError::Connect(ConnectError::ServiceDiscoveryFailed).is_transport_error());
        assert!(BleError::Scan(ScanError::LocationServiceDisabled).is_transport_error());
        assert!(BleError::Stack(StackError::Unavailable).is_transport_error());

        assert!(!BleError::DuplicateObserver.is_transport_error());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(BleError::ConfigNotFound(PathBuf::from("/test")).is_config_error());
        assert!(BleError::ConfigParseError("syntax error".into()).is_config_error());
        assert!(BleError::ConfigValidationError("invalid value".into()).is_config_error());

        assert!(!BleError::NoRuntime.is_config_error());
    }

    #[test]
    fn test_io_error_classification() {
        assert!(BleError::PersistenceError("disk full".into()).is_io_error());
        assert!(BleError::IoError(IoErr::new(ErrorKind::NotFound, "test")).is_io_error());

        assert!(!BleError::NoRuntime.is_io_error());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(BleError::Request(RequestError::RequestTimeout).is_recoverable());
        assert!(
            BleError::Connect(ConnectError::ConnectTimeout(TimeoutKind::CannotConnect))
                .is_recoverable()
        );
        assert!(BleError::Stack(StackError::Unavailable).is_recoverable());
        assert!(!BleError::Request(RequestError::DeviceDisconnected).is_recoverable());
        assert!(!BleError::AlreadyInitialized.is_recoverable());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(BleError::InvalidAddress("nope".into()).http_status_code(), 400);
        assert_eq!(BleError::Scan(ScanError::PermissionDenied).http_status_code(), 403);
        assert_eq!(
            BleError::ConnectionNotFound("AA:BB:CC:DD:EE:FF".into()).http_status_code(),
            404
        );
        assert_eq!(
            BleError::AlreadyConnecting("AA:BB:CC:DD:EE:FF".into()).http_status_code(),
            409
        );
        assert_eq!(BleError::Connect(ConnectError::Unconnectable).http_status_code(), 422);
        assert_eq!(
            BleError::Request(RequestError::GattStatus(133)).http_status_code(),
            502
        );
        assert_eq!(
            BleError::Request(RequestError::DeviceDisconnected).http_status_code(),
            503
        );
        assert_eq!(
            BleError::Request(RequestError::RequestTimeout).http_status_code(),
            504
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BleError::AlreadyConnecting("AA:BB:CC:DD:EE:FF".into()).error_code(),
            "ALREADY_CONNECTING"
        );
        assert_eq!(
            BleError::Request(RequestError::RequestTimeout).error_code(),
            "REQUEST_TIMEOUT"
        );
        assert_eq!(
            BleError::Connect(ConnectError::MaximumReconnection).error_code(),
            "MAXIMUM_RECONNECTION"
        );
        assert_eq!(
            BleError::ConfigNotFound(PathBuf::new()).error_code(),
            "CONFIG_NOT_FOUND"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoErr::new(ErrorKind::NotFound, "file not found");
        let ble_err: BleError = io_err.into();
        assert!(matches!(ble_err, BleError::IoError(_)));
        assert!(ble_err.is_io_error());
    }

    #[test]
    fn test_from_config_validation_errors() {
        use crate::config::ConfigError;

        let err: BleError = ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "connect_timeout_ms".into(),
                message: "must be greater than 0".into(),
            },
            ConfigError::ValidationError {
                field: "background_workers".into(),
                message: "must be at least 1".into(),
            },
        ])
        .into();

        let message = err.to_string();
        assert!(message.contains("connect_timeout_ms"));
        assert!(message.contains("background_workers"));
    }

    #[test]
    fn test_error_display_messages() {
        let err = BleError::AlreadyConnecting("AA:BB:CC:DD:EE:FF".into());
        assert!(format!("{err}").contains("AA:BB:CC:DD:EE:FF"));

        let err = BleError::InvalidAddress("not-an-address".into());
        assert!(format!("{err}").contains("not-an-address"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BleError>();
        assert_sync::<BleError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn example_function() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(example_function().unwrap(), 42);

        fn failing_function() -> Result<i32> {
            Err(BleError::DuplicateObserver)
        }
        assert!(failing_function().is_err());
    }
}
