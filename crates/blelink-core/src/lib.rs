//! # blelink-core
//!
//! Connection management for Bluetooth Low Energy centrals.
//!
//! This crate provides:
//! - Device discovery through interchangeable scanner strategies
//! - One state machine per device that connects, discovers services,
//!   negotiates the MTU and reconnects after link loss
//! - Serialized GATT request execution with timeouts, priorities and retries
//! - Observer broadcast with per-observer execution contexts
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`registry`] - Process-wide entry point owning the scanner and connections
//! - [`connection`] - Per-device connection state machine and request queue
//! - [`request`] - Request values and their validating builder
//! - [`scanner`] - Modern and legacy discovery strategies
//! - [`dispatch`] - Observer registration and event broadcast
//! - [`poster`] - Execution contexts that run observer callbacks
//! - [`event`] / [`observer`] - Events and the observer trait
//! - [`radio`] - The radio stack seam, a simulated stack and the BlueZ backend
//! - [`config`] - Settings loading, saving and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use blelink_core::radio::sim::SimulatedRadio;
//! use blelink_core::{Registry, RequestBuilder};
//! use uuid::uuid;
//!
//! # async fn run() -> blelink_core::Result<()> {
//! let registry = Registry::builder(SimulatedRadio::new()).build()?;
//! let connection = registry.connect_address(
//!     "AA:BB:CC:DD:EE:FF",
//!     registry.default_configuration(),
//!     None,
//! )?;
//!
//! let request = RequestBuilder::read_characteristic(
//!     uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e"),
//!     uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e"),
//! )
//! .callback(|info, result| println!("{}: {result:?}", info.kind))
//! .build()?;
//! connection.execute(request);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod observer;
pub mod poster;
pub mod radio;
pub mod registry;
pub mod request;
pub mod scanner;
pub mod types;

// Re-export primary types for convenience
pub use config::{
    BleSettings, ConfigError, ConfigResult, ConnectionConfiguration, MtuPolicy, PowerProfile,
    ScanFilters, ScanSettings, ScannerKind, TelemetryChannel,
};
pub use connection::{ConnectError, Connection};
pub use dispatch::{Dispatcher, ObserverHandle};
pub use error::{BleError, Result};
pub use event::{BleEvent, EventKind};
pub use observer::EventObserver;
pub use poster::{ExecutionContext, MainExecutor, SerialExecutor};
pub use radio::{RadioStack, StackError};
pub use registry::{Registry, RegistryBuilder};
pub use request::{
    BuildError, NotificationKind, Request, RequestBuilder, RequestError, RequestInfo,
    RequestKind, RequestOutput, WriteMode, WriteOptions,
};
pub use scanner::{ScanError, ScanListener, Scanner};
pub use types::{
    is_valid_address, AdapterState, BondState, ConnectionState, Device, Phy, PhyOption,
    TimeoutKind,
};
