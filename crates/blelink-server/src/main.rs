//! # blelink-server
//!
//! HTTP server exposing a blelink connection registry.
//!
//! This binary provides:
//! - REST API for scanning, connections and GATT requests
//! - OpenAPI document at `/api/openapi.json`
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, simulated radio with a demo peripheral
//! cargo run --package blelink-server
//!
//! # BlueZ
//! cargo run --package blelink-server --no-default-features --features bluetooth
//! ```
//!
//! ## Environment
//!
//! - `BLELINK_ENV=production` switches to file logging
//! - `BLELINK_LOG_LEVEL` sets the default log filter
//! - `BLELINK_LOG_DIR` overrides the production log directory
//! - `BLELINK_CONFIG` points at the settings file
//! - `BLELINK_BIND` overrides the listen address (default `0.0.0.0:3000`)

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use blelink_core::{BleSettings, RadioStack, Registry};
use blelink_server::state::AppState;
use blelink_server::{api, logging};
use tokio::net::TcpListener;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "/etc/blelink/blelink.toml";
const DEFAULT_BIND: &str = "0.0.0.0:3000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("BLELINK_ENV").is_ok_and(|v| v == "production");
    logging::init(is_production)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting blelink-server");

    let config_path = std::env::var("BLELINK_CONFIG")
        .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let settings = BleSettings::load_or_default(&config_path)?;
    info!(path = %config_path.display(), scanner = ?settings.scan.scanner, "settings loaded");

    let radio = radio(&settings).await?;
    let registry = Registry::builder(radio)
        .settings(settings)
        .build()?
        .install()?
        .clone();
    let state = AppState::new(registry)?;

    let app = api::create_router(Arc::clone(&state));

    let addr: SocketAddr = std::env::var("BLELINK_BIND")
        .unwrap_or_else(|_| DEFAULT_BIND.to_string())
        .parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    state.shutdown();
    Ok(())
}

#[cfg(all(feature = "bluetooth", not(feature = "mock-bluetooth")))]
async fn radio(_settings: &BleSettings) -> anyhow::Result<Arc<dyn RadioStack>> {
    let radio = blelink_core::radio::bluer::BluerRadio::new().await?;
    info!("using BlueZ radio");
    Ok(radio)
}

#[cfg(not(all(feature = "bluetooth", not(feature = "mock-bluetooth"))))]
#[allow(clippy::unused_async)]
async fn radio(settings: &BleSettings) -> anyhow::Result<Arc<dyn RadioStack>> {
    use blelink_server::demo;

    let radio = demo::radio(&settings.telemetry);
    demo::spawn_activity(Arc::clone(&radio), settings.telemetry.clone());
    info!(address = demo::DEMO_ADDRESS, "using simulated radio with demo peripheral");
    Ok(radio)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
