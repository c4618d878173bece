//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `health` - Service health checks
//! - `scan` - Discovery and the device list
//! - `connections` - Connections and GATT requests
//! - `events` - Recent observer events
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod connections;
pub mod error;
pub mod events;
pub mod health;
pub mod openapi;
pub mod scan;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                      - Health check
/// /api
/// ├── /scan/start, /scan/stop  - Discovery control
/// ├── /devices                 - Discovered devices
/// ├── /connections             - Connections and GATT requests
/// ├── /events                  - Recent observer events
/// └── /openapi.json            - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/devices", get(scan::list_devices))
                .route("/events", get(events::list_events))
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/scan", scan::router())
                .nest("/connections", connections::router()),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
