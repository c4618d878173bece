//! OpenAPI specification generation for the blelink API.
//!
//! The document is served at `/api/openapi.json` and written to disk by the
//! `gen-openapi` binary for client generation.

use axum::Json;
use blelink_core::{AdapterState, ConnectionState, Device};
use utoipa::OpenApi;

use super::connections::{
    ConnectRequest, ConnectionSummary, ReadRequest, ReadResponse, WriteRequest, WriteResponse,
};
use super::error::ErrorResponse;
use super::events::EventsResponse;
use super::health::HealthResponse;
use super::scan::{DevicesResponse, ScanStatusResponse};
use crate::state::EventRecord;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// The OpenAPI specification as pretty JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for blelink.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "blelink API",
        version = "0.1.0",
        description = r#"
# blelink API

Connection management for Bluetooth Low Energy peripherals.

## Overview

1. **Scanning**: start and stop discovery, list every device seen
2. **Connections**: connect by address; each connection discovers services,
   negotiates the MTU and reconnects after link loss
3. **Requests**: write to the telemetry channel or read any characteristic;
   requests on one connection run one at a time in submission order
4. **Events**: recent connection, adapter and request events

## Connection states

`DISCONNECTED` → `CONNECTING` → `CONNECTED` → `SERVICE_DISCOVERING` →
`SERVICE_DISCOVERED` → `MTU_SUCCESS`. After link loss a connection with
auto-reconnect passes through `SCANNING_FOR_RECONNECTION`. `RELEASED` is
terminal.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local blelink server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "scan", description = "Device discovery"),
        (name = "connections", description = "Connections and GATT requests"),
        (name = "events", description = "Recent observer events")
    ),
    paths(
        super::health::health_check,
        super::scan::start_scan,
        super::scan::stop_scan,
        super::scan::list_devices,
        super::connections::list_connections,
        super::connections::create_connection,
        super::connections::get_connection,
        super::connections::disconnect,
        super::connections::reconnect,
        super::connections::release_connection,
        super::connections::write_telemetry,
        super::connections::read_characteristic,
        super::events::list_events,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            AdapterState,
            ConnectionState,
            Device,
            ScanStatusResponse,
            DevicesResponse,
            ConnectionSummary,
            ConnectRequest,
            WriteRequest,
            WriteResponse,
            ReadRequest,
            ReadResponse,
            EventRecord,
            EventsResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "blelink API");
        assert!(spec.paths.paths.contains_key("/api/connections/{address}/read"));
        assert!(spec.paths.paths.contains_key("/health"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"blelink API\""));
    }
}
