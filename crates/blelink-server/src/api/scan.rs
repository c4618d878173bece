//! Scanning endpoints and the discovered-device cache.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use blelink_core::Device;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Scanner status after a start or stop.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "scanning": true,
    "devices_seen": 3
}))]
pub struct ScanStatusResponse {
    /// Whether discovery is running.
    #[schema(example = true)]
    pub scanning: bool,

    /// Devices in the cache.
    #[schema(example = 3)]
    pub devices_seen: usize,
}

/// Discovered devices.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DevicesResponse {
    /// Devices seen since startup, strongest signal first.
    pub devices: Vec<Device>,

    /// Whether discovery is running.
    #[schema(example = false)]
    pub scanning: bool,

    /// When this list was produced.
    #[schema(example = "2025-01-15T03:30:00Z")]
    pub listed_at_utc: String,
}

/// Creates the scan router, mounted at `/api/scan`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/start", post(start_scan))
        .route("/stop", post(stop_scan))
}

// ============================================================================
// Handlers
// ============================================================================

/// Start discovery.
#[utoipa::path(
    post,
    path = "/api/scan/start",
    tag = "scan",
    operation_id = "startScan",
    summary = "Start scanning",
    description = "Starts device discovery with the configured scanner. Results \
        accumulate in the device list until the scan period ends or the scan \
        is stopped. Starting an already running scan is a no-op.",
    responses(
        (status = 200, description = "Scan running", body = ScanStatusResponse),
        (status = 503, description = "Scan could not start", body = super::error::ErrorResponse)
    )
)]
pub async fn start_scan(State(state): State<SharedState>) -> ApiResult<Json<ScanStatusResponse>> {
    if !state.registry.start_scan() {
        return Err(ApiError::ServiceUnavailable {
            error_code: "SCAN_FAILED".to_string(),
            message: "Scan could not be started".to_string(),
            details: state.devices.last_error(),
        });
    }
    Ok(Json(status(&state)))
}

/// Stop discovery.
#[utoipa::path(
    post,
    path = "/api/scan/stop",
    tag = "scan",
    operation_id = "stopScan",
    summary = "Stop scanning",
    responses(
        (status = 200, description = "Scan stopped", body = ScanStatusResponse)
    )
)]
pub async fn stop_scan(State(state): State<SharedState>) -> Json<ScanStatusResponse> {
    state.registry.stop_scan();
    Json(status(&state))
}

/// List discovered devices.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "scan",
    operation_id = "listDevices",
    summary = "List discovered devices",
    description = "Returns every device reported by a scan since startup with \
        its latest name, RSSI and connectable flag.",
    responses(
        (status = 200, description = "Device list", body = DevicesResponse)
    )
)]
pub async fn list_devices(State(state): State<SharedState>) -> Json<DevicesResponse> {
    Json(DevicesResponse {
        devices: state.devices.snapshot(),
        scanning: state.registry.is_scanning(),
        listed_at_utc: Utc::now().to_rfc3339(),
    })
}

fn status(state: &SharedState) -> ScanStatusResponse {
    ScanStatusResponse {
        scanning: state.registry.is_scanning(),
        devices_seen: state.devices.snapshot().len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devices_response_serialization() {
        let mut device = Device::new("aa:bb:cc:dd:ee:ff").unwrap();
        device.rssi = Some(-61);
        let response = DevicesResponse {
            devices: vec![device],
            scanning: true,
            listed_at_utc: "2025-01-15T03:30:00Z".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["devices"][0]["address"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(json["devices"][0]["rssi"], -61);
        assert_eq!(json["devices"][0]["state"], "DISCONNECTED");
    }
}
