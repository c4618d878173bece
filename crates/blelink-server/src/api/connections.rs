//! Connection endpoints.
//!
//! Each connection is addressed by the peripheral's hardware address. The
//! read endpoint waits for the request callback, so its latency is the GATT
//! round trip plus any queued requests ahead of it.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use blelink_core::{BleError, Connection, ConnectionState, RequestBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// One connection as seen by the API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "address": "AA:BB:CC:DD:EE:FF",
    "name": "Sensor-01",
    "state": "MTU_SUCCESS",
    "ready": true,
    "rssi_dbm": -58,
    "mtu": 503,
    "auto_reconnect": true
}))]
pub struct ConnectionSummary {
    /// Hardware address.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub address: String,

    /// Last known name.
    #[schema(example = "Sensor-01")]
    pub name: Option<String>,

    /// Connection state.
    pub state: ConnectionState,

    /// Whether requests execute right away.
    #[schema(example = true)]
    pub ready: bool,

    /// Last known signal strength in dBm.
    #[schema(example = -58)]
    pub rssi_dbm: Option<i16>,

    /// Current ATT MTU.
    #[schema(example = 503)]
    pub mtu: u16,

    /// Whether link loss triggers a reconnect.
    #[schema(example = true)]
    pub auto_reconnect: bool,
}

impl From<&Connection> for ConnectionSummary {
    fn from(connection: &Connection) -> Self {
        let device = connection.device();
        Self {
            address: device.address().to_string(),
            name: device.name.clone(),
            state: device.state,
            ready: device.state.is_ready(),
            rssi_dbm: device.rssi,
            mtu: connection.mtu(),
            auto_reconnect: connection.is_auto_reconnect_enabled(),
        }
    }
}

/// Connect request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "address": "AA:BB:CC:DD:EE:FF",
    "auto_reconnect": true,
    "connect_timeout_ms": 10000
}))]
pub struct ConnectRequest {
    /// Hardware address of the peripheral.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub address: String,

    /// Override the configured reconnect behaviour.
    #[serde(default)]
    pub auto_reconnect: Option<bool>,

    /// Override the configured connect timeout.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

/// Telemetry write request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "payload_hex": "a1b2c3" }))]
pub struct WriteRequest {
    /// Payload as hex.
    #[schema(example = "a1b2c3")]
    pub payload_hex: String,
}

/// Telemetry write result.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WriteResponse {
    /// `false` if the connection was not ready or the channel is missing.
    #[schema(example = true)]
    pub accepted: bool,
}

/// Characteristic read request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "service": "6e400001-b5a3-f393-e0a9-e50e24dcca9e",
    "characteristic": "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
}))]
pub struct ReadRequest {
    /// Service UUID.
    pub service: Uuid,

    /// Characteristic UUID.
    pub characteristic: Uuid,

    /// Per-request timeout; the connection default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Characteristic read result.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReadResponse {
    /// Value as hex.
    #[schema(example = "0102")]
    pub value_hex: String,
}

/// Creates the connections router, mounted at `/api/connections`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_connections).post(create_connection))
        .route(
            "/{address}",
            get(get_connection).delete(release_connection),
        )
        .route("/{address}/disconnect", post(disconnect))
        .route("/{address}/reconnect", post(reconnect))
        .route("/{address}/write", post(write_telemetry))
        .route("/{address}/read", post(read_characteristic))
}

fn require(state: &SharedState, address: &str) -> ApiResult<Connection> {
    state
        .registry
        .connection(address)
        .ok_or_else(|| BleError::ConnectionNotFound(address.to_string()).into())
}

// ============================================================================
// Handlers
// ============================================================================

/// List connections.
#[utoipa::path(
    get,
    path = "/api/connections",
    tag = "connections",
    operation_id = "listConnections",
    summary = "List live connections",
    responses(
        (status = 200, description = "Connections in connect order", body = Vec<ConnectionSummary>)
    )
)]
pub async fn list_connections(State(state): State<SharedState>) -> Json<Vec<ConnectionSummary>> {
    Json(
        state
            .registry
            .connections()
            .iter()
            .map(ConnectionSummary::from)
            .collect(),
    )
}

/// Connect to a peripheral.
#[utoipa::path(
    post,
    path = "/api/connections",
    tag = "connections",
    operation_id = "createConnection",
    summary = "Connect to a peripheral",
    description = "Starts the connect sequence and returns immediately. Poll \
        the connection or watch the event log for `MTU_SUCCESS`. A second \
        connect for an address with a live connection is rejected.",
    request_body = ConnectRequest,
    responses(
        (status = 201, description = "Connect sequence started", body = ConnectionSummary),
        (status = 400, description = "Malformed address", body = ErrorResponse),
        (status = 409, description = "Connection already exists", body = ErrorResponse),
        (status = 422, description = "Device is not connectable", body = ErrorResponse)
    )
)]
pub async fn create_connection(
    State(state): State<SharedState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<(StatusCode, Json<ConnectionSummary>)> {
    let mut config = state.registry.default_configuration();
    if let Some(auto) = request.auto_reconnect {
        config = config.with_auto_reconnect(auto);
    }
    if let Some(ms) = request.connect_timeout_ms {
        if ms == 0 {
            return Err(ApiError::bad_request(
                "INVALID_TIMEOUT",
                "connect_timeout_ms must be positive",
            ));
        }
        config = config.with_connect_timeout(Duration::from_millis(ms));
    }

    let connection = state
        .registry
        .connect_address(&request.address, config, None)?;
    info!(address = %connection.address(), "connection created via API");
    Ok((StatusCode::CREATED, Json(ConnectionSummary::from(&connection))))
}

/// Get one connection.
#[utoipa::path(
    get,
    path = "/api/connections/{address}",
    tag = "connections",
    operation_id = "getConnection",
    params(("address" = String, Path, description = "Hardware address")),
    responses(
        (status = 200, description = "Connection", body = ConnectionSummary),
        (status = 404, description = "No such connection", body = ErrorResponse)
    )
)]
pub async fn get_connection(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<ConnectionSummary>> {
    let connection = require(&state, &address)?;
    Ok(Json(ConnectionSummary::from(&connection)))
}

/// Disconnect without reconnecting.
#[utoipa::path(
    post,
    path = "/api/connections/{address}/disconnect",
    tag = "connections",
    operation_id = "disconnect",
    params(("address" = String, Path, description = "Hardware address")),
    responses(
        (status = 202, description = "Disconnect requested"),
        (status = 404, description = "No such connection", body = ErrorResponse)
    )
)]
pub async fn disconnect(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<StatusCode> {
    state.registry.disconnect(&address)?;
    Ok(StatusCode::ACCEPTED)
}

/// Restart the connect sequence.
#[utoipa::path(
    post,
    path = "/api/connections/{address}/reconnect",
    tag = "connections",
    operation_id = "reconnect",
    params(("address" = String, Path, description = "Hardware address")),
    responses(
        (status = 202, description = "Reconnect requested, or already ready"),
        (status = 404, description = "No such connection", body = ErrorResponse)
    )
)]
pub async fn reconnect(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<StatusCode> {
    state.registry.reconnect(&address)?;
    Ok(StatusCode::ACCEPTED)
}

/// Release a connection.
#[utoipa::path(
    delete,
    path = "/api/connections/{address}",
    tag = "connections",
    operation_id = "releaseConnection",
    summary = "Release a connection",
    description = "Fails every pending request, closes the link and forgets \
        the connection. The address can be connected again afterwards.",
    params(("address" = String, Path, description = "Hardware address")),
    responses(
        (status = 204, description = "Released"),
        (status = 404, description = "No such connection", body = ErrorResponse)
    )
)]
pub async fn release_connection(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<StatusCode> {
    state.registry.release(&address)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Write to the telemetry channel.
#[utoipa::path(
    post,
    path = "/api/connections/{address}/write",
    tag = "connections",
    operation_id = "writeTelemetry",
    params(("address" = String, Path, description = "Hardware address")),
    request_body = WriteRequest,
    responses(
        (status = 200, description = "Whether the write was queued", body = WriteResponse),
        (status = 400, description = "Payload is not hex", body = ErrorResponse),
        (status = 404, description = "No such connection", body = ErrorResponse)
    )
)]
pub async fn write_telemetry(
    State(state): State<SharedState>,
    Path(address): Path<String>,
    Json(request): Json<WriteRequest>,
) -> ApiResult<Json<WriteResponse>> {
    let payload = hex::decode(request.payload_hex.trim())
        .map_err(|e| ApiError::bad_request("INVALID_HEX", e.to_string()))?;
    if payload.is_empty() {
        return Err(ApiError::bad_request("EMPTY_PAYLOAD", "payload_hex is empty"));
    }
    let connection = require(&state, &address)?;
    let accepted = connection.write_characteristic(&payload);
    debug!(address = %connection.address(), bytes = payload.len(), accepted, "telemetry write");
    Ok(Json(WriteResponse { accepted }))
}

/// Read a characteristic.
#[utoipa::path(
    post,
    path = "/api/connections/{address}/read",
    tag = "connections",
    operation_id = "readCharacteristic",
    summary = "Read a characteristic",
    description = "Queues a read and waits for its result. Requests submitted \
        before the connection is ready wait for the connect sequence.",
    params(("address" = String, Path, description = "Hardware address")),
    request_body = ReadRequest,
    responses(
        (status = 200, description = "Value read", body = ReadResponse),
        (status = 404, description = "No such connection or characteristic", body = ErrorResponse),
        (status = 502, description = "Peripheral returned an error", body = ErrorResponse),
        (status = 503, description = "Link lost", body = ErrorResponse),
        (status = 504, description = "Peripheral did not answer", body = ErrorResponse)
    )
)]
pub async fn read_characteristic(
    State(state): State<SharedState>,
    Path(address): Path<String>,
    Json(request): Json<ReadRequest>,
) -> ApiResult<Json<ReadResponse>> {
    let connection = require(&state, &address)?;

    let (tx, rx) = oneshot::channel();
    let mut builder = RequestBuilder::read_characteristic(request.service, request.characteristic)
        .tag("api")
        .callback(move |_, result| {
            let _ = tx.send(result);
        });
    if let Some(ms) = request.timeout_ms.filter(|ms| *ms > 0) {
        builder = builder.timeout(Duration::from_millis(ms));
    }
    connection.execute(builder.build()?);

    let output = rx.await.map_err(|_| ApiError::InternalError {
        error_code: "CALLBACK_DROPPED".to_string(),
        message: "request finished without a result".to_string(),
        details: None,
    })??;

    Ok(Json(ReadResponse {
        value_hex: output.value().map(hex::encode).unwrap_or_default(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_defaults() {
        let request: ConnectRequest =
            serde_json::from_str(r#"{"address":"AA:BB:CC:DD:EE:FF"}"#).unwrap();
        assert_eq!(request.address, "AA:BB:CC:DD:EE:FF");
        assert!(request.auto_reconnect.is_none());
        assert!(request.connect_timeout_ms.is_none());
    }

    #[test]
    fn test_read_request_parses_uuids() {
        let request: ReadRequest = serde_json::from_str(
            r#"{"service":"6e400001-b5a3-f393-e0a9-e50e24dcca9e",
                "characteristic":"6e400003-b5a3-f393-e0a9-e50e24dcca9e"}"#,
        )
        .unwrap();
        assert_eq!(
            request.characteristic.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert!(request.timeout_ms.is_none());
    }

    #[test]
    fn test_summary_serialization() {
        let summary = ConnectionSummary {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            name: None,
            state: ConnectionState::ScanningForReconnection,
            ready: false,
            rssi_dbm: None,
            mtu: 23,
            auto_reconnect: true,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["state"], "SCANNING_FOR_RECONNECTION");
        assert_eq!(json["mtu"], 23);
    }
}
