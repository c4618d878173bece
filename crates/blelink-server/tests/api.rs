//! Router tests against the simulated demo radio.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use blelink_core::{BleSettings, RadioStack, Registry, TelemetryChannel};
use blelink_server::api::create_router;
use blelink_server::demo::{self, DEMO_ADDRESS};
use blelink_server::state::{AppState, SharedState};
use serde_json::{json, Value};
use tokio_test::assert_ok;
use tower::ServiceExt;

fn app() -> (Router, SharedState) {
    let settings = BleSettings::default();
    let radio = demo::radio(&settings.telemetry);
    let registry = assert_ok!(Registry::builder(radio as Arc<dyn RadioStack>)
        .settings(settings)
        .build());
    let state = assert_ok!(AppState::new(registry));
    (create_router(Arc::clone(&state)), state)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = assert_ok!(app.clone().oneshot(request).await);
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_adapter() {
    let (app, _state) = app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["adapter"], "on");
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn test_unknown_connection_is_not_found() {
    let (app, _state) = app();
    let (status, body) = send(&app, "GET", "/api/connections/11:22:33:44:55:66", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "CONNECTION_NOT_FOUND");
}

#[tokio::test]
async fn test_malformed_address_is_rejected() {
    let (app, _state) = app();
    let (status, _) = send(
        &app,
        "POST",
        "/api/connections",
        Some(json!({ "address": "not-an-address" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(start_paused = true)]
async fn test_connect_then_read_through_the_api() {
    let (app, state) = app();

    let (status, body) = send(
        &app,
        "POST",
        "/api/connections",
        Some(json!({ "address": DEMO_ADDRESS })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["address"], DEMO_ADDRESS);

    let (status, _) = send(
        &app,
        "POST",
        "/api/connections",
        Some(json!({ "address": DEMO_ADDRESS })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let telemetry = TelemetryChannel::default();
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/connections/{DEMO_ADDRESS}/read"),
        Some(json!({
            "service": telemetry.service,
            "characteristic": telemetry.notify_characteristic,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value_hex"], "00");

    let (status, body) = send(
        &app,
        "GET",
        &format!("/api/connections/{}", DEMO_ADDRESS.to_lowercase()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "MTU_SUCCESS");
    assert_eq!(body["ready"], true);

    let (status, body) = send(&app, "GET", "/api/events?limit=500", None).await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["kind"].as_str())
        .collect();
    assert!(!kinds.is_empty());

    let (status, _) = send(
        &app,
        "DELETE",
        &format!("/api/connections/{DEMO_ADDRESS}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(state.registry.connection(DEMO_ADDRESS).is_none());
}

#[tokio::test]
async fn test_write_rejects_bad_hex() {
    let (app, _state) = app();
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/connections/{DEMO_ADDRESS}/write"),
        Some(json!({ "payload_hex": "zz" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_HEX");
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let (app, _state) = app();
    let (status, body) = send(&app, "GET", "/api/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "blelink API");
}
