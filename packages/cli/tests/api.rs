// ABOUTME: HTTP-level tests for the health probe and the browser readiness callback
// ABOUTME: Requests go through the full router, including rate limiting and error mapping

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use lab_cli::{create_router, middleware::RateLimitConfig, AppState};
use lab_orchestrator::{BroadcastPublisher, BrowserConfig, BrowserSessionService, HttpDaemonController};
use lab_storage::Storage;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn app(rate_limit: RateLimitConfig) -> Router {
    let storage = Storage::in_memory().await.unwrap();
    let browser = BrowserSessionService::new(
        storage,
        Arc::new(HttpDaemonController::new(
            "http://127.0.0.1:9",
            Duration::from_millis(100),
            Duration::from_millis(100),
        )),
        Arc::new(BroadcastPublisher::new(16)),
        BrowserConfig::default(),
    );
    create_router(AppState::new(browser), rate_limit)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn ready_request(body: Value) -> Request<Body> {
    Request::post("/internal/browser-ready")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_service() {
    let app = app(RateLimitConfig::default()).await;
    let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "lab-orchestrator");
    assert_eq!(body["reconciler_running"], false);
}

#[tokio::test]
async fn test_readiness_callback_is_accepted() {
    let app = app(RateLimitConfig::default()).await;
    let (status, body) = send(
        &app,
        ready_request(json!({ "sessionId": "ses_1", "port": 9224, "ready": true })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_readiness_defaults_ready_when_omitted() {
    let app = app(RateLimitConfig::default()).await;
    let (status, _) = send(&app, ready_request(json!({ "sessionId": "ses_1" }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_readiness_requires_session_id() {
    let app = app(RateLimitConfig::default()).await;
    let (status, body) = send(&app, ready_request(json!({ "sessionId": "  ", "ready": true }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn test_readiness_is_rate_limited() {
    let app = app(RateLimitConfig {
        internal_rpm: 10,
        burst_size: 1,
        ..Default::default()
    })
    .await;

    let (first, _) = send(&app, ready_request(json!({ "sessionId": "ses_1" }))).await;
    let (second, body) = send(&app, ready_request(json!({ "sessionId": "ses_1" }))).await;

    assert_eq!(first, StatusCode::ACCEPTED);
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
}
