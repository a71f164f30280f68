use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use super::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    Json(json!({
        "status": "healthy",
        "timestamp": timestamp,
        "version": env!("CARGO_PKG_VERSION"),
        "service": "lab-orchestrator",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "reconciler_running": state.browser.is_running(),
    }))
}
