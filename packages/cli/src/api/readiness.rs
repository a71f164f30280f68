use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::AppState;
use crate::error::AppError;

/// Body the browser daemon posts once a session's browser can stream.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserReadyRequest {
    pub session_id: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

pub async fn browser_ready(
    State(state): State<AppState>,
    Json(request): Json<BrowserReadyRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let session_id = request.session_id.trim();
    if session_id.is_empty() {
        return Err(AppError::Validation("sessionId is required".to_string()));
    }

    debug!(session_id, port = ?request.port, ready = request.ready, "Browser readiness callback");
    if !state
        .browser
        .report_ready(session_id, request.port, request.ready)
    {
        return Err(AppError::Unavailable(
            "browser reconciler is not accepting reports".to_string(),
        ));
    }

    Ok((StatusCode::ACCEPTED, Json(json!({ "success": true }))))
}
