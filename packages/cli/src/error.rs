// ABOUTME: Error type returned by HTTP handlers and its JSON response shape
// ABOUTME: Internal details are logged with a request id and never sent to callers

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: u64 },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorDetail,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl AppError {
    fn to_status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::RateLimitExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXCEEDED")
            }
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    fn to_user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => format!("Validation failed: {}", msg),
            AppError::RateLimitExceeded { .. } => {
                "Too many requests. Please try again later".to_string()
            }
            AppError::Unavailable(_) => "The orchestrator is shutting down".to_string(),
            AppError::Internal(_) => "An internal server error occurred".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status_code, error_code) = self.to_status_and_code();

        match &self {
            AppError::Internal(err) => {
                error!(request_id = %request_id, error = %err, "Internal server error occurred");
            }
            AppError::Unavailable(reason) => {
                warn!(request_id = %request_id, reason = %reason, "Request refused");
            }
            _ => {}
        }

        let retry_after = match &self {
            AppError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        };

        let body = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: error_code.to_string(),
                message: self.to_user_message(),
                retry_after,
            },
            request_id,
        };

        let mut response = (status_code, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::Validation("x".into()).to_status_and_code().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::RateLimitExceeded { retry_after: 1 }.to_status_and_code().0,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Unavailable("stopping".into()).to_status_and_code().0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err = AppError::Internal(anyhow::anyhow!("database password is hunter2"));
        assert!(!err.to_user_message().contains("hunter2"));
    }

    #[test]
    fn test_rate_limit_sets_retry_after_header() {
        let response = AppError::RateLimitExceeded { retry_after: 7 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "7");
    }
}
