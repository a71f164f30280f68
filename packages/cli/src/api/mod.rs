use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use lab_orchestrator::BrowserSessionService;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::middleware::{create_panic_handler, rate_limit_middleware, RateLimitConfig, RateLimitLayer};

pub mod health;
pub mod readiness;

#[derive(Clone)]
pub struct AppState {
    pub browser: BrowserSessionService,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(browser: BrowserSessionService) -> Self {
        Self {
            browser,
            started_at: Instant::now(),
        }
    }
}

pub fn create_router(state: AppState, rate_limit: RateLimitConfig) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/internal/browser-ready", post(readiness::browser_ready))
        .with_state(state)
        .layer(from_fn_with_state(
            RateLimitLayer::new(rate_limit),
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(create_panic_handler())
}
