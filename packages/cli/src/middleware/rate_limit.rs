use axum::{
    extract::{Request, State},
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{
    collections::HashMap,
    num::NonZeroU32,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

use crate::error::AppError;

type RateLimiterInstance = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>>;

/// Requests per minute allowed for each endpoint category
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub health_rpm: u32,
    /// Readiness callbacks; the daemon reports once per start so this is generous
    pub internal_rpm: u32,
    pub global_rpm: u32,
    /// Burst allowance in tenths of the per-minute rate
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_rpm: 120,
            internal_rpm: 600,
            global_rpm: 60,
            burst_size: 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum EndpointCategory {
    Health,
    Internal,
    Other,
}

impl EndpointCategory {
    fn as_str(self) -> &'static str {
        match self {
            EndpointCategory::Health => "health",
            EndpointCategory::Internal => "internal",
            EndpointCategory::Other => "other",
        }
    }
}

fn categorize_endpoint(path: &str) -> EndpointCategory {
    if path.starts_with("/internal/") {
        EndpointCategory::Internal
    } else if path.contains("/health") {
        EndpointCategory::Health
    } else {
        EndpointCategory::Other
    }
}

/// One shared limiter per endpoint category
#[derive(Clone)]
pub struct RateLimitLayer {
    config: RateLimitConfig,
    limiters: Arc<Mutex<HashMap<&'static str, RateLimiterInstance>>>,
}

impl RateLimitLayer {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn rpm_for(&self, category: EndpointCategory) -> u32 {
        match category {
            EndpointCategory::Health => self.config.health_rpm,
            EndpointCategory::Internal => self.config.internal_rpm,
            EndpointCategory::Other => self.config.global_rpm,
        }
    }

    fn limiter_for(&self, category: EndpointCategory) -> RateLimiterInstance {
        let mut limiters = match self.limiters.lock() {
            Ok(limiters) => limiters,
            Err(poisoned) => poisoned.into_inner(),
        };
        let rpm = self.rpm_for(category);
        limiters
            .entry(category.as_str())
            .or_insert_with(|| {
                let burst = (rpm * self.config.burst_size / 10).max(1);
                debug!(endpoint_category = %category.as_str(), rpm, burst, "Created rate limiter");
                Arc::new(RateLimiter::direct(
                    Quota::per_minute(NonZeroU32::new(rpm).unwrap_or(NonZeroU32::MIN))
                        .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN)),
                ))
            })
            .clone()
    }
}

pub async fn rate_limit_middleware(
    State(layer): State<RateLimitLayer>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !layer.config.enabled {
        return Ok(next.run(request).await);
    }

    let category = categorize_endpoint(request.uri().path());
    let limiter = layer.limiter_for(category);
    let rpm = layer.rpm_for(category);

    if limiter.check().is_err() {
        warn!(path = %request.uri().path(), endpoint_category = %category.as_str(), "Rate limit exceeded");
        let retry_after = (60 / rpm.max(1)).max(1) as u64;
        return Err(AppError::RateLimitExceeded { retry_after });
    }

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&rpm.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-ratelimit-limit"), value);
    }
    Ok(response)
}
