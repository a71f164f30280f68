// ABOUTME: Orchestrator settings loaded from the environment
// ABOUTME: Intervals, retry caps, pool sizing, log limits and collaborator URLs in one struct

use crate::constants::*;
use crate::env::{env_millis, env_optional, env_or, env_string_with_fallback, env_validated};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid bind address '{0}'")]
    InvalidBindAddr(String),
    #[error("{var} must be an http(s) URL, got '{value}'")]
    InvalidUrl { var: &'static str, value: String },
}

/// Everything the orchestration core reads from its environment.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub database_url: String,
    pub bind_addr: SocketAddr,

    // Browser daemon
    pub browser_api_url: String,
    pub api_internal_url: String,
    pub reconcile_interval: Duration,
    pub cleanup_delay: Duration,
    pub max_daemon_retries: u32,
    pub base_stream_port: u16,
    pub daemon_health_timeout: Duration,

    // Pool
    pub pool_size: usize,
    pub pool_reconcile_interval: Duration,
    pub pool_backoff_base: Duration,
    pub pool_backoff_max: Duration,
    pub pool_reconcile_timeout: Duration,

    // Logs
    pub log_buffer_size: usize,
    pub log_lines_per_second: u32,

    // Containers
    pub command_timeout: Duration,
    pub container_health_timeout: Duration,
    pub workspaces_root: String,
    pub sidecar_agent_image: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://lab.db".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            browser_api_url: "http://browser:3002".to_string(),
            api_internal_url: "http://api:3001".to_string(),
            reconcile_interval: Duration::from_millis(5000),
            cleanup_delay: Duration::from_millis(10_000),
            max_daemon_retries: 3,
            base_stream_port: 9223,
            daemon_health_timeout: Duration::from_millis(2000),
            pool_size: 0,
            pool_reconcile_interval: Duration::from_millis(30_000),
            pool_backoff_base: Duration::from_millis(1000),
            pool_backoff_max: Duration::from_millis(30_000),
            pool_reconcile_timeout: Duration::from_millis(60_000),
            log_buffer_size: 1000,
            log_lines_per_second: 100,
            command_timeout: Duration::from_millis(30_000),
            container_health_timeout: Duration::from_millis(60_000),
            workspaces_root: "/workspaces".to_string(),
            sidecar_agent_image: None,
        }
    }
}

impl OrchestratorSettings {
    /// Load a `.env` file if present, then read settings from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_raw = env_or(LAB_BIND_ADDR, defaults.bind_addr.to_string());
        let bind_addr = bind_raw
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidBindAddr(bind_raw.clone()))?;

        let browser_api_url = env_or(BROWSER_API_URL, defaults.browser_api_url.clone());
        validate_url(BROWSER_API_URL, &browser_api_url)?;
        let api_internal_url = env_or(API_INTERNAL_URL, defaults.api_internal_url.clone());
        validate_url(API_INTERNAL_URL, &api_internal_url)?;

        let pool_backoff_base = env_millis(POOL_BACKOFF_BASE_MS, 1000, 1);
        let pool_backoff_max = env_millis(POOL_BACKOFF_MAX_MS, 30_000, 1).max(pool_backoff_base);

        Ok(Self {
            database_url: env_string_with_fallback(
                LAB_DATABASE_URL,
                DATABASE_URL,
                &defaults.database_url,
            ),
            bind_addr,
            browser_api_url: browser_api_url.trim_end_matches('/').to_string(),
            api_internal_url: api_internal_url.trim_end_matches('/').to_string(),
            reconcile_interval: env_millis(RECONCILE_INTERVAL_MS, 5000, 100),
            cleanup_delay: env_millis(BROWSER_CLEANUP_DELAY_MS, 10_000, 0),
            max_daemon_retries: env_or(MAX_DAEMON_RETRIES, defaults.max_daemon_retries),
            base_stream_port: env_validated(AGENT_BROWSER_STREAM_PORT, 9223u16, |p| {
                *p > 0 && *p < u16::MAX
            }),
            daemon_health_timeout: env_millis(DAEMON_HEALTH_TIMEOUT_MS, 2000, 100),
            pool_size: env_or(POOL_SIZE, defaults.pool_size),
            pool_reconcile_interval: env_millis(POOL_RECONCILE_INTERVAL_MS, 30_000, 1000),
            pool_backoff_base,
            pool_backoff_max,
            pool_reconcile_timeout: env_millis(POOL_RECONCILIATION_TIMEOUT_MS, 60_000, 1000),
            log_buffer_size: env_validated(LOG_BUFFER_SIZE, defaults.log_buffer_size, |v| *v > 0),
            log_lines_per_second: env_validated(
                LOG_LINES_PER_SECOND,
                defaults.log_lines_per_second,
                |v| *v > 0,
            ),
            command_timeout: env_millis(COMMAND_TIMEOUT_MS, 30_000, 100),
            container_health_timeout: env_millis(CONTAINER_HEALTH_TIMEOUT_MS, 60_000, 100),
            workspaces_root: env_or(WORKSPACES_ROOT, defaults.workspaces_root),
            sidecar_agent_image: env_optional(SIDECAR_AGENT_IMAGE),
        })
    }

    /// URL the browser daemon should POST to once a session's browser is ready.
    pub fn readiness_callback_url(&self) -> String {
        format!("{}/internal/browser-ready", self.api_internal_url)
    }
}

fn validate_url(var: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl {
            var,
            value: value.to_string(),
        })
    }
}
