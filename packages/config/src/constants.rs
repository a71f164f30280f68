// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names read by the orchestrator

// Process
pub const LAB_DATABASE_URL: &str = "LAB_DATABASE_URL";
pub const LAB_BIND_ADDR: &str = "LAB_BIND_ADDR";
pub const DATABASE_URL: &str = "DATABASE_URL"; // Fallback

// Browser daemon
pub const BROWSER_API_URL: &str = "BROWSER_API_URL";
pub const API_INTERNAL_URL: &str = "API_INTERNAL_URL";
pub const RECONCILE_INTERVAL_MS: &str = "RECONCILE_INTERVAL_MS";
pub const BROWSER_CLEANUP_DELAY_MS: &str = "BROWSER_CLEANUP_DELAY_MS";
pub const MAX_DAEMON_RETRIES: &str = "MAX_DAEMON_RETRIES";
pub const AGENT_BROWSER_STREAM_PORT: &str = "AGENT_BROWSER_STREAM_PORT";
pub const DAEMON_HEALTH_TIMEOUT_MS: &str = "DAEMON_HEALTH_TIMEOUT_MS";

// Pool
pub const POOL_SIZE: &str = "POOL_SIZE";
pub const POOL_RECONCILE_INTERVAL_MS: &str = "POOL_RECONCILE_INTERVAL_MS";
pub const POOL_BACKOFF_BASE_MS: &str = "POOL_BACKOFF_BASE_MS";
pub const POOL_BACKOFF_MAX_MS: &str = "POOL_BACKOFF_MAX_MS";
pub const POOL_RECONCILIATION_TIMEOUT_MS: &str = "POOL_RECONCILIATION_TIMEOUT_MS";

// Logs
pub const LOG_BUFFER_SIZE: &str = "LOG_BUFFER_SIZE";
pub const LOG_LINES_PER_SECOND: &str = "LOG_LINES_PER_SECOND";

// Containers
pub const COMMAND_TIMEOUT_MS: &str = "COMMAND_TIMEOUT_MS";
pub const CONTAINER_HEALTH_TIMEOUT_MS: &str = "CONTAINER_HEALTH_TIMEOUT_MS";
pub const WORKSPACES_ROOT: &str = "WORKSPACES_ROOT";
pub const SIDECAR_AGENT_IMAGE: &str = "SIDECAR_AGENT_IMAGE";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
