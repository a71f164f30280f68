// ABOUTME: Runtime provider trait for container engines used by session orchestration
// ABOUTME: Covers container lifecycle, images, networks, log streams and engine events

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub env_vars: HashMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    /// Network joined at creation time, with DNS aliases on that network.
    pub network: Option<NetworkAttachment>,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone)]
pub struct PortMapping {
    pub container_port: u16,
    /// `None` lets the engine choose a free host port.
    pub host_port: Option<u16>,
    pub protocol: String,
}

#[derive(Debug, Clone)]
pub struct NetworkAttachment {
    pub network: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

impl ContainerState {
    pub fn parse(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    /// Engines report `none` (or nothing) when no health check is configured.
    pub fn parse(status: &str) -> Option<Self> {
        match status.to_lowercase().as_str() {
            "starting" => Some(Self::Starting),
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }
}

/// Result of inspecting a container.
#[derive(Debug, Clone)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub health: Option<HealthStatus>,
    pub ports: HashMap<u16, u16>, // container_port -> host_port
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct LogStreamOptions {
    /// Number of historical lines to emit before following; `None` means all.
    pub tail: Option<usize>,
    pub follow: bool,
}

/// Container output. Dropping the stream closes the underlying engine connection.
pub type LogStream = BoxStream<'static, Result<LogChunk>>;

#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// A container lifecycle event reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerEvent {
    pub runtime_id: String,
    pub action: String,
    pub attributes: HashMap<String, String>,
}

pub type EventStream = BoxStream<'static, Result<ContainerEvent>>;

/// Interface over a container engine.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check if the engine is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Create (but do not start) a container, returning the engine id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stop a container. Stopping an already stopped container succeeds.
    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    /// Remove a container. Removing a missing container succeeds.
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspect>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn stream_logs(&self, container_id: &str, options: LogStreamOptions) -> Result<LogStream>;

    /// Create a bridge network, returning its name
    async fn create_network(&self, name: &str, labels: HashMap<String, String>)
        -> Result<String>;

    /// Remove a network. Removing a missing network succeeds.
    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: Vec<String>,
    ) -> Result<()>;

    async fn disconnect_network(&self, network: &str, container_id: &str, force: bool)
        -> Result<()>;

    /// Networks carrying the given label key (any value)
    async fn list_networks(&self, label: &str) -> Result<Vec<NetworkInfo>>;

    /// Continuous stream of container events
    async fn container_events(&self) -> Result<EventStream>;
}

/// Make sure `image` is present locally, pulling it when missing.
/// Returns `true` when a pull happened.
pub async fn ensure_image(provider: &dyn Provider, image: &str) -> Result<bool> {
    if provider.image_exists(image).await? {
        return Ok(false);
    }
    tracing::info!("Image {} not present locally, pulling", image);
    provider.pull_image(image).await?;
    Ok(true)
}
