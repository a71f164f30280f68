// ABOUTME: Sandbox session orchestration: dependency-ordered startup, warm pools,
// ABOUTME: browser daemon reconciliation, container event tracking and log streaming

pub mod browser;
pub mod container_monitor;
pub mod error;
pub mod inflight;
pub mod lifecycle;
pub mod logs;
pub mod orchestrator;
pub mod pool;
pub mod preparer;
pub mod publisher;
pub mod sidecar;

#[cfg(test)]
mod testing;

pub use browser::{
    BrowserConfig, BrowserSessionService, BrowserSessionSnapshot, DaemonController, DaemonError,
    HttpDaemonController, SessionWarmup,
};
pub use container_monitor::ContainerMonitor;
pub use error::{OrchestratorError, Result, SharedError};
pub use inflight::InFlight;
pub use lifecycle::{CleanupReport, LifecycleConfig, SessionLifecycle};
pub use logs::{LogConfig, LogMonitor, SessionLogSnapshot};
pub use orchestrator::Orchestrator;
pub use pool::{PoolConfig, PoolManager, PoolSnapshot};
pub use preparer::{resolve_start_order, validate_dependencies, ContainerPreparer, PreparedSession};
pub use publisher::{BroadcastPublisher, Channel, Message, MessageKind, Publisher};
pub use sidecar::{ContainerSidecar, SidecarProvider};
