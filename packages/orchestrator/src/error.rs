// ABOUTME: Error taxonomy for orchestration: structural, transient and aborted work
// ABOUTME: Shared errors let deduplicated in-flight tasks hand one failure to every waiter

use lab_sandbox::ProviderError;
use lab_storage::StorageError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::browser::DaemonError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Runtime error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Browser daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("Project {0} has no container definitions")]
    NoContainerDefinitions(String),

    #[error("Invalid container dependencies: {}", .0.join("; "))]
    InvalidDependencies(Vec<String>),

    #[error("Dependency cycle between containers: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Container {container_id} failed to start: {message}")]
    ContainerStart {
        container_id: String,
        message: String,
    },

    #[error("Container {container_id} not healthy after {timeout:?}")]
    HealthTimeout {
        container_id: String,
        timeout: Duration,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Task aborted: {0}")]
    TaskAborted(String),
}

impl OrchestratorError {
    /// Configuration problems that retrying cannot fix.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::NoContainerDefinitions(_) | Self::InvalidDependencies(_) | Self::DependencyCycle(_)
        )
    }
}

impl OrchestratorError {
    /// Owned copy of a structural error, for handing one on from a shared result.
    pub fn structural_copy(&self) -> Option<Self> {
        match self {
            Self::NoContainerDefinitions(project) => Some(Self::NoContainerDefinitions(project.clone())),
            Self::InvalidDependencies(problems) => Some(Self::InvalidDependencies(problems.clone())),
            Self::DependencyCycle(ids) => Some(Self::DependencyCycle(ids.clone())),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error handed to every caller sharing one in-flight task.
pub type SharedError = Arc<OrchestratorError>;
