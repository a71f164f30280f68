// ABOUTME: Row types and status enums for every persisted entity
// ABOUTME: Status enums round-trip through their lowercase text column values

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            #[allow(clippy::should_implement_trait)]
            pub fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(StorageError::InvalidStatus(s.to_string())),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(SessionStatus {
    Pooled => "pooled",
    Running => "running",
    Deleting => "deleting",
});

text_enum!(DependencyCondition {
    Started => "started",
    Healthy => "healthy",
});

text_enum!(ContainerStatus {
    Starting => "starting",
    Running => "running",
    Stopped => "stopped",
    Error => "error",
});

text_enum!(DesiredState {
    Running => "running",
    Stopped => "stopped",
});

text_enum!(ActualState {
    Pending => "pending",
    Starting => "starting",
    Running => "running",
    Stopping => "stopping",
    Stopped => "stopped",
    Error => "error",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub status: SessionStatus,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Project-scoped container template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub command: Option<Vec<String>>,
    /// Path inside the container where the session workspace is mounted.
    pub workspace_mount: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewContainerDefinition {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub command: Option<Vec<String>>,
    pub workspace_mount: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerPort {
    pub container_id: String,
    pub port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerEnvVar {
    pub container_id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerDependency {
    pub container_id: String,
    pub depends_on_container_id: String,
    pub condition: DependencyCondition,
}

/// A definition together with its outgoing dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerWithDependencies {
    pub definition: ContainerDefinition,
    pub depends_on: Vec<ContainerDependency>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContainer {
    pub id: String,
    pub session_id: String,
    pub container_id: String,
    pub runtime_id: Option<String>,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSessionState {
    pub session_id: String,
    pub desired_state: DesiredState,
    pub actual_state: ActualState,
    pub stream_port: Option<u16>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Optional column changes applied alongside an actual-state transition.
/// `None` leaves a column untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActualStateUpdate {
    pub stream_port: Option<Option<u16>>,
    pub retry_count: Option<u32>,
    pub error_message: Option<Option<String>>,
}

impl ActualStateUpdate {
    pub fn stream_port(mut self, port: Option<u16>) -> Self {
        self.stream_port = Some(port);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }
}
