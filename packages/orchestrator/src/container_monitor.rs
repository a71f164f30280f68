// ABOUTME: Follows the runtime's container event stream and mirrors it into session container rows
// ABOUTME: Events become status transitions on a channel; a single consumer applies them in order

use futures::StreamExt;
use lab_sandbox::{ContainerEvent, SandboxProvider};
use lab_storage::{ContainerStatus, Storage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::logs::{LogMonitor, TrackedContainer};
use crate::publisher::{Channel, Publisher};

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Status implied by an engine event, if any.
pub fn map_event(event: &ContainerEvent) -> Option<ContainerStatus> {
    match event.action.as_str() {
        "start" => Some(ContainerStatus::Running),
        "stop" | "die" | "kill" => Some(ContainerStatus::Stopped),
        "restart" => Some(ContainerStatus::Starting),
        "oom" => Some(ContainerStatus::Error),
        action if action.starts_with("health_status") => {
            let unhealthy = action.contains("unhealthy")
                || event
                    .attributes
                    .get("health_status")
                    .is_some_and(|s| s == "unhealthy");
            unhealthy.then_some(ContainerStatus::Error)
        }
        _ => None,
    }
}

pub fn next_retry_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RETRY_DELAY)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Transition {
    runtime_id: String,
    status: ContainerStatus,
}

#[derive(Clone)]
pub struct ContainerMonitor {
    storage: Storage,
    provider: Arc<dyn SandboxProvider>,
    publisher: Arc<dyn Publisher>,
    logs: LogMonitor,
    initial_retry_delay: Duration,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ContainerMonitor {
    pub fn new(
        storage: Storage,
        provider: Arc<dyn SandboxProvider>,
        publisher: Arc<dyn Publisher>,
        logs: LogMonitor,
    ) -> Self {
        Self {
            storage,
            provider,
            publisher,
            logs,
            initial_retry_delay: INITIAL_RETRY_DELAY,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Sync persisted statuses with the runtime, then follow its event stream.
    pub async fn start(&self) {
        if !self.tasks().is_empty() {
            return;
        }

        info!("Starting container monitor");
        match self.sync_statuses().await {
            Ok(changed) => debug!(changed, "Container statuses synced"),
            Err(e) => error!("Failed to sync container statuses: {}", e),
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let provider = self.provider.clone();
        let delay = self.initial_retry_delay;
        let reader = tokio::spawn(pump_events(provider, tx, delay));

        let monitor = self.clone();
        let consumer = tokio::spawn(async move {
            while let Some(transition) = rx.recv().await {
                if let Err(e) = monitor.apply(&transition.runtime_id, transition.status).await {
                    warn!(runtime_id = %transition.runtime_id, "Failed to apply container event: {}", e);
                }
            }
        });

        self.tasks().extend([reader, consumer]);
    }

    pub fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks().drain(..).collect();
        if !tasks.is_empty() {
            info!("Stopping container monitor");
        }
        for task in tasks {
            task.abort();
        }
    }

    /// Compare every active session container against the runtime. Containers the
    /// runtime no longer knows are marked stopped. Returns how many rows changed.
    pub async fn sync_statuses(&self) -> Result<usize> {
        let containers = self.storage.list_session_containers_with_runtime().await?;
        let mut changed = 0;

        for container in containers {
            if !matches!(
                container.status,
                ContainerStatus::Starting | ContainerStatus::Running
            ) {
                continue;
            }
            let Some(runtime_id) = container.runtime_id.as_deref() else {
                continue;
            };

            let actual = match self.provider.inspect_container(runtime_id).await {
                Ok(inspect) if inspect.state.is_running() => ContainerStatus::Running,
                Ok(_) => ContainerStatus::Stopped,
                Err(e) if e.is_not_found() => ContainerStatus::Stopped,
                Err(e) => {
                    warn!(runtime_id, "Failed to inspect container during sync: {}", e);
                    continue;
                }
            };

            if actual != container.status {
                self.storage
                    .update_session_container_status(&container.id, actual)
                    .await?;
                self.publish_update(&container.session_id, &container.id, actual);
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Persist a transition for the container with `runtime_id`. Returns false when it
    /// does not belong to any session.
    pub async fn apply(&self, runtime_id: &str, status: ContainerStatus) -> Result<bool> {
        let Some(container) = self
            .storage
            .update_session_container_status_by_runtime_id(runtime_id, status)
            .await?
        else {
            return Ok(false);
        };

        debug!(
            session_id = %container.session_id,
            container_id = %container.id,
            %status,
            "Container status changed"
        );
        self.publish_update(&container.session_id, &container.id, status);

        match status {
            ContainerStatus::Running => {
                self.logs.start_tracking(TrackedContainer {
                    session_id: container.session_id.clone(),
                    container_id: container.id.clone(),
                    runtime_id: runtime_id.to_string(),
                    hostname: None,
                });
            }
            ContainerStatus::Stopped | ContainerStatus::Error => {
                self.logs.stop_tracking(&container.session_id, &container.id);
            }
            ContainerStatus::Starting => {}
        }
        Ok(true)
    }

    fn publish_update(&self, session_id: &str, container_id: &str, status: ContainerStatus) {
        self.publisher.publish_delta(
            Channel::SessionContainers,
            session_id,
            serde_json::json!({
                "type": "update",
                "container": { "id": container_id, "status": status.as_str() },
            }),
        );
    }
}

async fn pump_events(
    provider: Arc<dyn SandboxProvider>,
    tx: mpsc::UnboundedSender<Transition>,
    initial_delay: Duration,
) {
    let mut delay = initial_delay;
    loop {
        match provider.container_events().await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    match event {
                        Ok(event) => {
                            delay = initial_delay;
                            let Some(status) = map_event(&event) else {
                                continue;
                            };
                            let transition = Transition {
                                runtime_id: event.runtime_id,
                                status,
                            };
                            if tx.send(transition).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Container event stream failed: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Failed to open container event stream: {}", e),
        }

        warn!("Reconnecting to container events in {:?}", delay);
        tokio::time::sleep(delay).await;
        delay = next_retry_delay(delay);
    }
}
