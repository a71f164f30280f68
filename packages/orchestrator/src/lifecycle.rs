// ABOUTME: Brings a session's containers up in dependency order and tears them down again
// ABOUTME: Partial startups are rolled back; initialization is deduplicated per session

use futures::future::join_all;
use lab_config::OrchestratorSettings;
use lab_sandbox::naming::{self, SESSION_LABEL};
use lab_sandbox::{
    ensure_image, ContainerSpec, ContainerState, HealthStatus, PortMapping, SandboxProvider,
    VolumeMount,
};
use lab_storage::{ContainerStatus, DependencyCondition, SessionContainer, SessionStatus, Storage};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::browser::BrowserSessionService;
use crate::error::{OrchestratorError, Result, SharedError};
use crate::inflight::{InFlight, SharedTask};
use crate::logs::{LogMonitor, TrackedContainer};
use crate::preparer::{ContainerPreparer, PreparedSession};
use crate::publisher::{Channel, Publisher};
use crate::sidecar::SidecarProvider;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Ceiling for a single runtime call
    pub command_timeout: Duration,
    /// How long a `healthy` dependency may take to report healthy
    pub health_timeout: Duration,
    pub health_poll_interval: Duration,
    pub stop_timeout_secs: u64,
}

impl LifecycleConfig {
    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self {
            command_timeout: settings.command_timeout,
            health_timeout: settings.container_health_timeout,
            health_poll_interval: Duration::from_millis(500),
            stop_timeout_secs: 10,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from_settings(&OrchestratorSettings::default())
    }
}

/// What a best-effort teardown managed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub containers_removed: usize,
    pub session_deleted: bool,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone)]
struct StartedContainer {
    container_id: String,
    row_id: String,
    runtime_id: String,
}

struct Inner {
    storage: Storage,
    provider: Arc<dyn SandboxProvider>,
    publisher: Arc<dyn Publisher>,
    preparer: ContainerPreparer,
    logs: LogMonitor,
    browser: Option<BrowserSessionService>,
    sidecars: Vec<Arc<dyn SidecarProvider>>,
    config: LifecycleConfig,
    initializing: InFlight<String, ()>,
}

#[derive(Clone)]
pub struct SessionLifecycle {
    inner: Arc<Inner>,
}

pub struct SessionLifecycleBuilder {
    storage: Storage,
    provider: Arc<dyn SandboxProvider>,
    publisher: Arc<dyn Publisher>,
    preparer: ContainerPreparer,
    logs: LogMonitor,
    browser: Option<BrowserSessionService>,
    sidecars: Vec<Arc<dyn SidecarProvider>>,
    config: LifecycleConfig,
}

impl SessionLifecycleBuilder {
    pub fn browser(mut self, browser: BrowserSessionService) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn sidecar(mut self, sidecar: Arc<dyn SidecarProvider>) -> Self {
        self.sidecars.push(sidecar);
        self
    }

    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SessionLifecycle {
        SessionLifecycle {
            inner: Arc::new(Inner {
                storage: self.storage,
                provider: self.provider,
                publisher: self.publisher,
                preparer: self.preparer,
                logs: self.logs,
                browser: self.browser,
                sidecars: self.sidecars,
                config: self.config,
                initializing: InFlight::new(),
            }),
        }
    }
}

impl SessionLifecycle {
    pub fn builder(
        storage: Storage,
        provider: Arc<dyn SandboxProvider>,
        publisher: Arc<dyn Publisher>,
        preparer: ContainerPreparer,
        logs: LogMonitor,
    ) -> SessionLifecycleBuilder {
        SessionLifecycleBuilder {
            storage,
            provider,
            publisher,
            preparer,
            logs,
            browser: None,
            sidecars: Vec::new(),
            config: LifecycleConfig::default(),
        }
    }

    /// Start (or join) initialization of a session and wait for it.
    pub async fn initialize_session(
        &self,
        session_id: &str,
        project_id: &str,
    ) -> std::result::Result<(), SharedError> {
        self.schedule_initialize_session(session_id, project_id).await
    }

    /// Start initialization in the background. A second call for the same session while
    /// one is running returns the running task.
    pub fn schedule_initialize_session(&self, session_id: &str, project_id: &str) -> SharedTask<()> {
        let lifecycle = self.clone();
        let session = session_id.to_string();
        let project = project_id.to_string();

        let (task, joined) = self
            .inner
            .initializing
            .run(session_id.to_string(), move || async move {
                let result = lifecycle.do_initialize(&session, &project).await;
                if let Err(e) = &result {
                    error!(session_id = %session, project_id = %project, "Session initialization failed: {}", e);
                }
                result
            });
        if joined {
            debug!(session_id, "Joined in-flight session initialization");
        }
        task
    }

    pub fn has_pending_initialization(&self, session_id: &str) -> bool {
        self.inner.initializing.contains(&session_id.to_string())
    }

    async fn engine<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = lab_sandbox::providers::Result<T>>,
    {
        let timeout = self.inner.config.command_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(OrchestratorError::Timeout {
                operation: operation.to_string(),
                timeout,
            }),
        }
    }

    async fn do_initialize(&self, session_id: &str, project_id: &str) -> Result<()> {
        let started_at = Instant::now();
        let prepared = self.inner.preparer.prepare(session_id, project_id).await?;

        let network = naming::network_name(session_id);
        self.engine(
            "create network",
            self.inner
                .provider
                .create_network(&network, naming::session_labels(session_id, project_id)),
        )
        .await?;

        let rows = match self.ensure_session_rows(&prepared).await {
            Ok(rows) => rows,
            Err(e) => {
                self.rollback(session_id, &network, &[]).await;
                return Err(e);
            }
        };

        let mut started: Vec<StartedContainer> = Vec::new();
        for level in &prepared.levels {
            let runtime_ids: HashMap<String, String> = started
                .iter()
                .map(|s| (s.container_id.clone(), s.runtime_id.clone()))
                .collect();

            let results = join_all(level.iter().map(|container_id| {
                self.start_container(&prepared, container_id, &rows, &network, &runtime_ids)
            }))
            .await;

            let mut failure = None;
            for (container_id, result) in level.iter().zip(results) {
                match result {
                    Ok(container) => started.push(container),
                    Err(e) => {
                        if let Some(row) = rows.get(container_id) {
                            if let Err(mark) = self
                                .inner
                                .storage
                                .update_session_container_status(&row.id, ContainerStatus::Error)
                                .await
                            {
                                warn!(session_id, container_id = %container_id, "Failed to mark container error: {}", mark);
                            }
                            self.publish_container(session_id, &row.id, ContainerStatus::Error);
                        }
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
            }

            if let Some(e) = failure {
                warn!(session_id, "Container startup failed, rolling back {} started containers", started.len());
                self.rollback(session_id, &network, &started).await;
                return Err(e);
            }
        }

        info!(
            session_id,
            project_id,
            containers = started.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Session containers started"
        );

        self.spawn_sidecars(session_id, project_id).await;
        Ok(())
    }

    async fn ensure_session_rows(
        &self,
        prepared: &PreparedSession,
    ) -> Result<HashMap<String, SessionContainer>> {
        let mut rows: HashMap<String, SessionContainer> = self
            .inner
            .storage
            .list_session_containers(&prepared.session_id)
            .await?
            .into_iter()
            .map(|row| (row.container_id.clone(), row))
            .collect();

        for container_id in prepared.levels.iter().flatten() {
            if !rows.contains_key(container_id) {
                let row = self
                    .inner
                    .storage
                    .create_session_container(
                        &prepared.session_id,
                        container_id,
                        ContainerStatus::Starting,
                    )
                    .await?;
                rows.insert(container_id.clone(), row);
            }
        }
        Ok(rows)
    }

    fn container_spec(&self, prepared: &PreparedSession, container_id: &str) -> Option<ContainerSpec> {
        let container = prepared.container(container_id)?;
        let definition = &container.definition;

        let volumes = match (&container.workspace_path, &definition.workspace_mount) {
            (Some(host), Some(mount)) => vec![VolumeMount {
                host_path: host.to_string_lossy().into_owned(),
                container_path: mount.clone(),
                readonly: false,
            }],
            _ => Vec::new(),
        };

        Some(ContainerSpec {
            name: naming::container_name(&prepared.session_id, &definition.id),
            image: definition.image.clone(),
            hostname: definition.hostname.clone(),
            command: definition.command.clone(),
            working_dir: definition.workspace_mount.clone(),
            env_vars: container.env_vars.clone(),
            volumes,
            ports: container
                .ports
                .iter()
                .map(|port| PortMapping {
                    container_port: *port,
                    host_port: None,
                    protocol: "tcp".to_string(),
                })
                .collect(),
            labels: naming::container_labels(
                &prepared.session_id,
                &prepared.project_id,
                &definition.id,
            ),
            network: None,
        })
    }

    async fn start_container(
        &self,
        prepared: &PreparedSession,
        container_id: &str,
        rows: &HashMap<String, SessionContainer>,
        network: &str,
        runtime_ids: &HashMap<String, String>,
    ) -> Result<StartedContainer> {
        let session_id = prepared.session_id.as_str();
        let (Some(container), Some(spec), Some(row)) = (
            prepared.container(container_id),
            self.container_spec(prepared, container_id),
            rows.get(container_id),
        ) else {
            return Err(OrchestratorError::ContainerStart {
                container_id: container_id.to_string(),
                message: "container was not prepared".to_string(),
            });
        };

        for dependency in &container.depends_on {
            if dependency.condition != DependencyCondition::Healthy {
                continue;
            }
            let dependency_id = &dependency.depends_on_container_id;
            let Some(runtime_id) = runtime_ids.get(dependency_id) else {
                return Err(OrchestratorError::ContainerStart {
                    container_id: container_id.to_string(),
                    message: format!("dependency {} was not started", dependency_id),
                });
            };
            self.wait_until_healthy(dependency_id, runtime_id).await?;
        }

        self.engine(
            "ensure image",
            ensure_image(self.inner.provider.as_ref(), &spec.image),
        )
        .await?;

        let start_error = |e: OrchestratorError| OrchestratorError::ContainerStart {
            container_id: container_id.to_string(),
            message: e.to_string(),
        };

        let runtime_id = self
            .engine("create container", self.inner.provider.create_container(&spec))
            .await
            .map_err(start_error)?;

        if let Err(e) = self
            .engine("start container", self.inner.provider.start_container(&runtime_id))
            .await
        {
            if let Err(remove) = self.inner.provider.remove_container(&runtime_id, true).await {
                warn!(session_id, runtime_id = %runtime_id, "Failed to remove unstarted container: {}", remove);
            }
            return Err(start_error(e));
        }

        let aliases = vec![container
            .definition
            .hostname
            .clone()
            .unwrap_or_else(|| container.definition.name.clone())];
        if let Err(e) = self
            .engine(
                "connect network",
                self.inner
                    .provider
                    .connect_network(network, &runtime_id, aliases),
            )
            .await
        {
            if let Err(remove) = self.inner.provider.remove_container(&runtime_id, true).await {
                warn!(session_id, runtime_id = %runtime_id, "Failed to remove detached container: {}", remove);
            }
            return Err(start_error(e));
        }

        if let Err(e) = self.record_running(&row.id, &runtime_id).await {
            self.discard_container(session_id, &runtime_id).await;
            return Err(e.into());
        }
        self.publish_container(session_id, &row.id, ContainerStatus::Running);

        self.inner.logs.start_tracking(TrackedContainer {
            session_id: session_id.to_string(),
            container_id: row.id.clone(),
            runtime_id: runtime_id.clone(),
            hostname: container.definition.hostname.clone(),
        });

        debug!(session_id, container_id, runtime_id = %runtime_id, "Container started");
        Ok(StartedContainer {
            container_id: container_id.to_string(),
            row_id: row.id.clone(),
            runtime_id,
        })
    }

    async fn record_running(&self, row_id: &str, runtime_id: &str) -> lab_storage::Result<()> {
        let storage = &self.inner.storage;
        storage.set_session_container_runtime_id(row_id, runtime_id).await?;
        storage
            .update_session_container_status(row_id, ContainerStatus::Running)
            .await
    }

    /// Stop and remove a container that never made it into the started set.
    async fn discard_container(&self, session_id: &str, runtime_id: &str) {
        let provider = &self.inner.provider;
        if let Err(e) = provider
            .stop_container(runtime_id, self.inner.config.stop_timeout_secs)
            .await
        {
            if !e.is_not_found() {
                warn!(session_id, runtime_id, "Failed to stop unrecorded container: {}", e);
            }
        }
        if let Err(e) = provider.remove_container(runtime_id, true).await {
            warn!(session_id, runtime_id, "Failed to remove unrecorded container: {}", e);
        }
    }

    /// Poll until the container reports healthy. No health check counts as healthy
    /// once running.
    async fn wait_until_healthy(&self, container_id: &str, runtime_id: &str) -> Result<()> {
        let timeout = self.inner.config.health_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            let inspect = self
                .engine("inspect container", self.inner.provider.inspect_container(runtime_id))
                .await?;

            match (&inspect.state, inspect.health) {
                (_, Some(HealthStatus::Healthy)) => return Ok(()),
                (state, None) if state.is_running() => return Ok(()),
                (_, Some(HealthStatus::Unhealthy)) => {
                    return Err(OrchestratorError::ContainerStart {
                        container_id: container_id.to_string(),
                        message: "reported unhealthy".to_string(),
                    })
                }
                (ContainerState::Exited | ContainerState::Dead, _) => {
                    return Err(OrchestratorError::ContainerStart {
                        container_id: container_id.to_string(),
                        message: "exited before becoming healthy".to_string(),
                    })
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(OrchestratorError::HealthTimeout {
                    container_id: container_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.inner.config.health_poll_interval).await;
        }
    }

    async fn rollback(&self, session_id: &str, network: &str, started: &[StartedContainer]) {
        for container in started.iter().rev() {
            self.inner.logs.stop_tracking(session_id, &container.row_id);

            let provider = &self.inner.provider;
            if let Err(e) = provider
                .stop_container(&container.runtime_id, self.inner.config.stop_timeout_secs)
                .await
            {
                if !e.is_not_found() {
                    warn!(session_id, runtime_id = %container.runtime_id, "Rollback stop failed: {}", e);
                }
            }
            if let Err(e) = provider.remove_container(&container.runtime_id, true).await {
                warn!(session_id, runtime_id = %container.runtime_id, "Rollback remove failed: {}", e);
            }
            if let Err(e) = self
                .inner
                .storage
                .update_session_container_status(&container.row_id, ContainerStatus::Stopped)
                .await
            {
                warn!(session_id, "Failed to mark rolled back container: {}", e);
            }
            self.publish_container(session_id, &container.row_id, ContainerStatus::Stopped);
        }

        if let Err(e) = self.inner.provider.remove_network(network).await {
            warn!(session_id, network, "Rollback network removal failed: {}", e);
        }
    }

    async fn spawn_sidecars(&self, session_id: &str, project_id: &str) {
        let spawns = self.inner.sidecars.iter().map(|sidecar| async move {
            (sidecar.name().to_string(), sidecar.spawn_for_session(session_id, project_id).await)
        });
        for (name, result) in join_all(spawns).await {
            if let Err(e) = result {
                error!(session_id, sidecar = %name, "Sidecar spawn failed: {}", e);
            }
        }
    }

    /// Tear a session down completely. Every step runs even when earlier ones fail.
    pub async fn cleanup_session(&self, session_id: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        let storage = &self.inner.storage;
        let provider = &self.inner.provider;

        if self.inner.initializing.abort(&session_id.to_string()) {
            info!(session_id, "Aborted in-flight initialization for cleanup");
        }

        match storage.find_session(session_id).await {
            Ok(Some(_)) => {
                if let Err(e) = storage
                    .update_session_status(session_id, SessionStatus::Deleting)
                    .await
                {
                    report.failures.push(format!("mark deleting: {}", e));
                }
            }
            Ok(None) => {}
            Err(e) => report.failures.push(format!("load session: {}", e)),
        }

        self.inner.logs.stop_session(session_id);

        if let Some(browser) = &self.inner.browser {
            browser.force_stop(session_id).await;
        }

        for sidecar in &self.inner.sidecars {
            if let Err(e) = sidecar.destroy_for_session(session_id).await {
                report
                    .failures
                    .push(format!("sidecar {}: {}", sidecar.name(), e));
            }
        }

        let network = naming::network_name(session_id);
        let containers = match storage.list_session_containers(session_id).await {
            Ok(containers) => containers,
            Err(e) => {
                report.failures.push(format!("list containers: {}", e));
                Vec::new()
            }
        };

        for container in &containers {
            // Rows without a runtime id may still have a half-created container
            let target = container
                .runtime_id
                .clone()
                .unwrap_or_else(|| naming::container_name(session_id, &container.container_id));

            if let Err(e) = provider.disconnect_network(&network, &target, true).await {
                if !e.is_not_found() {
                    debug!(session_id, target = %target, "Network disconnect failed: {}", e);
                }
            }
            if let Err(e) = provider
                .stop_container(&target, self.inner.config.stop_timeout_secs)
                .await
            {
                if !e.is_not_found() {
                    debug!(session_id, target = %target, "Container stop failed: {}", e);
                }
            }
            match provider.remove_container(&target, true).await {
                Ok(()) => report.containers_removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => report.failures.push(format!("remove {}: {}", target, e)),
            }
        }

        if let Err(e) = provider.remove_network(&network).await {
            report.failures.push(format!("remove network: {}", e));
        }

        if let Err(e) = storage.delete_session_containers(session_id).await {
            report.failures.push(format!("delete containers: {}", e));
        }
        match storage.delete_session(session_id).await {
            Ok(deleted) => report.session_deleted = deleted,
            Err(e) => report.failures.push(format!("delete session: {}", e)),
        }

        for failure in &report.failures {
            warn!(session_id, "Cleanup step failed: {}", failure);
        }
        info!(
            session_id,
            containers_removed = report.containers_removed,
            failures = report.failures.len(),
            "Session cleaned up"
        );
        report
    }

    /// Remove session networks left behind by sessions that no longer exist.
    pub async fn cleanup_orphaned_networks(&self) -> Result<usize> {
        let networks = self.inner.provider.list_networks(SESSION_LABEL).await?;
        let mut removed = 0;

        for network in networks {
            let session_id = network
                .labels
                .get(SESSION_LABEL)
                .map(String::as_str)
                .or_else(|| naming::session_from_network(&network.name));
            let Some(session_id) = session_id else {
                continue;
            };
            if self.inner.storage.find_session(session_id).await?.is_some() {
                continue;
            }
            match self.inner.provider.remove_network(&network.name).await {
                Ok(()) => {
                    info!(network = %network.name, "Removed orphaned session network");
                    removed += 1;
                }
                Err(e) => warn!(network = %network.name, "Failed to remove orphaned network: {}", e),
            }
        }
        Ok(removed)
    }

    /// Abort every in-flight initialization.
    pub fn shutdown(&self) {
        self.inner.initializing.abort_all();
    }

    fn publish_container(&self, session_id: &str, row_id: &str, status: ContainerStatus) {
        self.inner.publisher.publish_delta(
            Channel::SessionContainers,
            session_id,
            serde_json::json!({
                "type": "update",
                "container": { "id": row_id, "status": status.as_str() },
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserConfig, BrowserSessionService};
    use crate::logs::LogConfig;
    use crate::sidecar::ContainerSidecar;
    use crate::testing::{chain_project, session_with_rows, FakeDaemon, FakeRuntime, RecordingPublisher};
    use lab_storage::{DesiredState, NewContainerDefinition};
    use pretty_assertions::assert_eq;

    struct Harness {
        storage: Storage,
        runtime: Arc<FakeRuntime>,
        daemon: Arc<FakeDaemon>,
        logs: LogMonitor,
        lifecycle: SessionLifecycle,
    }

    async fn harness(config: LifecycleConfig) -> Harness {
        let storage = Storage::in_memory().await.unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.keep_logs_open();
        let daemon = Arc::new(FakeDaemon::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let logs = LogMonitor::new(
            storage.clone(),
            runtime.clone(),
            publisher.clone(),
            LogConfig::default(),
        );
        let browser = BrowserSessionService::new(
            storage.clone(),
            daemon.clone(),
            publisher.clone(),
            BrowserConfig::default(),
        );
        let lifecycle = SessionLifecycle::builder(
            storage.clone(),
            runtime.clone(),
            publisher,
            ContainerPreparer::new(storage.clone(), "/ws"),
            logs.clone(),
        )
        .browser(browser)
        .sidecar(Arc::new(ContainerSidecar::new(
            runtime.clone(),
            "agent",
            "lab-agent:latest",
            "/ws",
        )))
        .config(config)
        .build();

        Harness {
            storage,
            runtime,
            daemon,
            logs,
            lifecycle,
        }
    }

    fn fast_config() -> LifecycleConfig {
        LifecycleConfig {
            command_timeout: Duration::from_secs(5),
            health_timeout: Duration::from_millis(100),
            health_poll_interval: Duration::from_millis(10),
            stop_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_starts_chain_in_order_and_spawns_sidecar() {
        let h = harness(fast_config()).await;
        let ids = chain_project(&h.storage).await;
        let session_id = session_with_rows(&h.storage, "p1", SessionStatus::Running).await;

        h.lifecycle.initialize_session(&session_id, "p1").await.unwrap();

        let starts: Vec<String> = h.runtime.calls_matching("start:");
        let expected: Vec<String> = ids
            .iter()
            .map(|id| format!("start:{}", naming::container_name(&session_id, id)))
            .chain(std::iter::once(format!("start:lab-{}-agent", session_id)))
            .collect();
        assert_eq!(starts, expected);

        let rows = h.storage.list_session_containers(&session_id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows
            .iter()
            .all(|r| r.status == ContainerStatus::Running && r.runtime_id.is_some()));
        for row in &rows {
            assert!(h.logs.is_tracking(&session_id, &row.id));
        }

        let a = h
            .runtime
            .container(&naming::container_name(&session_id, &ids[0]))
            .unwrap();
        assert_eq!(a.networks, vec![naming::network_name(&session_id)]);
        assert_eq!(a.spec.labels.get(SESSION_LABEL), Some(&session_id));
        assert!(h
            .runtime
            .calls()
            .contains(&format!("connect:{}:{}:a", naming::network_name(&session_id), a.name)));
    }

    #[tokio::test]
    async fn test_failed_middle_container_rolls_back() {
        let h = harness(fast_config()).await;
        let ids = chain_project(&h.storage).await;
        let session_id = session_with_rows(&h.storage, "p1", SessionStatus::Running).await;
        let name_a = naming::container_name(&session_id, &ids[0]);
        let name_b = naming::container_name(&session_id, &ids[1]);
        let name_c = naming::container_name(&session_id, &ids[2]);
        h.runtime.fail_start_for(&name_b);

        let err = h
            .lifecycle
            .initialize_session(&session_id, "p1")
            .await
            .unwrap_err();
        match err.as_ref() {
            OrchestratorError::ContainerStart { container_id, message } => {
                assert_eq!(container_id, &ids[1]);
                assert!(message.contains("failed to start"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let calls = h.runtime.calls();
        assert!(calls.contains(&format!("stop:{}", name_a)));
        assert!(calls.contains(&format!("remove:{}", name_a)));
        assert!(calls.contains(&format!("remove:{}", name_b)));
        assert!(!calls.contains(&format!("create:{}", name_c)));
        assert!(h.runtime.container_names().is_empty());
        assert!(h.runtime.network_names().is_empty());
        assert!(h.runtime.calls_matching("start:lab-").iter().all(|c| !c.ends_with("-agent")));

        let statuses: HashMap<String, ContainerStatus> = h
            .storage
            .list_session_containers(&session_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.container_id, r.status))
            .collect();
        assert_eq!(statuses[&ids[0]], ContainerStatus::Stopped);
        assert_eq!(statuses[&ids[1]], ContainerStatus::Error);
        assert_eq!(statuses[&ids[2]], ContainerStatus::Starting);
    }

    #[tokio::test]
    async fn test_network_attach_failure_removes_container() {
        let h = harness(fast_config()).await;
        let ids = chain_project(&h.storage).await;
        let session_id = session_with_rows(&h.storage, "p1", SessionStatus::Running).await;
        h.runtime
            .fail_connect_for(&naming::container_name(&session_id, &ids[0]));

        assert!(h.lifecycle.initialize_session(&session_id, "p1").await.is_err());
        assert!(h.runtime.container_names().is_empty());
        assert!(h.runtime.network_names().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_initializations_share_one_task() {
        let h = harness(fast_config()).await;
        chain_project(&h.storage).await;
        let session_id = session_with_rows(&h.storage, "p1", SessionStatus::Running).await;

        let first = h.lifecycle.schedule_initialize_session(&session_id, "p1");
        let second = h.lifecycle.schedule_initialize_session(&session_id, "p1");
        assert!(h.lifecycle.has_pending_initialization(&session_id));

        let (a, b) = tokio::join!(first, second);
        a.unwrap();
        b.unwrap();

        assert_eq!(h.runtime.calls_matching("create_network:").len(), 1);
        assert_eq!(h.runtime.calls_matching("create:").len(), 4);
        assert!(!h.lifecycle.has_pending_initialization(&session_id));
    }

    async fn healthy_pair(h: &Harness) -> (String, String) {
        h.storage.create_project("p1", "Health").await.unwrap();
        let db = h
            .storage
            .create_container_definition(
                "p1",
                NewContainerDefinition {
                    name: "db".into(),
                    image: "postgres".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let api = h
            .storage
            .create_container_definition(
                "p1",
                NewContainerDefinition {
                    name: "api".into(),
                    image: "api".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        h.storage
            .add_container_dependency(&api.id, &db.id, DependencyCondition::Healthy)
            .await
            .unwrap();
        (db.id, api.id)
    }

    #[tokio::test]
    async fn test_healthy_dependency_gates_dependent() {
        let h = harness(fast_config()).await;
        let (db, api) = healthy_pair(&h).await;
        h.runtime.set_health(&db, HealthStatus::Starting);
        let session = h
            .storage
            .create_session("p1", SessionStatus::Running, None)
            .await
            .unwrap();

        let err = h
            .lifecycle
            .initialize_session(&session.id, "p1")
            .await
            .unwrap_err();
        assert!(matches!(err.as_ref(), OrchestratorError::HealthTimeout { .. }));
        assert!(!h
            .runtime
            .calls()
            .contains(&format!("create:{}", naming::container_name(&session.id, &api))));
        assert!(h.runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_healthy_dependency_allows_start() {
        let h = harness(fast_config()).await;
        let (db, _) = healthy_pair(&h).await;
        h.runtime.set_health(&db, HealthStatus::Healthy);
        let session = h
            .storage
            .create_session("p1", SessionStatus::Running, None)
            .await
            .unwrap();

        h.lifecycle.initialize_session(&session.id, "p1").await.unwrap();
        // Rows are created on demand when the session had none
        assert_eq!(h.storage.list_session_containers(&session.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_container_is_removed_when_its_row_cannot_be_updated() {
        let h = harness(LifecycleConfig {
            health_timeout: Duration::from_secs(5),
            ..fast_config()
        })
        .await;
        let (db, api) = healthy_pair(&h).await;
        h.runtime.set_health(&db, HealthStatus::Starting);
        let session_id = session_with_rows(&h.storage, "p1", SessionStatus::Running).await;

        let init = h.lifecycle.schedule_initialize_session(&session_id, "p1");
        let db_name = naming::container_name(&session_id, &db);
        for _ in 0..200 {
            if h.runtime.container(&db_name).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The rows disappear while `api` is still waiting on `db`
        h.storage.delete_session_containers(&session_id).await.unwrap();
        h.runtime.set_health(&db, HealthStatus::Healthy);

        let err = init.await.unwrap_err();
        assert!(matches!(err.as_ref(), OrchestratorError::Storage(_)));
        let api_name = naming::container_name(&session_id, &api);
        assert!(h.runtime.calls().contains(&format!("create:{}", api_name)));
        assert!(h.runtime.calls().contains(&format!("remove:{}", api_name)));
        assert!(h.runtime.container_names().is_empty());
        assert!(h.runtime.network_names().is_empty());
    }

    #[tokio::test]
    async fn test_sidecar_failure_does_not_fail_initialization() {
        let h = harness(fast_config()).await;
        chain_project(&h.storage).await;
        let session_id = session_with_rows(&h.storage, "p1", SessionStatus::Running).await;
        h.runtime.fail_start_for("-agent");

        h.lifecycle.initialize_session(&session_id, "p1").await.unwrap();
        assert_eq!(h.runtime.container_names().len(), 3);
    }

    #[tokio::test]
    async fn test_structural_error_creates_nothing() {
        let h = harness(fast_config()).await;
        h.storage.create_project("p1", "Empty").await.unwrap();
        let session = h
            .storage
            .create_session("p1", SessionStatus::Running, None)
            .await
            .unwrap();

        let err = h
            .lifecycle
            .initialize_session(&session.id, "p1")
            .await
            .unwrap_err();
        assert!(err.is_structural());
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_everything() {
        let h = harness(fast_config()).await;
        chain_project(&h.storage).await;
        let session_id = session_with_rows(&h.storage, "p1", SessionStatus::Running).await;
        h.lifecycle.initialize_session(&session_id, "p1").await.unwrap();
        h.storage
            .set_desired_state(&session_id, DesiredState::Running)
            .await
            .unwrap();

        let report = h.lifecycle.cleanup_session(&session_id).await;

        assert_eq!(report.containers_removed, 3);
        assert!(report.session_deleted);
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert!(h.runtime.container_names().is_empty());
        assert!(h.runtime.network_names().is_empty());
        assert!(h.storage.find_session(&session_id).await.unwrap().is_none());
        assert!(h.storage.get_browser_state(&session_id).await.unwrap().is_none());
        assert_eq!(h.daemon.stops(), vec![session_id.clone()]);
        assert_eq!(h.logs.tracker_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_of_unknown_session_is_harmless() {
        let h = harness(fast_config()).await;
        let report = h.lifecycle.cleanup_session("ses_missing").await;
        assert!(!report.session_deleted);
        assert_eq!(report.containers_removed, 0);
    }

    #[tokio::test]
    async fn test_orphaned_networks_are_removed() {
        let h = harness(fast_config()).await;
        h.storage.create_project("p1", "Demo").await.unwrap();
        let live = h
            .storage
            .create_session("p1", SessionStatus::Running, None)
            .await
            .unwrap();
        h.runtime.add_network(
            &naming::network_name(&live.id),
            naming::session_labels(&live.id, "p1"),
        );
        h.runtime.add_network(
            &naming::network_name("ses_gone"),
            naming::session_labels("ses_gone", "p1"),
        );
        h.runtime.add_network("bridge", HashMap::new());

        assert_eq!(h.lifecycle.cleanup_orphaned_networks().await.unwrap(), 1);
        assert_eq!(
            h.runtime.network_names(),
            vec!["bridge".to_string(), naming::network_name(&live.id)]
        );
    }
}
