// ABOUTME: Wires every reconciler into one service that owns the process-local state
// ABOUTME: Entry point for acquiring and deleting sessions and for readiness callbacks

use lab_config::OrchestratorSettings;
use lab_sandbox::SandboxProvider;
use lab_storage::{ContainerStatus, Session, SessionStatus, Storage};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::browser::{BrowserConfig, BrowserSessionService, DaemonController, SessionWarmup};
use crate::container_monitor::ContainerMonitor;
use crate::error::{OrchestratorError, SharedError};
use crate::lifecycle::{CleanupReport, LifecycleConfig, SessionLifecycle};
use crate::logs::{LogConfig, LogMonitor};
use crate::pool::{PoolConfig, PoolManager};
use crate::preparer::ContainerPreparer;
use crate::publisher::Publisher;
use crate::sidecar::ContainerSidecar;

const AGENT_SIDECAR_NAME: &str = "agent";

#[derive(Clone)]
pub struct Orchestrator {
    storage: Storage,
    lifecycle: SessionLifecycle,
    pool: PoolManager,
    browser: BrowserSessionService,
    logs: LogMonitor,
    monitor: ContainerMonitor,
}

impl Orchestrator {
    pub fn new(
        settings: &OrchestratorSettings,
        storage: Storage,
        provider: Arc<dyn SandboxProvider>,
        daemon: Arc<dyn DaemonController>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let logs = LogMonitor::new(
            storage.clone(),
            provider.clone(),
            publisher.clone(),
            LogConfig::from_settings(settings),
        );
        let browser = BrowserSessionService::new(
            storage.clone(),
            daemon,
            publisher.clone(),
            BrowserConfig::from_settings(settings),
        );

        let mut lifecycle = SessionLifecycle::builder(
            storage.clone(),
            provider.clone(),
            publisher.clone(),
            ContainerPreparer::new(storage.clone(), &settings.workspaces_root),
            logs.clone(),
        )
        .browser(browser.clone())
        .config(LifecycleConfig::from_settings(settings));
        if let Some(image) = &settings.sidecar_agent_image {
            info!(image = %image, "Agent sidecar enabled");
            lifecycle = lifecycle.sidecar(Arc::new(ContainerSidecar::new(
                provider.clone(),
                AGENT_SIDECAR_NAME,
                image,
                &settings.workspaces_root,
            )));
        }
        let lifecycle = lifecycle.build();

        let warmup: Arc<dyn SessionWarmup> = Arc::new(browser.clone());
        let pool = PoolManager::with_warmup(
            storage.clone(),
            lifecycle.clone(),
            Some(warmup),
            publisher.clone(),
            PoolConfig::from_settings(settings),
        );
        let monitor = ContainerMonitor::new(storage.clone(), provider, publisher, logs.clone());

        Self {
            storage,
            lifecycle,
            pool,
            browser,
            logs,
            monitor,
        }
    }

    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    pub fn browser(&self) -> &BrowserSessionService {
        &self.browser
    }

    pub fn logs(&self) -> &LogMonitor {
        &self.logs
    }

    /// Recover state left by a previous process, then start every loop.
    pub async fn start(&self) {
        match self.pool.cleanup_warming_sessions().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed unfinished pooled sessions"),
            Err(e) => warn!("Unfinished pooled session cleanup failed: {}", e),
        }
        match self.lifecycle.cleanup_orphaned_networks().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed orphaned session networks"),
            Err(e) => warn!("Orphaned network cleanup failed: {}", e),
        }
        match self.logs.restore().await {
            Ok(restored) => info!(restored, "Restored log trackers"),
            Err(e) => warn!("Failed to restore log trackers: {}", e),
        }

        self.monitor.start().await;
        self.browser.start();
        self.pool.start();
        info!("Orchestrator started");
    }

    pub fn shutdown(&self) {
        self.pool.stop();
        self.browser.stop();
        self.monitor.stop();
        self.lifecycle.shutdown();
        self.logs.shutdown();
        info!("Orchestrator stopped");
    }

    /// A running session for the project: a claimed pooled one when available,
    /// otherwise a new session whose containers start in the background.
    pub async fn acquire_session(&self, project_id: &str) -> Result<Session, SharedError> {
        if let Some(session) = self.pool.claim_pooled_session(project_id).await? {
            return Ok(session);
        }

        let shared = |e: lab_storage::StorageError| Arc::new(OrchestratorError::from(e));
        let definitions = self
            .storage
            .list_container_definitions(project_id)
            .await
            .map_err(shared)?;
        if definitions.is_empty() {
            return Err(Arc::new(OrchestratorError::NoContainerDefinitions(
                project_id.to_string(),
            )));
        }

        let session = self
            .storage
            .create_session(project_id, SessionStatus::Running, None)
            .await
            .map_err(shared)?;
        for definition in &definitions {
            self.storage
                .create_session_container(&session.id, &definition.id, ContainerStatus::Starting)
                .await
                .map_err(shared)?;
        }

        // Dropping the handle leaves the task running
        let _ = self
            .lifecycle
            .schedule_initialize_session(&session.id, project_id);
        info!(session_id = %session.id, project_id, "Created session, initializing in background");
        Ok(session)
    }

    /// Tear a session down. Deleting a pooled session triggers a backfill.
    pub async fn delete_session(&self, session_id: &str) -> CleanupReport {
        let session = match self.storage.find_session(session_id).await {
            Ok(session) => session,
            Err(e) => {
                error!(session_id, "Failed to load session before delete: {}", e);
                None
            }
        };

        let report = self.lifecycle.cleanup_session(session_id).await;

        if let Some(session) = session.filter(|s| s.status == SessionStatus::Pooled) {
            self.pool
                .trigger_reconcile_in_background(&session.project_id, "delete");
        }
        report
    }

    /// Forward a daemon readiness report to the browser reconciler.
    pub fn report_ready(&self, session_id: &str, port: Option<u16>, ready: bool) -> bool {
        self.browser.report_ready(session_id, port, ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{chain_project, FakeDaemon, FakeRuntime, RecordingPublisher};
    use lab_sandbox::naming;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Harness {
        storage: Storage,
        runtime: Arc<FakeRuntime>,
        orchestrator: Orchestrator,
    }

    async fn harness(pool_size: usize) -> Harness {
        let settings = OrchestratorSettings {
            pool_size,
            pool_backoff_base: Duration::from_millis(1),
            pool_backoff_max: Duration::from_millis(2),
            workspaces_root: "/ws".to_string(),
            ..Default::default()
        };
        let storage = Storage::in_memory().await.unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let orchestrator = Orchestrator::new(
            &settings,
            storage.clone(),
            runtime.clone(),
            Arc::new(FakeDaemon::new()),
            Arc::new(RecordingPublisher::new()),
        );
        Harness {
            storage,
            runtime,
            orchestrator,
        }
    }

    async fn wait_for_initialization(h: &Harness, session_id: &str) {
        for _ in 0..200 {
            if !h.orchestrator.lifecycle().has_pending_initialization(session_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("initialization of {session_id} never finished");
    }

    #[tokio::test]
    async fn test_acquire_without_pool_creates_live_session() {
        let h = harness(0).await;
        chain_project(&h.storage).await;

        let session = h.orchestrator.acquire_session("p1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        wait_for_initialization(&h, &session.id).await;

        let rows = h.storage.list_session_containers(&session.id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.status == ContainerStatus::Running));
        assert_eq!(h.runtime.container_names().len(), 3);
    }

    #[tokio::test]
    async fn test_acquire_prefers_pooled_session() {
        let h = harness(1).await;
        chain_project(&h.storage).await;
        h.orchestrator.pool().reconcile_pool("p1").await.unwrap();
        let pooled = h.storage.find_oldest_pooled_sessions("p1", 1).await.unwrap();

        let session = h.orchestrator.acquire_session("p1").await.unwrap();

        assert_eq!(session.id, pooled[0].id);
        assert_eq!(session.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_acquire_for_empty_project_fails() {
        let h = harness(0).await;
        h.storage.create_project("p1", "Empty").await.unwrap();

        let err = h.orchestrator.acquire_session("p1").await.unwrap_err();
        assert!(matches!(err.as_ref(), OrchestratorError::NoContainerDefinitions(_)));
        assert!(h.storage.list_session_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_session_removes_resources() {
        let h = harness(0).await;
        chain_project(&h.storage).await;
        let session = h.orchestrator.acquire_session("p1").await.unwrap();
        wait_for_initialization(&h, &session.id).await;

        let report = h.orchestrator.delete_session(&session.id).await;

        assert!(report.session_deleted);
        assert!(h.runtime.container_names().is_empty());
        assert!(h.storage.find_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_removes_orphans_and_shutdown_stops_loops() {
        let h = harness(0).await;
        h.runtime.add_network(
            &naming::network_name("ses_old"),
            naming::session_labels("ses_old", "p1"),
        );
        h.runtime.add_network("bridge", HashMap::new());

        h.orchestrator.start().await;
        assert!(h.orchestrator.browser().is_running());
        assert_eq!(h.runtime.network_names(), vec!["bridge".to_string()]);

        h.orchestrator.shutdown();
        assert!(!h.orchestrator.browser().is_running());
    }

    #[tokio::test]
    async fn test_start_removes_unfinished_pooled_sessions() {
        let h = harness(0).await;
        chain_project(&h.storage).await;
        let stale = h.storage.create_warming_session("p1").await.unwrap();
        h.runtime.add_network(
            &naming::network_name(&stale.id),
            naming::session_labels(&stale.id, "p1"),
        );

        h.orchestrator.start().await;

        assert!(h.storage.find_session(&stale.id).await.unwrap().is_none());
        assert!(h.runtime.network_names().is_empty());
        h.orchestrator.shutdown();
    }
}
