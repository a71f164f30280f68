// ABOUTME: Keeps a target number of pre-warmed sessions per project
// ABOUTME: Fill/drain convergence runs once per project at a time, with backoff on failed fills

use lab_config::OrchestratorSettings;
use lab_storage::{ContainerDefinition, ContainerStatus, Session, SessionStatus, Storage};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::browser::SessionWarmup;
use crate::error::{OrchestratorError, SharedError};
use crate::inflight::InFlight;
use crate::lifecycle::SessionLifecycle;
use crate::publisher::{Channel, Publisher};

type Result<T> = std::result::Result<T, SharedError>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pooled sessions to keep per project. Zero disables pooling.
    pub target: usize,
    pub reconcile_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Ceiling on one reconcile pass for a project
    pub reconcile_timeout: Duration,
}

impl PoolConfig {
    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self {
            target: settings.pool_size,
            reconcile_interval: settings.pool_reconcile_interval,
            backoff_base: settings.pool_backoff_base,
            backoff_max: settings.pool_backoff_max,
            reconcile_timeout: settings.pool_reconcile_timeout,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_settings(&OrchestratorSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub project_id: String,
    pub available: usize,
    pub target: usize,
}

/// `base * 2^failures`, capped at `max`.
pub fn compute_backoff(base: Duration, failures: u32, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(failures)).min(max)
}

fn shared(e: impl Into<OrchestratorError>) -> SharedError {
    Arc::new(e.into())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Inner {
    storage: Storage,
    lifecycle: SessionLifecycle,
    warmup: Option<Arc<dyn SessionWarmup>>,
    publisher: Arc<dyn Publisher>,
    config: PoolConfig,
    reconciling: InFlight<String, ()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<Inner>,
}

impl PoolManager {
    pub fn new(
        storage: Storage,
        lifecycle: SessionLifecycle,
        publisher: Arc<dyn Publisher>,
        config: PoolConfig,
    ) -> Self {
        Self::with_warmup(storage, lifecycle, None, publisher, config)
    }

    pub fn with_warmup(
        storage: Storage,
        lifecycle: SessionLifecycle,
        warmup: Option<Arc<dyn SessionWarmup>>,
        publisher: Arc<dyn Publisher>,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                lifecycle,
                warmup,
                publisher,
                config,
                reconciling: InFlight::new(),
                loop_handle: Mutex::new(None),
            }),
        }
    }

    pub fn target(&self) -> usize {
        self.inner.config.target
    }

    pub async fn pool_snapshot(&self, project_id: &str) -> Result<PoolSnapshot> {
        let available = self
            .inner
            .storage
            .count_pooled_sessions(project_id)
            .await
            .map_err(shared)?;
        Ok(PoolSnapshot {
            project_id: project_id.to_string(),
            available,
            target: self.target(),
        })
    }

    /// Take one pooled session for immediate use. `None` means the caller should create
    /// a session live.
    pub async fn claim_pooled_session(&self, project_id: &str) -> Result<Option<Session>> {
        if self.target() == 0 {
            return Ok(None);
        }

        let claimed = self
            .inner
            .storage
            .claim_pooled_session(project_id)
            .await
            .map_err(shared)?;

        if let Some(session) = &claimed {
            info!(session_id = %session.id, project_id, "Claimed pooled session");
            self.trigger_reconcile_in_background(project_id, "claim");
        }
        Ok(claimed)
    }

    pub fn trigger_reconcile_in_background(&self, project_id: &str, reason: &'static str) {
        let pool = self.clone();
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = pool.reconcile_pool(&project_id).await {
                error!(project_id = %project_id, reason, "Background pool reconcile failed: {}", e);
            }
        });
    }

    /// Create one pooled session, fully initialized. A failed session is cleaned up.
    ///
    /// The work runs as its own task so a caller that stops waiting (a timed-out
    /// reconcile pass) cannot skip the cleanup of a failed session.
    pub async fn create_pooled_session(&self, project_id: &str) -> Result<Session> {
        let pool = self.clone();
        let project = project_id.to_string();
        match tokio::spawn(async move { pool.build_pooled_session(&project).await }).await {
            Ok(result) => result,
            Err(e) => Err(shared(OrchestratorError::TaskAborted(format!(
                "pooled session creation for project {}: {}",
                project_id, e
            )))),
        }
    }

    async fn build_pooled_session(&self, project_id: &str) -> Result<Session> {
        let storage = &self.inner.storage;
        let definitions = storage
            .list_container_definitions(project_id)
            .await
            .map_err(shared)?;
        if definitions.is_empty() {
            return Err(Arc::new(OrchestratorError::NoContainerDefinitions(
                project_id.to_string(),
            )));
        }

        // Unclaimable until its containers are up
        let session = storage.create_warming_session(project_id).await.map_err(shared)?;

        if let Err(e) = self.initialize_pooled(&session, &definitions).await {
            error!(session_id = %session.id, project_id, "Failed to initialize pooled session: {}", e);
            self.remove_pooled_session(&session.id).await;
            return Err(e);
        }

        if let Some(warmup) = &self.inner.warmup {
            match warmup.warm_up(&session.id).await {
                Ok(()) => debug!(session_id = %session.id, project_id, "Pooled session warmed"),
                Err(e) => error!(session_id = %session.id, project_id, "Pooled session warm-up failed: {}", e),
            }
        }

        match storage.mark_pooled_session_ready(&session.id).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(shared(OrchestratorError::TaskAborted(format!(
                    "pooled session {} was removed during initialization",
                    session.id
                ))))
            }
            Err(e) => {
                self.remove_pooled_session(&session.id).await;
                return Err(shared(e));
            }
        }
        info!(session_id = %session.id, project_id, "Pooled session created");
        Ok(session)
    }

    /// Full cleanup of a session that is still pooled. Claimed sessions are left alone.
    async fn remove_pooled_session(&self, session_id: &str) -> bool {
        match self.inner.storage.begin_pooled_session_removal(session_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(session_id, "Session is no longer pooled, skipping cleanup");
                return false;
            }
            Err(e) => {
                warn!(session_id, "Failed to mark pooled session for removal: {}", e);
                return false;
            }
        }

        let report = self.inner.lifecycle.cleanup_session(session_id).await;
        if !report.failures.is_empty() {
            warn!(session_id, "Pooled session cleanup incomplete: {:?}", report.failures);
        }
        true
    }

    /// Remove pooled sessions whose initialization was cut short by a previous process.
    /// Only meaningful before the pool loop starts.
    pub async fn cleanup_warming_sessions(&self) -> Result<usize> {
        let sessions = self
            .inner
            .storage
            .list_warming_sessions()
            .await
            .map_err(shared)?;
        let mut removed = 0;
        for session in sessions {
            if self.remove_pooled_session(&session.id).await {
                info!(session_id = %session.id, project_id = %session.project_id, "Removed unfinished pooled session");
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn initialize_pooled(
        &self,
        session: &Session,
        definitions: &[ContainerDefinition],
    ) -> Result<()> {
        for definition in definitions {
            self.inner
                .storage
                .create_session_container(&session.id, &definition.id, ContainerStatus::Starting)
                .await
                .map_err(shared)?;
        }
        self.inner
            .lifecycle
            .initialize_session(&session.id, &session.project_id)
            .await
    }

    /// Converge the project's pool to its target. Concurrent callers share the
    /// running pass.
    pub async fn reconcile_pool(&self, project_id: &str) -> Result<()> {
        let key = project_id.to_string();
        let timeout = self.inner.config.reconcile_timeout;

        if let Some(started_at) = self.inner.reconciling.started_at(&key) {
            let age = started_at.elapsed();
            if age > timeout {
                warn!(project_id, lock_age_ms = age.as_millis() as u64, "Pool reconcile waiting on long-running pass");
            }
        }

        let pool = self.clone();
        let project = key.clone();
        let (task, joined) = self.inner.reconciling.run(key, move || async move {
            match tokio::time::timeout(timeout, pool.do_reconcile(&project)).await {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::Timeout {
                    operation: format!("pool reconcile for project {}", project),
                    timeout,
                }),
            }
        });
        if joined {
            debug!(project_id, "Joined in-flight pool reconcile");
        }
        task.await
    }

    async fn do_reconcile(&self, project_id: &str) -> crate::error::Result<()> {
        let target = self.target();
        let max_iterations = (target * 2).max(10);
        let started = Instant::now();
        let mut failures = 0u32;
        let mut settled = false;

        for _ in 0..max_iterations {
            let current = self.inner.storage.count_pooled_sessions(project_id).await?;

            if current == target {
                settled = true;
                break;
            }

            if current < target {
                info!(project_id, current, target, "Pool fill needed");
                failures = self.fill_one(project_id, failures).await?;
            } else {
                self.drain_excess(project_id, current - target).await?;
            }
        }

        if settled {
            debug!(project_id, target, elapsed_ms = started.elapsed().as_millis() as u64, "Pool settled");
        } else {
            error!(project_id, max_iterations, "Pool reconcile hit its iteration limit");
        }
        self.publish_snapshot(project_id).await;
        Ok(())
    }

    /// Returns the updated consecutive failure count. Structural errors end the pass.
    async fn fill_one(&self, project_id: &str, failures: u32) -> crate::error::Result<u32> {
        match self.create_pooled_session(project_id).await {
            Ok(_) => Ok(0),
            Err(e) if e.is_structural() => {
                warn!(project_id, "Pool fill stopped: {}", e);
                Err(e.structural_copy().unwrap_or(OrchestratorError::NoContainerDefinitions(
                    project_id.to_string(),
                )))
            }
            Err(_) => {
                let failures = failures + 1;
                let delay = compute_backoff(
                    self.inner.config.backoff_base,
                    failures,
                    self.inner.config.backoff_max,
                );
                error!(project_id, attempt = failures, backoff_ms = delay.as_millis() as u64, "Pool fill failed");
                tokio::time::sleep(delay).await;
                Ok(failures)
            }
        }
    }

    async fn drain_excess(&self, project_id: &str, excess: usize) -> crate::error::Result<()> {
        info!(project_id, excess, "Draining excess pooled sessions");
        let sessions = self
            .inner
            .storage
            .find_oldest_pooled_sessions(project_id, excess)
            .await?;
        for session in sessions {
            if self.remove_pooled_session(&session.id).await {
                info!(project_id, session_id = %session.id, "Removed excess pooled session");
            }
        }
        Ok(())
    }

    async fn publish_snapshot(&self, project_id: &str) {
        match self.pool_snapshot(project_id).await {
            Ok(snapshot) => match serde_json::to_value(&snapshot) {
                Ok(payload) => {
                    self.inner
                        .publisher
                        .publish_snapshot(Channel::PoolStatus, project_id, payload)
                }
                Err(e) => warn!(project_id, "Failed to serialize pool snapshot: {}", e),
            },
            Err(e) => warn!(project_id, "Failed to read pool snapshot: {}", e),
        }
    }

    /// Reconcile every project in turn. Failures are logged per project.
    pub async fn reconcile_all_pools(&self) {
        let projects = match self.inner.storage.list_project_ids().await {
            Ok(projects) => projects,
            Err(e) => {
                error!("Failed to list projects for pool reconcile: {}", e);
                return;
            }
        };
        for project_id in projects {
            if let Err(e) = self.reconcile_pool(&project_id).await {
                error!(project_id = %project_id, "Pool reconcile failed: {}", e);
            }
        }
    }

    /// Start the periodic reconcile loop, beginning with an immediate pass.
    pub fn start(&self) {
        let mut handle = lock(&self.inner.loop_handle);
        if handle.is_some() {
            return;
        }
        let pool = self.clone();
        let interval = self.inner.config.reconcile_interval;
        info!(target_size = self.target(), "Starting pool manager (interval: {:?})", interval);

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.reconcile_all_pools().await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.inner.loop_handle).take() {
            handle.abort();
            info!("Stopped pool manager");
        }
        self.inner.reconciling.abort_all();
    }
}
