// ABOUTME: Browser session reconciler driving each session's daemon toward its desired state
// ABOUTME: Owns subscriber refcounts, delayed stops, stream ports and the readiness callback queue

pub mod daemon;
pub mod plan;
pub mod ports;
pub mod subscribers;

pub use daemon::{DaemonController, DaemonError, DaemonStatus, HttpDaemonController, StartOptions};
pub use plan::{plan, Action};
pub use ports::StreamPortAllocator;
pub use subscribers::SubscriberRegistry;

use async_trait::async_trait;
use lab_config::OrchestratorSettings;
use lab_storage::{ActualState, ActualStateUpdate, BrowserSessionState, DesiredState, Storage};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SharedError};
use crate::inflight::InFlight;
use crate::publisher::{Channel, Publisher};

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub reconcile_interval: Duration,
    pub cleanup_delay: Duration,
    pub max_retries: u32,
    pub base_stream_port: u16,
    /// Ceiling for any single daemon call
    pub command_timeout: Duration,
    /// Where the daemon reports readiness, forwarded on start
    pub callback_url: Option<String>,
}

impl BrowserConfig {
    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self {
            reconcile_interval: settings.reconcile_interval,
            cleanup_delay: settings.cleanup_delay,
            max_retries: settings.max_daemon_retries,
            base_stream_port: settings.base_stream_port,
            command_timeout: settings.command_timeout,
            callback_url: Some(settings.readiness_callback_url()),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            callback_url: None,
            ..Self::from_settings(&OrchestratorSettings::default())
        }
    }
}

/// Work queued for the reconciler loop. Ticks and queued requests are handled by the
/// same task, so per-session ordering follows arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserRequest {
    Reconcile(String),
    Ready {
        session_id: String,
        port: Option<u16>,
        ready: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSessionSnapshot {
    pub session_id: String,
    pub desired_state: DesiredState,
    pub actual_state: ActualState,
    pub stream_port: Option<u16>,
    pub error_message: Option<String>,
    pub subscriber_count: usize,
}

/// Optional preparation applied to freshly pooled sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionWarmup: Send + Sync {
    async fn warm_up(&self, session_id: &str) -> Result<()>;
}

struct Inner {
    storage: Storage,
    daemon: Arc<dyn DaemonController>,
    publisher: Arc<dyn Publisher>,
    config: BrowserConfig,
    ports: StreamPortAllocator,
    subscribers: SubscriberRegistry,
    reconciling: InFlight<String, ()>,
    requests_tx: mpsc::UnboundedSender<BrowserRequest>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<BrowserRequest>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct BrowserSessionService {
    inner: Arc<Inner>,
}

fn is_restorable_url(url: &str) -> bool {
    let url = url.trim();
    !url.is_empty() && url != "about:blank"
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl BrowserSessionService {
    pub fn new(
        storage: Storage,
        daemon: Arc<dyn DaemonController>,
        publisher: Arc<dyn Publisher>,
        config: BrowserConfig,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                storage,
                daemon,
                publisher,
                ports: StreamPortAllocator::new(config.base_stream_port),
                config,
                subscribers: SubscriberRegistry::new(),
                reconciling: InFlight::new(),
                requests_tx,
                requests_rx: Mutex::new(Some(requests_rx)),
                loop_handle: Mutex::new(None),
            }),
        }
    }

    /// Register a subscriber. The first one asks for a running daemon.
    pub async fn subscribe(&self, session_id: &str) -> Result<BrowserSessionSnapshot> {
        let count = self.inner.subscribers.add(session_id);
        debug!(session_id, count, "Browser stream subscribed");

        if count == 1 {
            let state = self
                .inner
                .storage
                .set_desired_state(session_id, DesiredState::Running)
                .await?;
            self.publish_state(&state);
            self.enqueue(BrowserRequest::Reconcile(session_id.to_string()));
        }

        self.get_snapshot(session_id).await
    }

    /// Drop a subscriber. The last one arms a delayed stop instead of stopping at once.
    pub async fn unsubscribe(&self, session_id: &str) -> Result<BrowserSessionSnapshot> {
        let count = self.inner.subscribers.remove(session_id);
        debug!(session_id, count, "Browser stream unsubscribed");

        if count == 0 {
            self.arm_cleanup_timer(session_id);
        }

        self.get_snapshot(session_id).await
    }

    fn arm_cleanup_timer(&self, session_id: &str) {
        let service = self.clone();
        let session = session_id.to_string();
        let delay = self.inner.config.cleanup_delay;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !service.inner.subscribers.fire(&session) {
                return;
            }
            info!(session_id = %session, "No subscribers after {:?}, stopping browser", delay);
            service.stop_when_idle(&session).await;
        });
        self.inner.subscribers.arm_timer(session_id, timer);
    }

    async fn stop_when_idle(&self, session_id: &str) {
        match self
            .inner
            .storage
            .set_desired_state(session_id, DesiredState::Stopped)
            .await
        {
            Ok(state) => self.publish_state(&state),
            Err(e) => {
                warn!(session_id, "Failed to mark browser for stop: {}", e);
                return;
            }
        }
        if let Err(e) = self.reconcile_session(session_id).await {
            warn!(session_id, "Failed to stop idle browser: {}", e);
        }
    }

    /// Stop the daemon and forget the session entirely. Used during session cleanup.
    pub async fn force_stop(&self, session_id: &str) {
        self.inner.subscribers.forget(session_id);
        self.inner.reconciling.abort(&session_id.to_string());

        if let Err(e) = self.daemon_call("stop", self.inner.daemon.stop(session_id)).await {
            warn!(session_id, "Failed to stop browser daemon: {}", e);
        }
        if let Err(e) = self.inner.storage.delete_browser_state(session_id).await {
            warn!(session_id, "Failed to delete browser state: {}", e);
        }
    }

    pub async fn get_snapshot(&self, session_id: &str) -> Result<BrowserSessionSnapshot> {
        let subscriber_count = self.inner.subscribers.count(session_id);
        let snapshot = match self.inner.storage.get_browser_state(session_id).await? {
            Some(state) => BrowserSessionSnapshot {
                session_id: state.session_id,
                desired_state: state.desired_state,
                actual_state: state.actual_state,
                stream_port: state.stream_port,
                error_message: state.error_message,
                subscriber_count,
            },
            None => BrowserSessionSnapshot {
                session_id: session_id.to_string(),
                desired_state: DesiredState::Stopped,
                actual_state: ActualState::Stopped,
                stream_port: None,
                error_message: None,
                subscriber_count,
            },
        };
        Ok(snapshot)
    }

    /// Queue a readiness report from the daemon. Returns false once the service is gone.
    pub fn report_ready(&self, session_id: &str, port: Option<u16>, ready: bool) -> bool {
        self.enqueue(BrowserRequest::Ready {
            session_id: session_id.to_string(),
            port,
            ready,
        })
    }

    fn enqueue(&self, request: BrowserRequest) -> bool {
        self.inner.requests_tx.send(request).is_ok()
    }

    /// Start the reconcile loop: one pass immediately, then every interval.
    pub fn start(&self) {
        let mut handle = lock(&self.inner.loop_handle);
        if handle.is_some() {
            return;
        }
        let Some(mut requests) = lock(&self.inner.requests_rx).take() else {
            warn!("Browser reconciler was already stopped; not restarting");
            return;
        };

        let service = self.clone();
        let interval = self.inner.config.reconcile_interval;
        info!("Starting browser session reconciler (interval: {:?})", interval);

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => service.reconcile_all().await,
                    request = requests.recv() => match request {
                        Some(request) => service.handle_request(request).await,
                        None => break,
                    },
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.inner.loop_handle).take() {
            handle.abort();
            info!("Stopped browser session reconciler");
        }
        self.inner.subscribers.clear();
        self.inner.reconciling.abort_all();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.loop_handle).is_some()
    }

    pub(crate) async fn handle_request(&self, request: BrowserRequest) {
        let session_id = match request {
            BrowserRequest::Reconcile(session_id) => session_id,
            BrowserRequest::Ready {
                session_id,
                port,
                ready,
            } => {
                debug!(session_id = %session_id, ?port, ready, "Browser daemon readiness report");
                if let Err(e) = self.inner.storage.update_heartbeat(&session_id).await {
                    warn!(session_id = %session_id, "Failed to record heartbeat: {}", e);
                }
                if !ready {
                    return;
                }
                if let Some(port) = port {
                    if let Err(e) = self.record_reported_port(&session_id, port).await {
                        warn!(session_id = %session_id, port, "Failed to record reported stream port: {}", e);
                    }
                }
                session_id
            }
        };

        if let Err(e) = self.reconcile_session(&session_id).await {
            error!(session_id = %session_id, "Failed to reconcile browser session: {}", e);
        }
    }

    /// A daemon that reports ready while starting owns the port it names.
    async fn record_reported_port(&self, session_id: &str, port: u16) -> Result<()> {
        let Some(state) = self.inner.storage.get_browser_state(session_id).await? else {
            return Ok(());
        };
        if state.actual_state == ActualState::Starting && state.stream_port != Some(port) {
            debug!(session_id, port, previous = ?state.stream_port, "Daemon reported a different stream port");
            self.transition(
                session_id,
                ActualState::Starting,
                ActualStateUpdate::default().stream_port(Some(port)),
            )
            .await?;
        }
        Ok(())
    }

    /// One pass over every persisted browser state. Errors are logged per session.
    pub async fn reconcile_all(&self) {
        let states = match self.inner.storage.list_browser_states().await {
            Ok(states) => states,
            Err(e) => {
                error!("Failed to list browser sessions: {}", e);
                return;
            }
        };

        let passes = states.iter().map(|state| async move {
            if let Err(e) = self.reconcile_session(&state.session_id).await {
                error!(session_id = %state.session_id, "Failed to reconcile browser session: {}", e);
            }
        });
        futures::future::join_all(passes).await;
    }

    /// Apply one step of the state machine to a session. Concurrent calls for the
    /// same session share a single pass.
    pub async fn reconcile_session(&self, session_id: &str) -> std::result::Result<(), SharedError> {
        let service = self.clone();
        let id = session_id.to_string();
        let (task, _) = self
            .inner
            .reconciling
            .run(session_id.to_string(), move || async move {
                service.reconcile_once(&id).await
            });
        task.await
    }

    async fn reconcile_once(&self, session_id: &str) -> Result<()> {
        let Some(state) = self.inner.storage.get_browser_state(session_id).await? else {
            return Ok(());
        };

        let action = plan(
            state.desired_state,
            state.actual_state,
            state.retry_count,
            self.inner.config.max_retries,
        );
        debug!(
            session_id,
            desired = %state.desired_state,
            actual = %state.actual_state,
            ?action,
            "Reconciling browser session"
        );

        match action {
            Action::None => {}
            Action::RetriesExhausted => {
                if state.actual_state != ActualState::Error {
                    let message = format!(
                        "Browser failed to start after {} attempts",
                        state.retry_count
                    );
                    self.transition(
                        session_id,
                        ActualState::Error,
                        ActualStateUpdate::default().error_message(Some(message)),
                    )
                    .await?;
                }
                warn!(
                    session_id,
                    retries = state.retry_count,
                    "Browser session exceeded max retries, staying in error"
                );
            }
            Action::Start => self.start_daemon(&state).await?,
            Action::PollStarting => {
                let status = self.daemon_status(session_id).await;
                if status.ready {
                    self.transition(
                        session_id,
                        ActualState::Running,
                        ActualStateUpdate::default().stream_port(state.stream_port.or(status.port)),
                    )
                    .await?;
                    self.restore_last_url(&state).await;
                }
            }
            Action::CheckRunning => {
                if !self.daemon_status(session_id).await.running {
                    warn!(session_id, "Browser daemon not running, scheduling restart");
                    self.transition(session_id, ActualState::Stopped, ActualStateUpdate::default())
                        .await?;
                }
            }
            Action::RecoverStopping => {
                if !self.daemon_status(session_id).await.running {
                    info!(session_id, "Browser stuck in stopping with a dead daemon, resetting");
                    self.transition(session_id, ActualState::Stopped, ActualStateUpdate::default())
                        .await?;
                }
            }
            Action::Stop => self.stop_daemon(&state).await?,
            Action::Normalize => {
                self.transition(
                    session_id,
                    ActualState::Stopped,
                    ActualStateUpdate::default()
                        .stream_port(None)
                        .retry_count(0)
                        .error_message(None),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Bound a daemon call so one unresponsive daemon cannot stall the loop.
    async fn daemon_call<T, F>(&self, operation: &'static str, call: F) -> daemon::Result<T>
    where
        F: Future<Output = daemon::Result<T>>,
    {
        let timeout = self.inner.config.command_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::Timeout { operation, timeout }),
        }
    }

    async fn daemon_status(&self, session_id: &str) -> DaemonStatus {
        match self
            .daemon_call("status", self.inner.daemon.get_status(session_id))
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(session_id, "Failed to query browser daemon: {}", e);
                DaemonStatus::default()
            }
        }
    }

    async fn start_daemon(&self, state: &BrowserSessionState) -> Result<()> {
        let session_id = state.session_id.as_str();
        let in_use: HashSet<u16> = self
            .inner
            .storage
            .list_stream_ports_in_use()
            .await?
            .into_iter()
            .collect();
        let port = self.inner.ports.allocate(state.stream_port, &in_use);
        let retry_count = state.retry_count + 1;
        info!(session_id, ?port, attempt = retry_count, "Starting browser daemon");

        self.transition(
            session_id,
            ActualState::Starting,
            ActualStateUpdate::default()
                .retry_count(retry_count)
                .error_message(None)
                .stream_port(port),
        )
        .await?;

        let options = StartOptions {
            stream_port: port,
            callback_url: self.inner.config.callback_url.clone(),
        };
        match self
            .daemon_call("start", self.inner.daemon.start(session_id, options))
            .await
        {
            Ok(assigned) => {
                self.transition(
                    session_id,
                    ActualState::Starting,
                    ActualStateUpdate::default().stream_port(Some(assigned)),
                )
                .await?;
            }
            Err(e) => {
                error!(session_id, "Failed to start browser daemon: {}", e);
                self.transition(
                    session_id,
                    ActualState::Error,
                    ActualStateUpdate::default().error_message(Some(e.to_string())),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn stop_daemon(&self, state: &BrowserSessionState) -> Result<()> {
        let session_id = state.session_id.as_str();
        info!(session_id, "Stopping browser daemon");

        match self
            .daemon_call("url", self.inner.daemon.get_current_url(session_id))
            .await
        {
            Ok(Some(url)) if is_restorable_url(&url) => {
                if let Err(e) = self.inner.storage.set_last_url(session_id, Some(&url)).await {
                    warn!(session_id, "Failed to save last URL: {}", e);
                } else {
                    debug!(session_id, url = %url, "Saved last URL");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(session_id, "Failed to read current URL: {}", e),
        }

        self.transition(session_id, ActualState::Stopping, ActualStateUpdate::default())
            .await?;

        match self.daemon_call("stop", self.inner.daemon.stop(session_id)).await {
            Ok(()) => {
                self.transition(
                    session_id,
                    ActualState::Stopped,
                    ActualStateUpdate::default()
                        .stream_port(None)
                        .error_message(None)
                        .retry_count(0),
                )
                .await?;
            }
            Err(e) => {
                error!(session_id, "Failed to stop browser daemon: {}", e);
                self.transition(
                    session_id,
                    ActualState::Error,
                    ActualStateUpdate::default().error_message(Some(e.to_string())),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn restore_last_url(&self, state: &BrowserSessionState) {
        let Some(url) = state.last_url.as_deref().filter(|u| is_restorable_url(u)) else {
            return;
        };
        info!(session_id = %state.session_id, url, "Restoring last URL");
        if let Err(e) = self
            .daemon_call("navigate", self.inner.daemon.navigate(&state.session_id, url))
            .await
        {
            warn!(session_id = %state.session_id, "Failed to restore last URL: {}", e);
        }
    }

    async fn transition(
        &self,
        session_id: &str,
        actual: ActualState,
        update: ActualStateUpdate,
    ) -> Result<Option<BrowserSessionState>> {
        let state = self
            .inner
            .storage
            .set_actual_state(session_id, actual, &update)
            .await?;
        if let Some(state) = &state {
            self.publish_state(state);
        }
        Ok(state)
    }

    fn publish_state(&self, state: &BrowserSessionState) {
        match serde_json::to_value(state) {
            Ok(payload) => {
                self.inner
                    .publisher
                    .publish_delta(Channel::SessionBrowserStream, &state.session_id, payload)
            }
            Err(e) => warn!(session_id = %state.session_id, "Failed to encode browser state: {}", e),
        }
    }
}

#[async_trait]
impl SessionWarmup for BrowserSessionService {
    /// Seed the state row and have the daemon open its browser before anyone subscribes.
    async fn warm_up(&self, session_id: &str) -> Result<()> {
        self.inner.storage.ensure_browser_state(session_id).await?;
        self.daemon_call("launch", self.inner.daemon.launch(session_id)).await?;
        debug!(session_id, "Browser warmed up");
        Ok(())
    }
}
