// ABOUTME: Tails stdout/stderr of every running session container into per-container ring buffers
// ABOUTME: Live lines are fanned out through a rate limiter; history stays complete up to capacity

pub mod buffer;
pub mod rate_limit;

pub use buffer::CircularBuffer;
pub use rate_limit::LineRateLimiter;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use lab_config::OrchestratorSettings;
use lab_sandbox::{LogChunk, LogStreamOptions, SandboxProvider, StreamType};
use lab_storage::{ContainerStatus, Storage};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::publisher::{Channel, Publisher};

/// History requested from the runtime when a tracker attaches.
pub const DEFAULT_TAIL_LINES: usize = 100;

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub buffer_size: usize,
    pub lines_per_second: u32,
    pub tail_lines: usize,
}

impl LogConfig {
    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self {
            buffer_size: settings.log_buffer_size,
            lines_per_second: settings.log_lines_per_second,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from_settings(&OrchestratorSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub container_id: String,
    pub stream: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Streaming,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSource {
    pub id: String,
    pub hostname: Option<String>,
    pub runtime_id: String,
    pub status: SourceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLogSnapshot {
    pub sources: Vec<LogSource>,
    pub recent_logs: HashMap<String, Vec<LogEntry>>,
}

/// A session container to tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedContainer {
    pub session_id: String,
    pub container_id: String,
    pub runtime_id: String,
    pub hostname: Option<String>,
}

struct Tracker {
    container: TrackedContainer,
    status: Arc<Mutex<SourceStatus>>,
    buffer: Arc<Mutex<CircularBuffer<LogEntry>>>,
    handle: JoinHandle<()>,
}

impl Tracker {
    fn source(&self) -> LogSource {
        LogSource {
            id: self.container.container_id.clone(),
            hostname: self.container.hostname.clone(),
            runtime_id: self.container.runtime_id.clone(),
            status: *lock(&self.status),
        }
    }
}

#[derive(Default)]
struct TrackerIndex {
    trackers: HashMap<String, Tracker>,
    by_session: HashMap<String, HashSet<String>>,
}

impl TrackerIndex {
    fn take(&mut self, key: &str) -> Option<Tracker> {
        let tracker = self.trackers.remove(key)?;
        let session_id = &tracker.container.session_id;
        if let Some(keys) = self.by_session.get_mut(session_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_session.remove(session_id);
            }
        }
        Some(tracker)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn tracker_key(session_id: &str, container_id: &str) -> String {
    format!("{}:{}", session_id, container_id)
}

/// Split a raw chunk into non-empty lines.
pub fn split_lines(chunk: &LogChunk) -> Vec<String> {
    String::from_utf8_lossy(&chunk.data)
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

struct Inner {
    storage: Storage,
    provider: Arc<dyn SandboxProvider>,
    publisher: Arc<dyn Publisher>,
    config: LogConfig,
    index: Mutex<TrackerIndex>,
}

#[derive(Clone)]
pub struct LogMonitor {
    inner: Arc<Inner>,
}

impl LogMonitor {
    pub fn new(
        storage: Storage,
        provider: Arc<dyn SandboxProvider>,
        publisher: Arc<dyn Publisher>,
        config: LogConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                provider,
                publisher,
                config,
                index: Mutex::new(TrackerIndex::default()),
            }),
        }
    }

    /// Resume tailing every container persisted as running.
    pub async fn restore(&self) -> Result<usize> {
        let running = self
            .inner
            .storage
            .list_session_containers_by_status(ContainerStatus::Running)
            .await?;

        let mut started = 0;
        for container in running {
            let Some(runtime_id) = container.runtime_id else {
                continue;
            };
            if self.start_tracking(TrackedContainer {
                session_id: container.session_id,
                container_id: container.id,
                runtime_id,
                hostname: None,
            }) {
                started += 1;
            }
        }
        info!(trackers = started, "Log monitor restored trackers");
        Ok(started)
    }

    /// Start tailing a container. A live tracker for the same container is kept as is;
    /// one whose stream already ended is replaced. Returns whether a tracker started.
    pub fn start_tracking(&self, container: TrackedContainer) -> bool {
        let key = tracker_key(&container.session_id, &container.container_id);
        let source = {
            let mut index = lock(&self.inner.index);
            if let Some(existing) = index.trackers.get(&key) {
                if *lock(&existing.status) == SourceStatus::Streaming {
                    return false;
                }
            }
            if let Some(finished) = index.take(&key) {
                finished.handle.abort();
            }

            let status = Arc::new(Mutex::new(SourceStatus::Streaming));
            let buffer = Arc::new(Mutex::new(CircularBuffer::new(self.inner.config.buffer_size)));
            let handle = tokio::spawn(run_tracker(
                self.inner.clone(),
                container.clone(),
                status.clone(),
                buffer.clone(),
            ));

            let tracker = Tracker {
                container: container.clone(),
                status,
                buffer,
                handle,
            };
            let source = tracker.source();
            index.trackers.insert(key.clone(), tracker);
            index
                .by_session
                .entry(container.session_id.clone())
                .or_default()
                .insert(key);
            source
        };

        self.inner.publisher.publish_delta(
            Channel::SessionLogs,
            &container.session_id,
            serde_json::json!({ "type": "source_add", "source": source }),
        );
        info!(
            session_id = %container.session_id,
            container_id = %container.container_id,
            runtime_id = %container.runtime_id,
            "Log tracker started"
        );
        true
    }

    /// Stop one tracker. Safe to call for containers that are not tracked.
    pub fn stop_tracking(&self, session_id: &str, container_id: &str) -> bool {
        let Some(tracker) = lock(&self.inner.index).take(&tracker_key(session_id, container_id))
        else {
            return false;
        };
        tracker.handle.abort();

        self.inner.publisher.publish_delta(
            Channel::SessionLogs,
            session_id,
            serde_json::json!({
                "type": "source_update",
                "containerId": container_id,
                "status": SourceStatus::Stopped,
            }),
        );
        info!(session_id, container_id, "Log tracker stopped");
        true
    }

    /// Stop every tracker of a session. Returns how many were stopped.
    pub fn stop_session(&self, session_id: &str) -> usize {
        let trackers: Vec<Tracker> = {
            let mut index = lock(&self.inner.index);
            let keys = index.by_session.remove(session_id).unwrap_or_default();
            keys.iter().filter_map(|k| index.trackers.remove(k)).collect()
        };
        for tracker in &trackers {
            tracker.handle.abort();
        }
        if !trackers.is_empty() {
            info!(session_id, trackers = trackers.len(), "Log trackers stopped for session");
        }
        trackers.len()
    }

    pub fn get_session_snapshot(&self, session_id: &str) -> SessionLogSnapshot {
        let index = lock(&self.inner.index);
        let Some(keys) = index.by_session.get(session_id) else {
            return SessionLogSnapshot::default();
        };

        let mut snapshot = SessionLogSnapshot::default();
        let mut keys: Vec<&String> = keys.iter().collect();
        keys.sort();
        for key in keys {
            if let Some(tracker) = index.trackers.get(key) {
                snapshot.sources.push(tracker.source());
                snapshot.recent_logs.insert(
                    tracker.container.container_id.clone(),
                    lock(&tracker.buffer).to_vec(),
                );
            }
        }
        snapshot
    }

    pub fn is_tracking(&self, session_id: &str, container_id: &str) -> bool {
        lock(&self.inner.index)
            .trackers
            .contains_key(&tracker_key(session_id, container_id))
    }

    pub fn tracker_count(&self) -> usize {
        lock(&self.inner.index).trackers.len()
    }

    pub fn shutdown(&self) {
        let trackers: Vec<Tracker> = {
            let mut index = lock(&self.inner.index);
            index.by_session.clear();
            index.trackers.drain().map(|(_, t)| t).collect()
        };
        for tracker in &trackers {
            tracker.handle.abort();
        }
        info!(trackers = trackers.len(), "Log monitor stopped");
    }
}

async fn run_tracker(
    inner: Arc<Inner>,
    container: TrackedContainer,
    status: Arc<Mutex<SourceStatus>>,
    buffer: Arc<Mutex<CircularBuffer<LogEntry>>>,
) {
    let limiter = LineRateLimiter::per_second(inner.config.lines_per_second);
    let options = LogStreamOptions {
        tail: Some(inner.config.tail_lines),
        follow: true,
    };

    let final_status = match inner.provider.stream_logs(&container.runtime_id, options).await {
        Ok(mut stream) => loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    for text in split_lines(&chunk) {
                        let entry = LogEntry {
                            container_id: container.container_id.clone(),
                            stream: match chunk.stream {
                                StreamType::Stdout => "stdout".to_string(),
                                StreamType::Stderr => "stderr".to_string(),
                            },
                            text,
                            timestamp: chunk.timestamp,
                        };
                        lock(&buffer).push(entry.clone());

                        if limiter.try_acquire() {
                            match serde_json::to_value(&entry) {
                                Ok(payload) => inner.publisher.publish_event(
                                    Channel::SessionLogs,
                                    &container.session_id,
                                    payload,
                                ),
                                Err(e) => debug!("Failed to encode log entry: {}", e),
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        session_id = %container.session_id,
                        container_id = %container.container_id,
                        "Log stream failed: {}", e
                    );
                    break SourceStatus::Error;
                }
                None => break SourceStatus::Stopped,
            }
        },
        Err(e) => {
            warn!(
                session_id = %container.session_id,
                container_id = %container.container_id,
                "Failed to open log stream: {}", e
            );
            SourceStatus::Error
        }
    };

    *lock(&status) = final_status;
    inner.publisher.publish_delta(
        Channel::SessionLogs,
        &container.session_id,
        serde_json::json!({
            "type": "source_update",
            "containerId": container.container_id,
            "status": final_status,
        }),
    );
    debug!(
        session_id = %container.session_id,
        container_id = %container.container_id,
        ?final_status,
        "Log stream ended"
    );
}
