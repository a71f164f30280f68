// ABOUTME: In-process fakes for the container runtime, browser daemon and publisher
// ABOUTME: Record every call so tests can assert on ordering and rollback behaviour

use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use lab_sandbox::{
    ContainerEvent, ContainerInspect, ContainerSpec, ContainerState, EventStream, HealthStatus,
    LogChunk, LogStream, LogStreamOptions, NetworkInfo, ProviderError, SandboxProvider,
    StreamType,
};
use lab_storage::{ContainerStatus, DependencyCondition, NewContainerDefinition, SessionStatus, Storage};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::browser::{DaemonController, DaemonError, DaemonStatus, StartOptions};
use crate::publisher::{Channel, Message, Publisher};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub health: Option<HealthStatus>,
    pub networks: Vec<String>,
}

#[derive(Default)]
struct RuntimeState {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    networks: HashMap<String, HashMap<String, String>>,
    images: HashSet<String>,
    fail_start: HashSet<String>,
    fail_connect: HashSet<String>,
    health: HashMap<String, HealthStatus>,
    logs: HashMap<String, Vec<(StreamType, String)>>,
    keep_logs_open: bool,
    calls: Vec<String>,
    event_senders: Vec<mpsc::UnboundedSender<lab_sandbox::providers::Result<ContainerEvent>>>,
}

/// Container runtime double keyed by container name.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starting any container whose name ends with `suffix` fails.
    pub fn fail_start_for(&self, suffix: &str) {
        lock(&self.state).fail_start.insert(suffix.to_string());
    }

    pub fn fail_connect_for(&self, suffix: &str) {
        lock(&self.state).fail_connect.insert(suffix.to_string());
    }

    /// Health reported by containers whose name ends with `suffix` once started.
    pub fn set_health(&self, suffix: &str, health: HealthStatus) {
        let mut state = lock(&self.state);
        state.health.insert(suffix.to_string(), health);
        for container in state.containers.values_mut() {
            if container.name.ends_with(suffix) && container.running {
                container.health = Some(health);
            }
        }
    }

    pub fn set_logs(&self, suffix: &str, lines: &[(StreamType, &str)]) {
        lock(&self.state).logs.insert(
            suffix.to_string(),
            lines.iter().map(|(s, l)| (*s, l.to_string())).collect(),
        );
    }

    /// Keep log streams open after their canned lines, like `follow` on a live container.
    pub fn keep_logs_open(&self) {
        lock(&self.state).keep_logs_open = true;
    }

    pub fn add_image(&self, image: &str) {
        lock(&self.state).images.insert(image.to_string());
    }

    pub fn add_network(&self, name: &str, labels: HashMap<String, String>) {
        lock(&self.state).networks.insert(name.to_string(), labels);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state)
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        lock(&self.state)
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn runtime_id(&self, name: &str) -> Option<String> {
        lock(&self.state)
            .containers
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, _)| id.clone())
    }

    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).networks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Mark a container as exited without going through the provider API.
    pub fn kill(&self, name: &str) {
        if let Some(container) = lock(&self.state)
            .containers
            .values_mut()
            .find(|c| c.name == name)
        {
            container.running = false;
        }
    }

    pub fn emit_event(&self, runtime_id: &str, action: &str) {
        let event = ContainerEvent {
            runtime_id: runtime_id.to_string(),
            action: action.to_string(),
            attributes: HashMap::new(),
        };
        let mut state = lock(&self.state);
        state
            .event_senders
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }

    /// End every open event stream with an error, as a dropped engine connection would.
    pub fn break_event_streams(&self) {
        let senders: Vec<_> = lock(&self.state).event_senders.drain(..).collect();
        for tx in senders {
            let _ = tx.unbounded_send(Err(ProviderError::ConnectionError("engine went away".into())));
        }
    }

    pub fn event_subscribers(&self) -> usize {
        lock(&self.state).event_senders.len()
    }

    fn record(state: &mut RuntimeState, call: String) {
        state.calls.push(call);
    }
}

fn name_matches(set: &HashSet<String>, name: &str) -> bool {
    set.iter().any(|suffix| name.ends_with(suffix.as_str()))
}

#[async_trait]
impl SandboxProvider for FakeRuntime {
    async fn is_available(&self) -> lab_sandbox::providers::Result<bool> {
        Ok(true)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> lab_sandbox::providers::Result<String> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = format!("rt{}", state.next_id);
        Self::record(&mut state, format!("create:{}", spec.name));
        let networks = spec.network.iter().map(|n| n.network.clone()).collect();
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                spec: spec.clone(),
                running: false,
                health: None,
                networks,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> lab_sandbox::providers::Result<()> {
        let mut state = lock(&self.state);
        let Some(name) = state.containers.get(container_id).map(|c| c.name.clone()) else {
            return Err(ProviderError::NotFound(container_id.to_string()));
        };
        Self::record(&mut state, format!("start:{}", name));
        if name_matches(&state.fail_start, &name) {
            return Err(ProviderError::ContainerError(format!("{} failed to start", name)));
        }
        let health = state
            .health
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix.as_str()))
            .map(|(_, h)| *h);
        if let Some(container) = state.containers.get_mut(container_id) {
            container.running = true;
            container.health = health;
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_secs: u64,
    ) -> lab_sandbox::providers::Result<()> {
        let mut state = lock(&self.state);
        let Some(name) = state.containers.get(container_id).map(|c| c.name.clone()) else {
            return Err(ProviderError::NotFound(container_id.to_string()));
        };
        Self::record(&mut state, format!("stop:{}", name));
        if let Some(container) = state.containers.get_mut(container_id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(
        &self,
        container_id: &str,
        _force: bool,
    ) -> lab_sandbox::providers::Result<()> {
        let mut state = lock(&self.state);
        // Sidecars are removed by name
        let id = if state.containers.contains_key(container_id) {
            Some(container_id.to_string())
        } else {
            state
                .containers
                .iter()
                .find(|(_, c)| c.name == container_id)
                .map(|(id, _)| id.clone())
        };
        if let Some(id) = id {
            if let Some(container) = state.containers.remove(&id) {
                Self::record(&mut state, format!("remove:{}", container.name));
            }
        }
        Ok(())
    }

    async fn inspect_container(
        &self,
        container_id: &str,
    ) -> lab_sandbox::providers::Result<ContainerInspect> {
        let state = lock(&self.state);
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        Ok(ContainerInspect {
            id: container_id.to_string(),
            name: container.name.clone(),
            state: if container.running {
                ContainerState::Running
            } else {
                ContainerState::Exited
            },
            health: container.health,
            ports: HashMap::new(),
        })
    }

    async fn pull_image(&self, image: &str) -> lab_sandbox::providers::Result<()> {
        let mut state = lock(&self.state);
        Self::record(&mut state, format!("pull:{}", image));
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> lab_sandbox::providers::Result<bool> {
        Ok(lock(&self.state).images.contains(image))
    }

    async fn stream_logs(
        &self,
        container_id: &str,
        _options: LogStreamOptions,
    ) -> lab_sandbox::providers::Result<LogStream> {
        let state = lock(&self.state);
        let name = state
            .containers
            .get(container_id)
            .map(|c| c.name.clone())
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        let lines = state
            .logs
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix.as_str()))
            .map(|(_, lines)| lines.clone())
            .unwrap_or_default();
        let chunks: Vec<lab_sandbox::providers::Result<LogChunk>> = lines
            .into_iter()
            .map(|(stream, line)| {
                Ok(LogChunk {
                    timestamp: Utc::now(),
                    stream,
                    data: format!("{}\n", line).into_bytes(),
                })
            })
            .collect();
        let canned = futures::stream::iter(chunks);
        if state.keep_logs_open {
            Ok(canned.chain(futures::stream::pending()).boxed())
        } else {
            Ok(canned.boxed())
        }
    }

    async fn create_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> lab_sandbox::providers::Result<String> {
        let mut state = lock(&self.state);
        Self::record(&mut state, format!("create_network:{}", name));
        state.networks.insert(name.to_string(), labels);
        Ok(format!("net-{}", name))
    }

    async fn remove_network(&self, name: &str) -> lab_sandbox::providers::Result<()> {
        let mut state = lock(&self.state);
        Self::record(&mut state, format!("remove_network:{}", name));
        state.networks.remove(name);
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: Vec<String>,
    ) -> lab_sandbox::providers::Result<()> {
        let mut state = lock(&self.state);
        let Some(name) = state.containers.get(container_id).map(|c| c.name.clone()) else {
            return Err(ProviderError::NotFound(container_id.to_string()));
        };
        Self::record(
            &mut state,
            format!("connect:{}:{}:{}", network, name, aliases.join(",")),
        );
        if name_matches(&state.fail_connect, &name) {
            return Err(ProviderError::NetworkError(format!("cannot attach {}", name)));
        }
        if let Some(container) = state.containers.get_mut(container_id) {
            container.networks.push(network.to_string());
        }
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container_id: &str,
        _force: bool,
    ) -> lab_sandbox::providers::Result<()> {
        let mut state = lock(&self.state);
        if let Some(name) = state.containers.get(container_id).map(|c| c.name.clone()) {
            Self::record(&mut state, format!("disconnect:{}:{}", network, name));
        }
        if let Some(container) = state.containers.get_mut(container_id) {
            container.networks.retain(|n| n != network);
        }
        Ok(())
    }

    async fn list_networks(&self, label: &str) -> lab_sandbox::providers::Result<Vec<NetworkInfo>> {
        Ok(lock(&self.state)
            .networks
            .iter()
            .filter(|(_, labels)| labels.contains_key(label))
            .map(|(name, labels)| NetworkInfo {
                id: format!("net-{}", name),
                name: name.clone(),
                labels: labels.clone(),
            })
            .collect())
    }

    async fn container_events(&self) -> lab_sandbox::providers::Result<EventStream> {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.state).event_senders.push(tx);
        Ok(rx.boxed())
    }
}

#[derive(Default)]
struct DaemonState {
    running: HashMap<String, (u16, bool)>,
    current_urls: HashMap<String, String>,
    ready_on_start: bool,
    fail_start: bool,
    fail_stop: bool,
    starts: Vec<(String, Option<u16>)>,
    stops: Vec<String>,
    launches: Vec<String>,
    navigations: Vec<(String, String)>,
}

#[derive(Default)]
pub struct FakeDaemon {
    state: Mutex<DaemonState>,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_on_start(&self) {
        lock(&self.state).ready_on_start = true;
    }

    pub fn fail_starts(&self, fail: bool) {
        lock(&self.state).fail_start = fail;
    }

    pub fn fail_stops(&self, fail: bool) {
        lock(&self.state).fail_stop = fail;
    }

    pub fn set_ready(&self, session_id: &str) {
        if let Some(entry) = lock(&self.state).running.get_mut(session_id) {
            entry.1 = true;
        }
    }

    pub fn crash(&self, session_id: &str) {
        lock(&self.state).running.remove(session_id);
    }

    pub fn set_current_url(&self, session_id: &str, url: &str) {
        lock(&self.state)
            .current_urls
            .insert(session_id.to_string(), url.to_string());
    }

    pub fn starts(&self) -> Vec<(String, Option<u16>)> {
        lock(&self.state).starts.clone()
    }

    pub fn stops(&self) -> Vec<String> {
        lock(&self.state).stops.clone()
    }

    pub fn launches(&self) -> Vec<String> {
        lock(&self.state).launches.clone()
    }

    pub fn navigations(&self) -> Vec<(String, String)> {
        lock(&self.state).navigations.clone()
    }
}

#[async_trait]
impl DaemonController for FakeDaemon {
    async fn start(
        &self,
        session_id: &str,
        options: StartOptions,
    ) -> Result<u16, DaemonError> {
        let mut state = lock(&self.state);
        state.starts.push((session_id.to_string(), options.stream_port));
        if state.fail_start {
            return Err(DaemonError::Status {
                status: 500,
                body: "browser failed to launch".to_string(),
            });
        }
        let port = options.stream_port.unwrap_or(9999);
        let ready = state.ready_on_start;
        state.running.insert(session_id.to_string(), (port, ready));
        Ok(port)
    }

    async fn stop(&self, session_id: &str) -> Result<(), DaemonError> {
        let mut state = lock(&self.state);
        state.stops.push(session_id.to_string());
        if state.fail_stop {
            return Err(DaemonError::Status {
                status: 500,
                body: "stop failed".to_string(),
            });
        }
        state.running.remove(session_id);
        Ok(())
    }

    async fn get_status(&self, session_id: &str) -> Result<DaemonStatus, DaemonError> {
        Ok(match lock(&self.state).running.get(session_id) {
            Some((port, ready)) => DaemonStatus {
                running: true,
                ready: *ready,
                port: Some(*port),
            },
            None => DaemonStatus::default(),
        })
    }

    async fn launch(&self, session_id: &str) -> Result<(), DaemonError> {
        lock(&self.state).launches.push(session_id.to_string());
        Ok(())
    }

    async fn navigate(&self, session_id: &str, url: &str) -> Result<(), DaemonError> {
        lock(&self.state)
            .navigations
            .push((session_id.to_string(), url.to_string()));
        Ok(())
    }

    async fn get_current_url(&self, session_id: &str) -> Result<Option<String>, DaemonError> {
        Ok(lock(&self.state).current_urls.get(session_id).cloned())
    }

    async fn health(&self) -> Result<bool, DaemonError> {
        Ok(true)
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<Message>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.messages).clone()
    }

    pub fn on_channel(&self, channel: Channel) -> Vec<Message> {
        self.messages()
            .into_iter()
            .filter(|m| m.channel == channel)
            .collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, message: Message) {
        lock(&self.messages).push(message);
    }
}

/// Project `p1` with containers named a, b, c where c depends on b and b on a.
/// Returns the container definition ids in that order.
pub async fn chain_project(storage: &Storage) -> Vec<String> {
    storage.create_project("p1", "Chain").await.expect("project");
    let mut ids: Vec<String> = Vec::new();
    for name in ["a", "b", "c"] {
        let definition = storage
            .create_container_definition(
                "p1",
                NewContainerDefinition {
                    name: name.to_string(),
                    image: format!("img-{}", name),
                    hostname: Some(name.to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("definition");
        if let Some(previous) = ids.last() {
            storage
                .add_container_dependency(&definition.id, previous, DependencyCondition::Started)
                .await
                .expect("dependency");
        }
        ids.push(definition.id);
    }
    ids
}

/// Session row in `status` plus one `starting` session container per definition.
pub async fn session_with_rows(storage: &Storage, project_id: &str, status: SessionStatus) -> String {
    let session = storage
        .create_session(project_id, status, None)
        .await
        .expect("session");
    for definition in storage
        .list_container_definitions(project_id)
        .await
        .expect("definitions")
    {
        storage
            .create_session_container(&session.id, &definition.id, ContainerStatus::Starting)
            .await
            .expect("session container");
    }
    session.id
}
