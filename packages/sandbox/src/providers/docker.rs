// ABOUTME: Docker provider implementation of the runtime provider trait
// ABOUTME: Uses bollard for containers, images, networks, log streams and engine events

use super::{
    ContainerEvent, ContainerInspect, ContainerSpec, ContainerState, EventStream, HealthStatus,
    LogChunk, LogStream, LogStreamOptions, NetworkInfo, Provider, ProviderError, Result,
    StreamType,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, NetworkingConfig,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    models::{EndpointSettings, HostConfig, PortBinding},
    network::{
        ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions,
        ListNetworksOptions,
    },
    system::EventsOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Label set on everything this provider creates.
pub const MANAGED_LABEL: &str = "lab.managed";

pub struct DockerProvider {
    client: Docker,
    /// Images pulled by this process, keyed by reference
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Connect with the default pull timeout (10 minutes)
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client_and_timeout(client, timeout))
    }

    pub fn with_client_and_timeout(client: Docker, timeout: Duration) -> Self {
        Self {
            client,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: timeout,
        }
    }
}

/// Map an engine error, turning 404 responses into `NotFound`.
fn engine_error(kind: fn(String) -> ProviderError, e: bollard::errors::Error) -> ProviderError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => ProviderError::NotFound(message),
        other => kind(other.to_string()),
    }
}

fn is_status(e: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

pub(crate) fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
    let mut labels = spec.labels.clone();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &spec.ports {
        let key = format!("{}/{}", port.container_port, port.protocol);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.host_port.map(|p| p.to_string()).unwrap_or_default()),
            }]),
        );
    }

    let binds: Vec<String> = spec
        .volumes
        .iter()
        .map(|v| {
            format!(
                "{}:{}:{}",
                v.host_path,
                v.container_path,
                if v.readonly { "ro" } else { "rw" }
            )
        })
        .collect();

    let mut env: Vec<String> = spec
        .env_vars
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();

    let host_config = HostConfig {
        binds: if binds.is_empty() { None } else { Some(binds) },
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        ..Default::default()
    };

    let networking_config = spec.network.as_ref().map(|attachment| NetworkingConfig {
        endpoints_config: HashMap::from([(
            attachment.network.clone(),
            EndpointSettings {
                aliases: Some(attachment.aliases.clone()),
                ..Default::default()
            },
        )]),
    });

    Config {
        image: Some(spec.image.clone()),
        hostname: spec.hostname.clone(),
        cmd: spec.command.clone(),
        env: Some(env),
        working_dir: spec.working_dir.clone(),
        labels: Some(labels),
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        host_config: Some(host_config),
        networking_config,
        ..Default::default()
    }
}

fn to_log_chunk(output: LogOutput) -> Option<LogChunk> {
    let (stream, data) = match output {
        LogOutput::StdOut { message } => (StreamType::Stdout, message.to_vec()),
        LogOutput::StdErr { message } => (StreamType::Stderr, message.to_vec()),
        LogOutput::Console { message } => (StreamType::Stdout, message.to_vec()),
        LogOutput::StdIn { .. } => return None,
    };
    Some(LogChunk {
        timestamp: chrono::Utc::now(),
        stream,
        data,
    })
}

#[async_trait]
impl Provider for DockerProvider {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), to_bollard_config(spec))
            .await
            .map_err(|e| engine_error(ProviderError::ContainerError, e))?;

        debug!("Created container {} ({})", spec.name, container.id);
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!("Starting container: {}", container_id);

        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // Already started
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(engine_error(ProviderError::ContainerError, e)),
        }
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            container_id, timeout_secs
        );

        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 304) => {
                debug!("Container {} already stopped", container_id);
                Ok(())
            }
            Err(e) => Err(engine_error(ProviderError::ContainerError, e)),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container_id, force);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(engine_error(ProviderError::ContainerError, e)),
        }
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspect> {
        let inspect = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| engine_error(ProviderError::ContainerError, e))?;

        let state = inspect.state.as_ref().ok_or_else(|| {
            ProviderError::ContainerError("Container has no state information".to_string())
        })?;

        let status = ContainerState::parse(
            state
                .status
                .as_ref()
                .map(|s| s.as_ref())
                .unwrap_or("unknown"),
        );

        let health = state
            .health
            .as_ref()
            .and_then(|h| h.status.as_ref())
            .and_then(|s| HealthStatus::parse(s.as_ref()));

        let mut ports = HashMap::new();
        let port_map = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref());
        for (container_port, bindings) in port_map.into_iter().flatten() {
            let host_port = bindings
                .as_ref()
                .and_then(|b| b.first())
                .and_then(|b| b.host_port.as_ref())
                .and_then(|p| p.parse::<u16>().ok());
            let container_port = container_port
                .split('/')
                .next()
                .and_then(|p| p.parse::<u16>().ok());
            if let (Some(container_port), Some(host_port)) = (container_port, host_port) {
                ports.insert(container_port, host_port);
            }
        }

        Ok(ContainerInspect {
            id: inspect.id.clone().unwrap_or_else(|| container_id.to_string()),
            name: inspect
                .name
                .clone()
                .unwrap_or_else(|| container_id.to_string())
                .trim_start_matches('/')
                .to_string(),
            state: status,
            health,
            ports,
        })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) && self.image_exists(image).await? {
            debug!("Image {} found in cache, skipping pull", image);
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status for {}: {}", image, status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }

    async fn stream_logs(&self, container_id: &str, options: LogStreamOptions) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: options.follow,
            tail: options
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let stream = self
            .client
            .logs(container_id, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(output) => to_log_chunk(output).map(Ok),
                    Err(e) => Some(Err(engine_error(ProviderError::ContainerError, e))),
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn create_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<String> {
        info!("Creating network: {}", name);

        let mut labels = labels;
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            labels,
            ..Default::default()
        };

        match self.client.create_network(options).await {
            Ok(_) => Ok(name.to_string()),
            // Name already taken by an earlier attempt
            Err(e) if is_status(&e, 409) => {
                debug!("Network {} already exists", name);
                Ok(name.to_string())
            }
            Err(e) => Err(engine_error(ProviderError::NetworkError, e)),
        }
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        info!("Removing network: {}", name);

        match self.client.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(engine_error(ProviderError::NetworkError, e)),
        }
    }

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: Vec<String>,
    ) -> Result<()> {
        debug!("Connecting {} to network {}", container_id, network);

        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: EndpointSettings {
                aliases: Some(aliases),
                ..Default::default()
            },
        };

        self.client
            .connect_network(network, options)
            .await
            .map_err(|e| engine_error(ProviderError::NetworkError, e))
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container_id: &str,
        force: bool,
    ) -> Result<()> {
        debug!("Disconnecting {} from network {}", container_id, network);

        let options = DisconnectNetworkOptions {
            container: container_id.to_string(),
            force,
        };

        self.client
            .disconnect_network(network, options)
            .await
            .map_err(|e| engine_error(ProviderError::NetworkError, e))
    }

    async fn list_networks(&self, label: &str) -> Result<Vec<NetworkInfo>> {
        let options = ListNetworksOptions {
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
        };

        let networks = self
            .client
            .list_networks(Some(options))
            .await
            .map_err(|e| engine_error(ProviderError::NetworkError, e))?;

        Ok(networks
            .into_iter()
            .filter_map(|n| {
                Some(NetworkInfo {
                    id: n.id?,
                    name: n.name?,
                    labels: n.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn container_events(&self) -> Result<EventStream> {
        let options = EventsOptions::<String> {
            filters: HashMap::from([
                ("type".to_string(), vec!["container".to_string()]),
                ("label".to_string(), vec![MANAGED_LABEL.to_string()]),
            ]),
            ..Default::default()
        };

        let stream = self
            .client
            .events(Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(message) => {
                        let action = message.action?;
                        let actor = message.actor?;
                        Some(Ok(ContainerEvent {
                            runtime_id: actor.id?,
                            action,
                            attributes: actor.attributes.unwrap_or_default(),
                        }))
                    }
                    Err(e) => Some(Err(ProviderError::ConnectionError(e.to_string()))),
                }
            })
            .boxed();

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{NetworkAttachment, PortMapping, VolumeMount};

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "lab-s1-web".to_string(),
            image: "nginx:alpine".to_string(),
            hostname: Some("web".to_string()),
            command: Some(vec!["nginx".to_string(), "-g".to_string()]),
            env_vars: HashMap::from([
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "1".to_string()),
            ]),
            volumes: vec![VolumeMount {
                host_path: "/workspaces/s1".to_string(),
                container_path: "/workspace".to_string(),
                readonly: false,
            }],
            ports: vec![PortMapping {
                container_port: 80,
                host_port: None,
                protocol: "tcp".to_string(),
            }],
            labels: HashMap::from([("lab.session".to_string(), "s1".to_string())]),
            network: Some(NetworkAttachment {
                network: "lab-session-s1".to_string(),
                aliases: vec!["web".to_string()],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_spec_conversion_sets_labels_env_and_network() {
        let config = to_bollard_config(&spec());

        let labels = config.labels.unwrap();
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get("lab.session").map(String::as_str), Some("s1"));
        assert_eq!(
            config.env,
            Some(vec!["A=1".to_string(), "B=2".to_string()])
        );
        assert_eq!(config.hostname.as_deref(), Some("web"));

        let endpoints = config.networking_config.unwrap().endpoints_config;
        let endpoint = endpoints.get("lab-session-s1").unwrap();
        assert_eq!(endpoint.aliases, Some(vec!["web".to_string()]));
    }

    #[test]
    fn test_unpinned_port_lets_engine_choose() {
        let config = to_bollard_config(&spec());
        let host_config = config.host_config.unwrap();
        let bindings = host_config.port_bindings.unwrap();
        let binding = bindings.get("80/tcp").unwrap().as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some(""));
        assert_eq!(
            host_config.binds,
            Some(vec!["/workspaces/s1:/workspace:rw".to_string()])
        );
    }

    #[test]
    fn test_stdin_output_is_skipped() {
        let chunk = to_log_chunk(LogOutput::StdErr {
            message: "oops\n".into(),
        })
        .unwrap();
        assert_eq!(chunk.stream, StreamType::Stderr);
        assert_eq!(chunk.data, b"oops\n");
        assert!(to_log_chunk(LogOutput::StdIn {
            message: "x".into()
        })
        .is_none());
    }
}
