// ABOUTME: Auxiliary services spawned next to a session's primary containers
// ABOUTME: Sidecar failures are reported per provider and never fail session startup

use async_trait::async_trait;
use lab_sandbox::naming::{self, SIDECAR_LABEL};
use lab_sandbox::{ensure_image, ContainerSpec, PortMapping, SandboxProvider, VolumeMount};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;

#[async_trait]
pub trait SidecarProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn spawn_for_session(&self, session_id: &str, project_id: &str) -> Result<()>;

    async fn destroy_for_session(&self, session_id: &str) -> Result<()>;
}

/// A sidecar backed by one container joined to the session network under its own name.
pub struct ContainerSidecar {
    provider: Arc<dyn SandboxProvider>,
    name: String,
    image: String,
    env_vars: HashMap<String, String>,
    port: Option<u16>,
    workspaces_root: PathBuf,
}

impl ContainerSidecar {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        name: impl Into<String>,
        image: impl Into<String>,
        workspaces_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            name: name.into(),
            image: image.into(),
            env_vars: HashMap::new(),
            port: None,
            workspaces_root: workspaces_root.into(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Publish `port` on an engine-chosen host port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    async fn discard(&self, session_id: &str, runtime_id: &str) {
        if let Err(e) = self.provider.remove_container(runtime_id, true).await {
            warn!(session_id, sidecar = %self.name, runtime_id, "Failed to remove sidecar container: {}", e);
        }
    }

    fn spec(&self, session_id: &str, project_id: &str) -> ContainerSpec {
        let mut labels = naming::session_labels(session_id, project_id);
        labels.insert(SIDECAR_LABEL.to_string(), self.name.clone());
        let workspace = self.workspaces_root.join(session_id);

        ContainerSpec {
            name: naming::container_name(session_id, &self.name),
            image: self.image.clone(),
            hostname: Some(self.name.clone()),
            working_dir: Some("/workspace".to_string()),
            env_vars: self.env_vars.clone(),
            volumes: vec![VolumeMount {
                host_path: workspace.to_string_lossy().into_owned(),
                container_path: "/workspace".to_string(),
                readonly: false,
            }],
            ports: self
                .port
                .map(|port| PortMapping {
                    container_port: port,
                    host_port: None,
                    protocol: "tcp".to_string(),
                })
                .into_iter()
                .collect(),
            labels,
            ..Default::default()
        }
    }
}

#[async_trait]
impl SidecarProvider for ContainerSidecar {
    fn name(&self) -> &str {
        &self.name
    }

    async fn spawn_for_session(&self, session_id: &str, project_id: &str) -> Result<()> {
        ensure_image(self.provider.as_ref(), &self.image).await?;

        let spec = self.spec(session_id, project_id);
        let runtime_id = self.provider.create_container(&spec).await?;

        if let Err(e) = self.provider.start_container(&runtime_id).await {
            self.discard(session_id, &runtime_id).await;
            return Err(e.into());
        }

        let network = naming::network_name(session_id);
        if let Err(e) = self
            .provider
            .connect_network(&network, &runtime_id, vec![self.name.clone()])
            .await
        {
            self.discard(session_id, &runtime_id).await;
            return Err(e.into());
        }

        info!(session_id, sidecar = %self.name, runtime_id = %runtime_id, "Sidecar started");
        Ok(())
    }

    async fn destroy_for_session(&self, session_id: &str) -> Result<()> {
        let name = naming::container_name(session_id, &self.name);
        match self.provider.remove_container(&name, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(session_id, sidecar = %self.name, "Failed to remove sidecar: {}", e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;

    #[tokio::test]
    async fn test_spawn_pulls_image_and_joins_session_network() {
        let runtime = Arc::new(FakeRuntime::new());
        let sidecar = ContainerSidecar::new(runtime.clone(), "agent", "lab-agent:latest", "/ws")
            .with_env("MODE", "sandbox")
            .with_port(3000);

        sidecar.spawn_for_session("s1", "p1").await.unwrap();

        assert_eq!(runtime.calls_matching("pull:"), vec!["pull:lab-agent:latest"]);
        let container = runtime.container("lab-s1-agent").unwrap();
        assert!(container.running);
        assert_eq!(container.networks, vec!["lab-session-s1".to_string()]);
        assert_eq!(container.spec.labels.get(SIDECAR_LABEL).map(String::as_str), Some("agent"));
        assert_eq!(container.spec.volumes[0].host_path, "/ws/s1");
        assert_eq!(container.spec.ports[0].host_port, None);

        sidecar.destroy_for_session("s1").await.unwrap();
        assert!(runtime.container("lab-s1-agent").is_none());
        // Already gone
        sidecar.destroy_for_session("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_network_attach_removes_container() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_image("lab-agent:latest");
        runtime.fail_connect_for("-agent");
        let sidecar = ContainerSidecar::new(runtime.clone(), "agent", "lab-agent:latest", "/ws");

        assert!(sidecar.spawn_for_session("s1", "p1").await.is_err());
        assert!(runtime.container("lab-s1-agent").is_none());
        assert!(runtime.calls_matching("pull:").is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_removes_container() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_image("lab-agent:latest");
        runtime.fail_start_for("-agent");
        let sidecar = ContainerSidecar::new(runtime.clone(), "agent", "lab-agent:latest", "/ws");

        assert!(sidecar.spawn_for_session("s1", "p1").await.is_err());
        assert_eq!(runtime.calls_matching("remove:"), vec!["remove:lab-s1-agent"]);
        assert!(runtime.container("lab-s1-agent").is_none());
    }
}
