// ABOUTME: Resolves a project's container definitions into a validated, dependency-ordered plan
// ABOUTME: Fetches ports and env vars in parallel and groups containers into startup levels

use lab_storage::{
    ContainerDefinition, ContainerDependency, ContainerWithDependencies, Storage,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    SelfDependency {
        container_id: String,
    },
    MissingDependency {
        container_id: String,
        depends_on: String,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfDependency { container_id } => {
                write!(f, "container {} depends on itself", container_id)
            }
            Self::MissingDependency {
                container_id,
                depends_on,
            } => write!(
                f,
                "container {} depends on {} which is not part of the project",
                container_id, depends_on
            ),
        }
    }
}

/// Every problem found, so callers can report them all at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

pub fn validate_dependencies(containers: &[ContainerWithDependencies]) -> ValidationResult {
    let ids: HashSet<&str> = containers
        .iter()
        .map(|c| c.definition.id.as_str())
        .collect();

    let mut errors = Vec::new();
    for container in containers {
        for dependency in &container.depends_on {
            if dependency.depends_on_container_id == container.definition.id {
                errors.push(ValidationError::SelfDependency {
                    container_id: container.definition.id.clone(),
                });
            } else if !ids.contains(dependency.depends_on_container_id.as_str()) {
                errors.push(ValidationError::MissingDependency {
                    container_id: container.definition.id.clone(),
                    depends_on: dependency.depends_on_container_id.clone(),
                });
            }
        }
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
    }
}

/// Group containers into levels: every container's dependencies sit in earlier levels.
/// Within a level containers keep definition order. Fails on a cycle.
pub fn resolve_start_order(containers: &[ContainerWithDependencies]) -> Result<Vec<Vec<String>>> {
    let ids: HashSet<&str> = containers
        .iter()
        .map(|c| c.definition.id.as_str())
        .collect();

    let mut remaining_deps: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for container in containers {
        let id = container.definition.id.as_str();
        let deps: HashSet<&str> = container
            .depends_on
            .iter()
            .map(|d| d.depends_on_container_id.as_str())
            .filter(|d| ids.contains(d))
            .collect();
        remaining_deps.insert(id, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let order: Vec<&str> = containers
        .iter()
        .map(|c| c.definition.id.as_str())
        .collect();
    let mut levels = Vec::new();
    let mut placed = 0;
    let mut ready: Vec<&str> = order
        .iter()
        .copied()
        .filter(|id| remaining_deps.get(id) == Some(&0))
        .collect();

    while !ready.is_empty() {
        placed += ready.len();
        let mut next = HashSet::new();
        for id in &ready {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = remaining_deps.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.insert(*dependent);
                    }
                }
            }
        }
        levels.push(ready.iter().map(|id| id.to_string()).collect());
        ready = order.iter().copied().filter(|id| next.contains(id)).collect();
    }

    if placed < order.len() {
        let mut stuck: Vec<String> = remaining_deps
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        stuck.sort();
        return Err(OrchestratorError::DependencyCycle(stuck));
    }

    Ok(levels)
}

#[derive(Debug, Clone)]
pub struct PreparedContainer {
    pub definition: ContainerDefinition,
    pub depends_on: Vec<ContainerDependency>,
    pub ports: Vec<u16>,
    pub env_vars: HashMap<String, String>,
    /// Host directory mounted at `definition.workspace_mount`
    pub workspace_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PreparedSession {
    pub session_id: String,
    pub project_id: String,
    pub containers: HashMap<String, PreparedContainer>,
    pub levels: Vec<Vec<String>>,
}

impl PreparedSession {
    pub fn container(&self, container_id: &str) -> Option<&PreparedContainer> {
        self.containers.get(container_id)
    }
}

#[derive(Clone)]
pub struct ContainerPreparer {
    storage: Storage,
    workspaces_root: PathBuf,
}

impl ContainerPreparer {
    pub fn new(storage: Storage, workspaces_root: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            workspaces_root: workspaces_root.into(),
        }
    }

    pub async fn prepare(&self, session_id: &str, project_id: &str) -> Result<PreparedSession> {
        let (containers, ports, env_vars) = tokio::try_join!(
            self.storage.list_containers_with_dependencies(project_id),
            self.storage.list_project_ports(project_id),
            self.storage.list_project_env_vars(project_id),
        )?;

        if containers.is_empty() {
            return Err(OrchestratorError::NoContainerDefinitions(
                project_id.to_string(),
            ));
        }

        let validation = validate_dependencies(&containers);
        if !validation.valid {
            return Err(OrchestratorError::InvalidDependencies(
                validation.errors.iter().map(|e| e.to_string()).collect(),
            ));
        }

        let levels = resolve_start_order(&containers)?;

        let mut ports_by_container: HashMap<String, Vec<u16>> = HashMap::new();
        for port in ports {
            ports_by_container
                .entry(port.container_id)
                .or_default()
                .push(port.port);
        }
        let mut env_by_container: HashMap<String, HashMap<String, String>> = HashMap::new();
        for var in env_vars {
            env_by_container
                .entry(var.container_id)
                .or_default()
                .insert(var.key, var.value);
        }

        let session_workspace = self.workspaces_root.join(session_id);
        let containers: HashMap<String, PreparedContainer> = containers
            .into_iter()
            .map(|c| {
                let id = c.definition.id.clone();
                let workspace_path = c
                    .definition
                    .workspace_mount
                    .as_ref()
                    .map(|_| session_workspace.clone());
                let prepared = PreparedContainer {
                    ports: ports_by_container.remove(&id).unwrap_or_default(),
                    env_vars: env_by_container.remove(&id).unwrap_or_default(),
                    workspace_path,
                    definition: c.definition,
                    depends_on: c.depends_on,
                };
                (id, prepared)
            })
            .collect();

        debug!(
            session_id,
            project_id,
            containers = containers.len(),
            levels = levels.len(),
            "Prepared session containers"
        );

        Ok(PreparedSession {
            session_id: session_id.to_string(),
            project_id: project_id.to_string(),
            containers,
            levels,
        })
    }
}
