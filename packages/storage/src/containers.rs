// ABOUTME: Container definition, dependency and session container repository functions
// ABOUTME: Definitions are project templates; session containers are their per-session instances

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;

use crate::{
    new_id, now_timestamp, parse_timestamp, ContainerDefinition, ContainerDependency,
    ContainerEnvVar, ContainerPort, ContainerStatus, ContainerWithDependencies,
    DependencyCondition, NewContainerDefinition, Result, SessionContainer, Storage, StorageError,
};

const SESSION_CONTAINER_COLUMNS: &str =
    "id, session_id, container_id, runtime_id, status, created_at, updated_at";

impl Storage {
    // ========================================================================
    // CONTAINER DEFINITIONS
    // ========================================================================

    pub async fn create_container_definition(
        &self,
        project_id: &str,
        definition: NewContainerDefinition,
    ) -> Result<ContainerDefinition> {
        let id = new_id("ctr");
        let now = now_timestamp();
        let command_json = definition
            .command
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO container_definitions (
                id, project_id, name, image, hostname, command, workspace_mount, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&id)
        .bind(project_id)
        .bind(&definition.name)
        .bind(&definition.image)
        .bind(&definition.hostname)
        .bind(&command_json)
        .bind(&definition.workspace_mount)
        .bind(&now)
        .execute(self.pool())
        .await?;

        Ok(ContainerDefinition {
            id,
            project_id: project_id.to_string(),
            name: definition.name,
            image: definition.image,
            hostname: definition.hostname,
            command: definition.command,
            workspace_mount: definition.workspace_mount,
            created_at: parse_timestamp(&now)?,
        })
    }

    pub async fn list_container_definitions(
        &self,
        project_id: &str,
    ) -> Result<Vec<ContainerDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, name, image, hostname, command, workspace_mount, created_at
            FROM container_definitions
            WHERE project_id = ?1
            ORDER BY created_at, rowid
            "#,
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_definition).collect()
    }

    pub async fn add_container_dependency(
        &self,
        container_id: &str,
        depends_on_container_id: &str,
        condition: DependencyCondition,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO container_dependencies (container_id, depends_on_container_id, condition)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(container_id)
        .bind(depends_on_container_id)
        .bind(condition.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Every definition of a project with its outgoing `dependsOn` edges.
    pub async fn list_containers_with_dependencies(
        &self,
        project_id: &str,
    ) -> Result<Vec<ContainerWithDependencies>> {
        let definitions = self.list_container_definitions(project_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT d.container_id, d.depends_on_container_id, d.condition
            FROM container_dependencies d
            JOIN container_definitions c ON c.id = d.container_id
            WHERE c.project_id = ?1
            ORDER BY d.id
            "#,
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;

        let mut edges: HashMap<String, Vec<ContainerDependency>> = HashMap::new();
        for row in rows {
            let dependency = ContainerDependency {
                container_id: row.get("container_id"),
                depends_on_container_id: row.get("depends_on_container_id"),
                condition: DependencyCondition::from_str(&row.get::<String, _>("condition"))?,
            };
            edges
                .entry(dependency.container_id.clone())
                .or_default()
                .push(dependency);
        }

        Ok(definitions
            .into_iter()
            .map(|definition| {
                let depends_on = edges.remove(&definition.id).unwrap_or_default();
                ContainerWithDependencies {
                    definition,
                    depends_on,
                }
            })
            .collect())
    }

    pub async fn add_container_port(
        &self,
        container_id: &str,
        port: u16,
        protocol: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO container_ports (container_id, port, protocol) VALUES (?1, ?2, ?3)",
        )
        .bind(container_id)
        .bind(port as i64)
        .bind(protocol)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_project_ports(&self, project_id: &str) -> Result<Vec<ContainerPort>> {
        let rows = sqlx::query(
            r#"
            SELECT p.container_id, p.port, p.protocol
            FROM container_ports p
            JOIN container_definitions c ON c.id = p.container_id
            WHERE c.project_id = ?1
            ORDER BY p.id
            "#,
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let port: i64 = row.get("port");
                Ok(ContainerPort {
                    container_id: row.get("container_id"),
                    port: u16::try_from(port)
                        .map_err(|_| StorageError::InvalidData(format!("port {}", port)))?,
                    protocol: row.get("protocol"),
                })
            })
            .collect()
    }

    pub async fn add_container_env_var(
        &self,
        container_id: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO container_env_vars (container_id, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT (container_id, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(container_id)
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_project_env_vars(&self, project_id: &str) -> Result<Vec<ContainerEnvVar>> {
        let rows = sqlx::query(
            r#"
            SELECT e.container_id, e.key, e.value
            FROM container_env_vars e
            JOIN container_definitions c ON c.id = e.container_id
            WHERE c.project_id = ?1
            ORDER BY e.id
            "#,
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ContainerEnvVar {
                container_id: row.get("container_id"),
                key: row.get("key"),
                value: row.get("value"),
            })
            .collect())
    }

    // ========================================================================
    // SESSION CONTAINERS
    // ========================================================================

    pub async fn create_session_container(
        &self,
        session_id: &str,
        container_id: &str,
        status: ContainerStatus,
    ) -> Result<SessionContainer> {
        let id = new_id("sc");
        let now = now_timestamp();

        sqlx::query(
            r#"
            INSERT INTO session_containers (
                id, session_id, container_id, runtime_id, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?5)
            "#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(container_id)
        .bind(status.as_str())
        .bind(&now)
        .execute(self.pool())
        .await?;

        let created_at = parse_timestamp(&now)?;
        Ok(SessionContainer {
            id,
            session_id: session_id.to_string(),
            container_id: container_id.to_string(),
            runtime_id: None,
            status,
            created_at,
            updated_at: created_at,
        })
    }

    pub async fn set_session_container_runtime_id(&self, id: &str, runtime_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE session_containers SET runtime_id = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(runtime_id)
        .bind(now_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("session container {}", id)));
        }
        Ok(())
    }

    pub async fn update_session_container_status(
        &self,
        id: &str,
        status: ContainerStatus,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE session_containers SET status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(status.as_str())
                .bind(now_timestamp())
                .bind(id)
                .execute(self.pool())
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("session container {}", id)));
        }
        Ok(())
    }

    /// Update by engine-assigned id. Returns `None` when the container is not session-owned.
    pub async fn update_session_container_status_by_runtime_id(
        &self,
        runtime_id: &str,
        status: ContainerStatus,
    ) -> Result<Option<SessionContainer>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE session_containers SET status = ?1, updated_at = ?2
            WHERE runtime_id = ?3
            RETURNING {}
            "#,
            SESSION_CONTAINER_COLUMNS
        ))
        .bind(status.as_str())
        .bind(now_timestamp())
        .bind(runtime_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(row_to_session_container).transpose()
    }

    pub async fn find_session_container_by_runtime_id(
        &self,
        runtime_id: &str,
    ) -> Result<Option<SessionContainer>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM session_containers WHERE runtime_id = ?1",
            SESSION_CONTAINER_COLUMNS
        ))
        .bind(runtime_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(row_to_session_container).transpose()
    }

    pub async fn list_session_containers(&self, session_id: &str) -> Result<Vec<SessionContainer>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM session_containers WHERE session_id = ?1 ORDER BY created_at, rowid",
            SESSION_CONTAINER_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_session_container).collect()
    }

    pub async fn list_session_containers_by_status(
        &self,
        status: ContainerStatus,
    ) -> Result<Vec<SessionContainer>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM session_containers WHERE status = ?1 ORDER BY created_at, rowid",
            SESSION_CONTAINER_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_session_container).collect()
    }

    /// Containers that have been handed to the engine, regardless of status.
    pub async fn list_session_containers_with_runtime(&self) -> Result<Vec<SessionContainer>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM session_containers WHERE runtime_id IS NOT NULL ORDER BY created_at, rowid",
            SESSION_CONTAINER_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_session_container).collect()
    }

    pub async fn delete_session_containers(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM session_containers WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_definition(row: SqliteRow) -> Result<ContainerDefinition> {
    let command = row
        .get::<Option<String>, _>("command")
        .map(|raw| serde_json::from_str::<Vec<String>>(&raw))
        .transpose()?;

    Ok(ContainerDefinition {
        id: row.get("id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        image: row.get("image"),
        hostname: row.get("hostname"),
        command,
        workspace_mount: row.get("workspace_mount"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
    })
}

fn row_to_session_container(row: SqliteRow) -> Result<SessionContainer> {
    Ok(SessionContainer {
        id: row.get("id"),
        session_id: row.get("session_id"),
        container_id: row.get("container_id"),
        runtime_id: row.get("runtime_id"),
        status: ContainerStatus::from_str(&row.get::<String, _>("status"))?,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}
