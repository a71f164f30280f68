// ABOUTME: Project and session repository functions
// ABOUTME: Includes the atomic pooled-session claim used by the pool manager

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use crate::{
    new_id, now_timestamp, parse_timestamp, Project, Result, Session, SessionStatus, Storage,
    StorageError,
};

const SESSION_COLUMNS: &str = "id, project_id, status, title, created_at, updated_at";

impl Storage {
    // ========================================================================
    // PROJECTS
    // ========================================================================

    pub async fn create_project(&self, id: &str, name: &str) -> Result<Project> {
        let now = now_timestamp();
        sqlx::query("INSERT INTO projects (id, name, created_at) VALUES (?1, ?2, ?3)")
            .bind(id)
            .bind(name)
            .bind(&now)
            .execute(self.pool())
            .await?;

        Ok(Project {
            id: id.to_string(),
            name: name.to_string(),
            created_at: parse_timestamp(&now)?,
        })
    }

    pub async fn list_project_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM projects ORDER BY created_at, id")
            .fetch_all(self.pool())
            .await?;
        Ok(ids)
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    pub async fn create_session(
        &self,
        project_id: &str,
        status: SessionStatus,
        title: Option<&str>,
    ) -> Result<Session> {
        self.insert_session(project_id, status, title, true).await
    }

    async fn insert_session(
        &self,
        project_id: &str,
        status: SessionStatus,
        title: Option<&str>,
        ready: bool,
    ) -> Result<Session> {
        let id = new_id("ses");
        let now = now_timestamp();

        sqlx::query(
            r#"
            INSERT INTO sessions (id, project_id, status, title, ready, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
        )
        .bind(&id)
        .bind(project_id)
        .bind(status.as_str())
        .bind(title)
        .bind(ready)
        .bind(&now)
        .execute(self.pool())
        .await?;

        let created_at = parse_timestamp(&now)?;
        Ok(Session {
            id,
            project_id: project_id.to_string(),
            status,
            title: title.map(str::to_string),
            created_at,
            updated_at: created_at,
        })
    }

    /// Insert a pooled session that claims skip until [`Storage::mark_pooled_session_ready`].
    pub async fn create_warming_session(&self, project_id: &str) -> Result<Session> {
        self.insert_session(project_id, SessionStatus::Pooled, None, false).await
    }

    /// Make a warming pooled session claimable. `false` when it is no longer pooled.
    pub async fn mark_pooled_session_ready(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET ready = 1, updated_at = ?1 WHERE id = ?2 AND status = 'pooled'",
        )
        .bind(now_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a session to `deleting` only while it is still pooled. A session that was
    /// claimed in the meantime is left alone and `false` is returned.
    pub async fn begin_pooled_session_removal(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET status = 'deleting', updated_at = ?1 WHERE id = ?2 AND status = 'pooled'",
        )
        .bind(now_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Pooled sessions whose initialization never finished.
    pub async fn list_warming_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE status = 'pooled' AND ready = 0 ORDER BY created_at, rowid",
            SESSION_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_session).collect()
    }

    pub async fn get_session(&self, id: &str) -> Result<Session> {
        self.find_session(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("session {}", id)))
    }

    pub async fn find_session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE id = ?1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.map(row_to_session).transpose()
    }

    pub async fn list_sessions_by_project(&self, project_id: &str) -> Result<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE project_id = ?1 ORDER BY created_at, rowid",
            SESSION_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_session).collect()
    }

    pub async fn list_session_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM sessions")
            .fetch_all(self.pool())
            .await?;
        Ok(ids)
    }

    pub async fn count_pooled_sessions(&self, project_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE project_id = ?1 AND status = 'pooled'",
        )
        .bind(project_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count as usize)
    }

    /// Oldest pooled sessions first, used when draining excess.
    pub async fn find_oldest_pooled_sessions(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<Session>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM sessions
            WHERE project_id = ?1 AND status = 'pooled'
            ORDER BY created_at, rowid
            LIMIT ?2
            "#,
            SESSION_COLUMNS
        ))
        .bind(project_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_session).collect()
    }

    /// Atomically move the oldest ready pooled session of a project to `running`.
    ///
    /// Select and update run as one statement under SQLite's single-writer lock, so two
    /// concurrent claims can never return the same row.
    pub async fn claim_pooled_session(&self, project_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sessions
            SET status = 'running', updated_at = ?1
            WHERE id = (
                SELECT id FROM sessions
                WHERE project_id = ?2 AND status = 'pooled' AND ready = 1
                ORDER BY created_at, rowid
                LIMIT 1
            )
            AND status = 'pooled' AND ready = 1
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(now_timestamp())
        .bind(project_id)
        .fetch_optional(self.pool())
        .await?;

        let claimed = row.map(row_to_session).transpose()?;
        if let Some(session) = &claimed {
            debug!(session_id = %session.id, project_id, "Claimed pooled session");
        }
        Ok(claimed)
    }

    pub async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(now_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    /// Remove a session row. Container and browser rows cascade. Missing rows are not an error.
    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_session(row: SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.get("id"),
        project_id: row.get("project_id"),
        status: SessionStatus::from_str(&row.get::<String, _>("status"))?,
        title: row.get("title"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}
