// ABOUTME: Browser daemon state repository: desired/actual state, ports, retries and heartbeats
// ABOUTME: Desired state is upserted by subscribers; actual state is written only by the reconciler

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::{
    now_timestamp, parse_timestamp, ActualState, ActualStateUpdate, BrowserSessionState,
    DesiredState, Result, Storage, StorageError,
};

const BROWSER_COLUMNS: &str = "session_id, desired_state, actual_state, stream_port, retry_count, \
     error_message, last_heartbeat, last_url, updated_at";

impl Storage {
    pub async fn get_browser_state(&self, session_id: &str) -> Result<Option<BrowserSessionState>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM browser_sessions WHERE session_id = ?1",
            BROWSER_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(row_to_browser_state).transpose()
    }

    pub async fn list_browser_states(&self) -> Result<Vec<BrowserSessionState>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM browser_sessions ORDER BY created_at, rowid",
            BROWSER_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_browser_state).collect()
    }

    /// Set the desired state, creating the row (actual `stopped`) when absent.
    pub async fn set_desired_state(
        &self,
        session_id: &str,
        desired: DesiredState,
    ) -> Result<BrowserSessionState> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO browser_sessions (
                session_id, desired_state, actual_state, retry_count, created_at, updated_at
            ) VALUES (?1, ?2, 'stopped', 0, ?3, ?3)
            ON CONFLICT (session_id) DO UPDATE SET
                desired_state = excluded.desired_state,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            BROWSER_COLUMNS
        ))
        .bind(session_id)
        .bind(desired.as_str())
        .bind(now_timestamp())
        .fetch_one(self.pool())
        .await?;

        row_to_browser_state(row)
    }

    /// Create a stopped/stopped row if the session has none yet; existing rows are untouched.
    pub async fn ensure_browser_state(&self, session_id: &str) -> Result<BrowserSessionState> {
        sqlx::query(
            r#"
            INSERT INTO browser_sessions (
                session_id, desired_state, actual_state, retry_count, created_at, updated_at
            ) VALUES (?1, 'stopped', 'stopped', 0, ?2, ?2)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(now_timestamp())
        .execute(self.pool())
        .await?;

        self.get_browser_state(session_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("browser session {}", session_id)))
    }

    /// Record an actual-state transition plus any optional column changes.
    /// Returns `None` when the session has no browser row.
    pub async fn set_actual_state(
        &self,
        session_id: &str,
        actual: ActualState,
        update: &ActualStateUpdate,
    ) -> Result<Option<BrowserSessionState>> {
        let mut query = String::from("UPDATE browser_sessions SET actual_state = ?1, updated_at = ?2");
        let mut bind_index = 3;

        if update.stream_port.is_some() {
            query.push_str(&format!(", stream_port = ?{}", bind_index));
            bind_index += 1;
        }
        if update.retry_count.is_some() {
            query.push_str(&format!(", retry_count = ?{}", bind_index));
            bind_index += 1;
        }
        if update.error_message.is_some() {
            query.push_str(&format!(", error_message = ?{}", bind_index));
            bind_index += 1;
        }
        query.push_str(&format!(
            " WHERE session_id = ?{} RETURNING {}",
            bind_index, BROWSER_COLUMNS
        ));

        let mut q = sqlx::query(&query)
            .bind(actual.as_str())
            .bind(now_timestamp());
        if let Some(port) = update.stream_port {
            q = q.bind(port.map(i64::from));
        }
        if let Some(count) = update.retry_count {
            q = q.bind(i64::from(count));
        }
        if let Some(message) = &update.error_message {
            q = q.bind(message.clone());
        }
        q = q.bind(session_id);

        let row = q.fetch_optional(self.pool()).await?;
        row.map(row_to_browser_state).transpose()
    }

    pub async fn update_heartbeat(&self, session_id: &str) -> Result<()> {
        let now = now_timestamp();
        sqlx::query(
            "UPDATE browser_sessions SET last_heartbeat = ?1, updated_at = ?1 WHERE session_id = ?2",
        )
        .bind(&now)
        .bind(session_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_last_url(&self, session_id: &str, url: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE browser_sessions SET last_url = ?1, updated_at = ?2 WHERE session_id = ?3",
        )
        .bind(url)
        .bind(now_timestamp())
        .bind(session_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_browser_state(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM browser_sessions WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stream ports currently referenced by any browser row.
    pub async fn list_stream_ports_in_use(&self) -> Result<Vec<u16>> {
        let ports: Vec<i64> = sqlx::query_scalar(
            "SELECT stream_port FROM browser_sessions WHERE stream_port IS NOT NULL",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(ports
            .into_iter()
            .filter_map(|p| u16::try_from(p).ok())
            .collect())
    }
}

fn row_to_browser_state(row: SqliteRow) -> Result<BrowserSessionState> {
    let stream_port = row
        .get::<Option<i64>, _>("stream_port")
        .map(|p| {
            u16::try_from(p).map_err(|_| StorageError::InvalidData(format!("stream port {}", p)))
        })
        .transpose()?;

    Ok(BrowserSessionState {
        session_id: row.get("session_id"),
        desired_state: DesiredState::from_str(&row.get::<String, _>("desired_state"))?,
        actual_state: ActualState::from_str(&row.get::<String, _>("actual_state"))?,
        stream_port,
        retry_count: row.get::<i64, _>("retry_count").max(0) as u32,
        error_message: row.get("error_message"),
        last_heartbeat: row
            .get::<Option<String>, _>("last_heartbeat")
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
        last_url: row.get("last_url"),
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}
