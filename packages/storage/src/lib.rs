// ABOUTME: SQLite persistence for sessions, container definitions and browser daemon state
// ABOUTME: One Storage handle wraps the pool; repository methods live in per-entity modules

mod browser;
mod containers;
pub mod models;
mod sessions;

pub use models::*;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid stored value: {0}")]
    InvalidData(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Handle to the orchestrator database. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        info!("Connected to database at {}", url);
        Ok(Self { pool })
    }

    /// Single-connection in-memory database with migrations applied.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort lexically.
pub(crate) fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidData(format!("timestamp '{}': {}", raw, e)))
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub async fn storage_with_project(project_id: &str) -> Storage {
        let storage = Storage::in_memory().await.expect("in-memory storage");
        storage
            .create_project(project_id, "Test Project")
            .await
            .expect("create project");
        storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_lexically() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T00:00:01Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert_eq!(parse_timestamp(&format_timestamp(late)).unwrap(), late);
    }

    #[test]
    fn test_bad_timestamp_is_reported() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(StorageError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_storage_migrates() {
        let storage = Storage::in_memory().await.unwrap();
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(storage.pool())
        .await
        .unwrap();
        assert!(tables.contains(&"browser_sessions".to_string()));
        assert!(tables.contains(&"session_containers".to_string()));
        assert!(tables.contains(&"container_dependencies".to_string()));
    }
}
