// ABOUTME: Client for the browser daemon service that runs one automation browser per session
// ABOUTME: DaemonController is the seam the reconciler drives; HttpDaemonController speaks its REST API

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Daemon returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected daemon response: {0}")]
    Decode(String),

    #[error("Daemon {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonStatus {
    pub running: bool,
    pub ready: bool,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

#[async_trait]
pub trait DaemonController: Send + Sync {
    /// Start the daemon for a session; returns the stream port it listens on.
    async fn start(&self, session_id: &str, options: StartOptions) -> Result<u16>;

    /// Stop the daemon. Stopping one that does not exist succeeds.
    async fn stop(&self, session_id: &str) -> Result<()>;

    async fn get_status(&self, session_id: &str) -> Result<DaemonStatus>;

    /// Ask the daemon to open its browser ahead of the first subscriber.
    async fn launch(&self, session_id: &str) -> Result<()>;

    async fn navigate(&self, session_id: &str, url: &str) -> Result<()>;

    async fn get_current_url(&self, session_id: &str) -> Result<Option<String>>;

    async fn health(&self) -> Result<bool>;
}

#[derive(Deserialize)]
struct StartResponse {
    port: Option<u16>,
}

#[derive(Deserialize)]
struct UrlResponse {
    url: Option<String>,
}

pub struct HttpDaemonController {
    client: Client,
    base_url: String,
    /// Ceiling for start, stop, launch and navigate
    command_timeout: Duration,
    /// Ceiling for status, url and health probes
    status_timeout: Duration,
}

impl HttpDaemonController {
    pub fn new(
        base_url: impl Into<String>,
        command_timeout: Duration,
        status_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            command_timeout,
            status_timeout,
        }
    }

    fn daemon_url(&self, session_id: &str) -> String {
        format!("{}/daemons/{}", self.base_url, session_id)
    }

    async fn error_for(response: reqwest::Response) -> DaemonError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        DaemonError::Status { status, body }
    }
}

#[async_trait]
impl DaemonController for HttpDaemonController {
    async fn start(&self, session_id: &str, options: StartOptions) -> Result<u16> {
        let response = self
            .client
            .post(self.daemon_url(session_id))
            .json(&options)
            .timeout(self.command_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let body: StartResponse = response.json().await?;
        let port = body
            .port
            .ok_or_else(|| DaemonError::Decode("start response has no port".to_string()))?;
        debug!(session_id, port, "Daemon started");
        Ok(port)
    }

    async fn stop(&self, session_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.daemon_url(session_id))
            .timeout(self.command_timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::error_for(response).await)
    }

    async fn get_status(&self, session_id: &str) -> Result<DaemonStatus> {
        let response = self
            .client
            .get(self.daemon_url(session_id))
            .timeout(self.status_timeout)
            .send()
            .await?;

        // Unknown sessions have no daemon; that is a status, not an error
        if !response.status().is_success() {
            return Ok(DaemonStatus::default());
        }
        Ok(response.json().await?)
    }

    async fn launch(&self, session_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/launch", self.daemon_url(session_id)))
            .timeout(self.command_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        Ok(())
    }

    async fn navigate(&self, session_id: &str, url: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/navigate", self.daemon_url(session_id)))
            .json(&serde_json::json!({ "url": url }))
            .timeout(self.command_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let err = Self::error_for(response).await;
            warn!(session_id, url, "Navigate failed: {}", err);
            return Err(err);
        }
        Ok(())
    }

    async fn get_current_url(&self, session_id: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(format!("{}/url", self.daemon_url(session_id)))
            .timeout(self.status_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(None);
        }
        let body: UrlResponse = response.json().await?;
        Ok(body.url)
    }

    async fn health(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.status_timeout)
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}
