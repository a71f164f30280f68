// ABOUTME: Orchestrator process: loads settings, connects storage and the container engine,
// ABOUTME: starts every reconcile loop and serves the readiness callback until interrupted

use anyhow::Context;
use lab_cli::{create_router, middleware::RateLimitConfig, AppState};
use lab_config::OrchestratorSettings;
use lab_orchestrator::{BroadcastPublisher, HttpDaemonController, Orchestrator};
use lab_sandbox::{DockerProvider, SandboxProvider};
use lab_storage::Storage;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PUBLISHER_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = OrchestratorSettings::load().context("invalid configuration")?;
    info!(
        bind_addr = %settings.bind_addr,
        pool_size = settings.pool_size,
        "Starting Lab orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let storage = Storage::connect(&settings.database_url)
        .await
        .with_context(|| format!("failed to open database {}", settings.database_url))?;
    storage.migrate().await.context("failed to run migrations")?;

    let provider = DockerProvider::new().context("failed to connect to Docker")?;
    match provider.is_available().await {
        Ok(true) => {}
        Ok(false) | Err(_) => warn!("Docker daemon is not reachable yet; loops will retry"),
    }

    let daemon = HttpDaemonController::new(
        settings.browser_api_url.clone(),
        settings.command_timeout,
        settings.daemon_health_timeout,
    );
    let orchestrator = Orchestrator::new(
        &settings,
        storage.clone(),
        Arc::new(provider),
        Arc::new(daemon),
        Arc::new(BroadcastPublisher::new(PUBLISHER_CAPACITY)),
    );
    orchestrator.start().await;

    let app = create_router(
        AppState::new(orchestrator.browser().clone()),
        RateLimitConfig::default(),
    );
    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!("Listening on {}", settings.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    orchestrator.shutdown();
    storage.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt, shutting down"),
        Err(e) => warn!("Failed to listen for interrupt: {}", e),
    }
}
