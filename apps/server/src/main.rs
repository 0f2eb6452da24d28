//! Cinder Server - Web Server Entry Point
//!
//! Serves conditional delete-expunge under `/fhir` and job administration under
//! `/admin`. Delete-expunge jobs run in-process on the tokio runtime.

use anyhow::Context;
use cinder::{api::create_router, config::Config, logging, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging settings live in the config, so it loads before anything logs.
    let config = Config::load().context("Failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let _logging_guard =
        logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.logging.deployment_environment,
        "Starting Cinder Server"
    );

    let addr = config
        .socket_addr()
        .context("Failed to determine socket address")?;

    tracing::info!(
        backend = ?config.database.backend,
        batch_size = config.expunge.expunge_batch_size,
        max_parallel_batches = config.expunge.max_parallel_batches,
        listen_addr = %addr,
        "Configuration loaded"
    );

    let state = AppState::new(config)
        .await
        .context("Failed to initialize application state")?;

    let app = create_router(state);

    tracing::info!(listen_addr = %addr, "Accepting delete-expunge requests");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {addr}"))?;

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server terminated unexpectedly");
    }

    tracing::info!("Cinder Server stopped");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM. Jobs still running are picked up by
/// `resume_interrupted` on the next start.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = tokio::signal::ctrl_c();
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler; waiting for SIGINT only");
            let _ = sigint.await;
            return;
        }
    };

    tokio::select! {
        _ = sigint => {
            tracing::info!(signal = "SIGINT", "Shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!(signal = "SIGTERM", "Shutting down");
        }
    }
}

/// Resolves on Ctrl+C.
#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for CTRL+C");
    }
    tracing::info!(signal = "ctrl_c", "Shutting down");
}
