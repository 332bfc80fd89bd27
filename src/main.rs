//! # Mail server health-check service
//!
//! Accepts WebSocket sessions on `/ws`, runs the external check routine for
//! each requested domain and streams progress and results back.
//!
//! ## Features
//! - Per-client sliding-window rate limiting (3 checks per 15 minutes by default)
//! - Global cap on concurrently running checks
//! - Timeout-bounded check processes, killed when they overrun
//! - Liveness (`/health`) and Prometheus metrics (`/metrics`) endpoints
//! - Optional TLS and graceful shutdown
//!
//! ## Configuration
//! Environment variables prefixed with `MAILCHECK_` (a `.env` file is read
//! first). `MAX_PARALLEL_CHECKS` sizes the admission gate.

use std::{sync::Arc, time::Duration};

use mailcheck_server::{config, server};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How often idle rate limiter entries are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Entry point for the health-check service.
///
/// Initializes logging, loads configuration from the environment
/// and serves until a shutdown signal arrives.
///
/// # Errors
/// Returns an error if configuration validation fails or if the server fails to bind to a port.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::ServerConfig::from_env()?;
    config.validate()?;
    info!(
        max_parallel_checks = config.max_parallel_checks,
        rate_limit = config.rate_limit_max_requests,
        window_secs = config.rate_limit_window_secs,
        timeout_secs = config.check_timeout_secs,
        script = %config.check_script.display(),
        "Configuration loaded"
    );

    let state = Arc::new(server::ServerState::with_process_runner(config)?);
    let sweeper = tokio::spawn(server::sweep_idle_clients(state.clone(), SWEEP_INTERVAL));

    let shutdown = {
        let state = state.clone();
        async move {
            shutdown_signal().await;
            info!("Shutting down gracefully");
            state.shutdown();
        }
    };

    let result = server::serve(state, shutdown).await;
    sweeper.abort();
    result?;

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
