// src/server/mod.rs
pub mod admission;
pub mod client;
pub mod handler;
pub mod health;
pub mod message;
pub mod middleware;
pub mod routes;
pub mod runner;

// Re-export public components
pub use admission::{AdmissionGate, AdmissionToken};
pub use client::{Client, ClientIdentity, ClientManager};
pub use handler::{handle_socket, run_session};
pub use health::HealthMetrics;
pub use message::{CheckRequest, ServerMessage};
pub use middleware::{CheckRateLimiter, UpgradeThrottle};
pub use routes::router;
pub use runner::{CheckError, CheckRunner, ProcessRunner};

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::utils::error::HealthCheckError;

/// State shared by every connection.
pub struct ServerState<R> {
    pub config: Arc<ServerConfig>,
    pub clients: ClientManager,
    pub metrics: HealthMetrics,
    pub rate_limiter: CheckRateLimiter,
    pub admission: AdmissionGate,
    pub upgrade_throttle: UpgradeThrottle,
    pub runner: R,
}

impl<R: CheckRunner> ServerState<R> {
    /// Builds the shared state from a validated configuration.
    ///
    /// # Errors
    /// Returns an error if the metrics registry cannot be set up.
    pub fn new(config: ServerConfig, runner: R) -> Result<Self, HealthCheckError> {
        Ok(Self {
            clients: ClientManager::new(),
            metrics: HealthMetrics::new()?,
            rate_limiter: CheckRateLimiter::new(
                config.rate_limit_max_requests,
                config.rate_limit_window(),
            ),
            admission: AdmissionGate::new(config.max_parallel_checks),
            upgrade_throttle: UpgradeThrottle::new(config.connection_rate_limit),
            config: Arc::new(config),
            runner,
        })
    }

    /// Stops admitting new checks and asks every session to close.
    pub fn shutdown(&self) {
        self.admission.close();
        self.clients.close_all();
    }
}

impl ServerState<ProcessRunner> {
    /// State whose checks run the configured script.
    pub fn with_process_runner(config: ServerConfig) -> Result<Self, HealthCheckError> {
        let runner = ProcessRunner::new(config.check_script.clone(), config.check_timeout());
        Self::new(config, runner)
    }
}

/// Periodically forgets rate limiter state for idle clients.
pub async fn sweep_idle_clients<R: CheckRunner>(state: Arc<ServerState<R>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        state.rate_limiter.cleanup();
        state.upgrade_throttle.cleanup();
        state.clients.cleanup();
    }
}

/// Serves HTTP and WebSocket traffic until `shutdown` resolves.
///
/// # Errors
/// Returns `HealthCheckError::ConnectionError` if binding or serving fails.
pub async fn serve<R, F>(state: Arc<ServerState<R>>, shutdown: F) -> Result<(), HealthCheckError>
where
    R: CheckRunner,
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let address = state.config.bind_address();
    let connection_error = |e: std::io::Error| HealthCheckError::ConnectionError(e.to_string());

    if state.config.enable_tls {
        let tls = RustlsConfig::from_pem_file(&state.config.tls_cert_path, &state.config.tls_key_path)
            .await
            .map_err(|e| HealthCheckError::ConfigurationError(format!("TLS config error: {e}")))?;
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| HealthCheckError::ConfigurationError(format!("Invalid bind address {address}: {e}")))?;

        let handle = axum_server::Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown.await;
                handle.graceful_shutdown(Some(Duration::from_secs(10)));
            }
        });

        info!("Server listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app)
            .await
            .map_err(connection_error)
    } else {
        let listener = TcpListener::bind(&address).await.map_err(connection_error)?;
        info!("Server listening on http://{}", listener.local_addr().map_err(connection_error)?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(connection_error)
    }
}
