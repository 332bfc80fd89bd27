use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde_json::json;
use tracing::error;

use crate::server::{runner::CheckRunner, ServerState};
use crate::utils::error::HealthCheckError;

/// Prometheus metrics for sessions and checks.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Tracks the number of open WebSocket sessions.
    pub connections: IntGauge,
    /// Counts the total number of frames received from clients.
    pub messages_received: IntCounter,
    /// Counts the total number of frames queued for clients.
    pub messages_sent: IntCounter,
    /// Checks currently holding an admission token.
    pub checks_in_flight: IntGauge,
    /// Requests refused by the per-client rate limiter.
    pub rate_limited: IntCounter,
    /// Finished checks by outcome (`complete`, `timeout`, `failed`, ...).
    pub check_outcomes: IntCounterVec,
    /// Wall time of check routine runs.
    pub check_duration: Histogram,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl HealthMetrics {
    /// Creates the metrics and registers them with a fresh registry.
    ///
    /// # Errors
    /// Returns a `prometheus::Error` if a metric cannot be created or registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let connections = IntGauge::new("connections", "Active connections")?;
        let messages_received = IntCounter::new("messages_received", "Total messages received")?;
        let messages_sent = IntCounter::new("messages_sent", "Total messages sent")?;
        let checks_in_flight = IntGauge::new("checks_in_flight", "Checks currently running")?;
        let rate_limited = IntCounter::new(
            "rate_limited_total",
            "Check requests rejected by the rate limiter",
        )?;
        let check_outcomes = IntCounterVec::new(
            Opts::new("check_outcomes_total", "Finished checks by outcome"),
            &["outcome"],
        )?;
        let check_duration = Histogram::with_opts(
            HistogramOpts::new("check_duration_seconds", "Check routine run time")
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]),
        )?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(checks_in_flight.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;
        registry.register(Box::new(check_outcomes.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            connections,
            messages_received,
            messages_sent,
            checks_in_flight,
            rate_limited,
            check_outcomes,
            check_duration,
            registry,
        })
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.check_outcomes.with_label_values(&[outcome]).inc();
    }

    /// Exposes the current state of all registered metrics in Prometheus text format.
    pub fn expose_metrics(&self) -> Result<String, HealthCheckError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| HealthCheckError::SerializationError(e.to_string()))
    }
}

/// Liveness probe. Always `{"status": "ok"}` while the process serves requests.
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Handles the `/metrics` HTTP request and returns the current metrics data.
pub async fn metrics_handler<R: CheckRunner>(
    State(state): State<Arc<ServerState<R>>>,
) -> Response {
    match state.metrics.expose_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
