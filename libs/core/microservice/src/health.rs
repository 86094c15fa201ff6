//! Health endpoints for K8s probes.

use crate::state::WorkerState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use domain_workdata::WorkerStatus;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::future::Future;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Body of the probe endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub worker_status: WorkerStatus,
    pub stream_bound: bool,
}

impl HealthStatus {
    async fn from_state(state: &WorkerState) -> Self {
        let worker_status = state.status();
        let status = if state.is_alive() {
            "healthy".to_string()
        } else {
            let reason = state
                .last_error()
                .await
                .unwrap_or_else(|| "unknown".to_string());
            format!("unhealthy: {}", reason)
        };

        Self {
            status,
            service: state.name().to_string(),
            worker_status,
            stream_bound: state.is_ready(),
        }
    }
}

/// Health server for K8s probes.
pub struct HealthServer {
    port: u16,
    state: WorkerState,
    metrics_handle: Option<PrometheusHandle>,
}

impl HealthServer {
    pub fn new(port: u16, state: WorkerState) -> Self {
        Self {
            port,
            state,
            metrics_handle: None,
        }
    }

    /// Set the metrics handle for /metrics endpoint.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/readyz", get(ready_handler))
            .with_state(self.state.clone());

        if let Some(handle) = self.metrics_handle.clone() {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let addr = format!("0.0.0.0:{}", self.port);

        info!(addr = %addr, "Starting health server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Liveness: 503 only after the pump failed fatally, not while reconnecting.
async fn health_handler(State(state): State<WorkerState>) -> impl IntoResponse {
    let status = HealthStatus::from_state(&state).await;
    if state.is_alive() {
        (StatusCode::OK, Json(status))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}

/// Readiness: bound to the work stream and not shutting down.
async fn ready_handler(State(state): State<WorkerState>) -> impl IntoResponse {
    let status = HealthStatus::from_state(&state).await;
    if state.is_ready() {
        (StatusCode::OK, Json(status))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}
