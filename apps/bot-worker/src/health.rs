//! Health and metrics endpoints for K8s liveness and readiness checks.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use eyre::{Result, WrapErr};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Install the global Prometheus recorder.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("Failed to install Prometheus recorder")
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub consumer_running: bool,
}

/// Shared health state.
#[derive(Clone, Default)]
pub struct HealthState {
    inner: Arc<RwLock<HealthStateInner>>,
}

#[derive(Default)]
struct HealthStateInner {
    consumer_running: bool,
    last_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Readiness follows the consumer: not ready before start or after close.
    pub async fn set_consumer_running(&self, running: bool) {
        let mut inner = self.inner.write().await;
        inner.consumer_running = running;
    }

    pub async fn set_error(&self, error: Option<String>) {
        let mut inner = self.inner.write().await;
        inner.last_error = error;
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.consumer_running
    }

    pub async fn status(&self) -> HealthStatus {
        let inner = self.inner.read().await;
        let status = if inner.consumer_running {
            "ready".to_string()
        } else {
            match &inner.last_error {
                Some(error) => format!("not ready: {}", error),
                None => "not ready".to_string(),
            }
        };
        HealthStatus {
            status,
            consumer_running: inner.consumer_running,
        }
    }
}

/// Health server.
pub struct HealthServer {
    port: u16,
    state: HealthState,
    metrics_handle: Option<PrometheusHandle>,
}

impl HealthServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            state: HealthState::new(),
            metrics_handle: None,
        }
    }

    /// Serve `/metrics` from this handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn state(&self) -> HealthState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/healthz", get(live_handler))
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

        router
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = self.router();
        let addr = format!("0.0.0.0:{}", self.port);

        info!(addr = %addr, "Starting health server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

/// Liveness: the process answers, whatever the consumer state.
async fn live_handler(State(state): State<HealthState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.status().await))
}

async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let status = state.status().await;
    if status.consumer_running {
        (StatusCode::OK, Json(status))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}
