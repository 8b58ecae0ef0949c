//! HTTP surface: health, readiness and Prometheus scrape endpoints

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use timescale_ingest_config::MetricsConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::error::IngestError;
use crate::metrics::MetricsRegistry;

/// Read-mostly state shared between the supervisor and the HTTP surface.
pub struct HealthState {
    running: AtomicBool,
    write_succeeded: AtomicBool,
    breaker: Arc<CircuitBreaker>,
}

impl HealthState {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            running: AtomicBool::new(false),
            write_succeeded: AtomicBool::new(false),
            breaker,
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn mark_write_success(&self) {
        self.write_succeeded.store(true, Ordering::Release);
    }

    pub fn write_succeeded(&self) -> bool {
        self.write_succeeded.load(Ordering::Acquire)
    }

    /// Healthy while the supervisor runs and either a write has landed
    /// since startup or the breaker is not open.
    pub fn is_healthy(&self) -> bool {
        self.is_running()
            && (self.write_succeeded() || self.breaker.state() != BreakerState::Open)
    }
}

/// Health response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub breaker_state: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Readiness response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
}

#[derive(Clone)]
struct ServerState {
    registry: Arc<MetricsRegistry>,
    health: Arc<HealthState>,
    start_time: Instant,
}

/// HTTP server exposing `/health`, `/ready` and `/metrics`.
pub struct MetricsServer {
    config: MetricsConfig,
    registry: Arc<MetricsRegistry>,
    health: Arc<HealthState>,
}

impl MetricsServer {
    pub fn new(
        config: MetricsConfig,
        registry: Arc<MetricsRegistry>,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            config,
            registry,
            health,
        }
    }

    /// Bind the listen socket. Failing to bind is a startup
    /// precondition failure, so this is separate from `serve`.
    pub async fn bind(&self) -> Result<TcpListener, IngestError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        TcpListener::bind(addr)
            .await
            .map_err(|e| IngestError::Startup(format!("failed to bind {addr}: {e}")))
    }

    /// Serve until the cancellation token fires.
    pub async fn serve(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), IngestError> {
        let addr = listener
            .local_addr()
            .map_err(|e| IngestError::Metrics(e.to_string()))?;
        info!(%addr, "metrics server listening");

        let state = ServerState {
            registry: self.registry,
            health: self.health,
            start_time: Instant::now(),
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .with_state(state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| IngestError::Metrics(e.to_string()))?;

        info!("metrics server stopped");
        Ok(())
    }
}

async fn metrics_handler(State(state): State<ServerState>) -> Response {
    debug!("metrics endpoint called");
    match state.registry.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {e}"),
            )
                .into_response()
        }
    }
}

async fn health_handler(State(state): State<ServerState>) -> Response {
    let healthy = state.health.is_healthy();
    let body = HealthStatus {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        breaker_state: state.health.breaker.state().name().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

async fn ready_handler(State(state): State<ServerState>) -> Response {
    let ready = state.health.is_running();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(ReadinessStatus { ready })).into_response()
}
