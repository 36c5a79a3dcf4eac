//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router for the gateway surface
//! - Wire up middleware (tracing, timeout, rate limiting)
//! - Bind the server to a listener and shut down gracefully
//!
//! # Routes
//! ```text
//! GET  /health                       breaker health, 503 while degraded
//! GET  /metrics                      per-breaker metrics as JSON
//! GET  /metrics/prometheus           same numbers, Prometheus text
//! GET  /cache/stats                  active backend and its counters
//! POST /proxy/{service}/{operation}  rate limited, breaker protected call
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::gateway::Gateway;
use crate::health::exporter::HealthStatus;
use crate::http::middleware::rate_limit_middleware;
use crate::lifecycle::shutdown_signal;
use crate::resilience::Payload;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    gateway: Arc<Gateway>,
}

impl HttpServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let router = Self::build_router(gateway.clone());
        Self { router, gateway }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    pub fn build_router(gateway: Arc<Gateway>) -> Router {
        let timeout = Duration::from_secs(gateway.config().listener.request_timeout_secs);

        let proxy = Router::new()
            .route("/proxy/{service}/{operation}", post(proxy_handler))
            .route_layer(from_fn_with_state(gateway.clone(), rate_limit_middleware));

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/metrics/prometheus", get(prometheus_handler))
            .route("/cache/stats", get(cache_stats_handler))
            .merge(proxy)
            .with_state(gateway)
            .layer(TimeoutLayer::new(timeout))
            .layer(TraceLayer::new_for_http())
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server until a shutdown signal arrives, then stop the
    /// gateway's background loops.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let mut stop = self.gateway.shutdown().subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => {}
                    _ = stop.recv() => {}
                }
            })
            .await?;

        self.gateway.shutdown().trigger();
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn health_handler(State(gateway): State<Arc<Gateway>>) -> Response {
    let report = gateway.exporter().health();
    let status = match report.status {
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Recovering => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

async fn metrics_handler(State(gateway): State<Arc<Gateway>>) -> Response {
    Json(gateway.exporter().metrics()).into_response()
}

async fn prometheus_handler(State(gateway): State<Arc<Gateway>>) -> Response {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        gateway.exporter().prometheus(),
    )
        .into_response()
}

async fn cache_stats_handler(State(gateway): State<Arc<Gateway>>) -> Response {
    let cache = gateway.cache();
    let stats = cache.get_stats().await;
    Json(serde_json::json!({
        "cache": cache.get_cache_info(),
        "stats": stats,
    }))
    .into_response()
}

async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    Path((service, operation)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let request: Payload = if body.is_empty() {
        Payload::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("invalid JSON body: {}", e) })),
                )
                    .into_response();
            }
        }
    };

    tracing::debug!(service = %service, operation = %operation, "Dispatching request");

    match gateway.call(&service, &operation, request).await {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => {
            tracing::warn!(service = %service, operation = %operation, error = %e, "Request failed");
            e.into_response()
        }
    }
}
