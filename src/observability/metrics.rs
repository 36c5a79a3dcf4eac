//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_breaker_events_total` (counter): breaker outcomes and transitions by breaker, event
//! - `gateway_breaker_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `gateway_rate_limit_total` (counter): limiter decisions by result, store
//! - `gateway_cache_operations_total` (counter): cache reads by backend, result
//! - `gateway_cache_selected` (gauge): 1 for the active backend
//!
//! # Design Decisions
//! - Helpers wrap the `metrics` facade so call sites stay one line
//! - Without an installed recorder every helper is a no-op

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_breaker_event(breaker: &str, event: &'static str) {
    metrics::counter!(
        "gateway_breaker_events_total",
        "breaker" => breaker.to_string(),
        "event" => event
    )
    .increment(1);
}

pub fn record_breaker_state(breaker: &str, state: u8) {
    metrics::gauge!("gateway_breaker_state", "breaker" => breaker.to_string()).set(f64::from(state));
}

pub fn record_rate_limit(result: &'static str, store: &'static str) {
    metrics::counter!("gateway_rate_limit_total", "result" => result, "store" => store).increment(1);
}

pub fn record_cache_read(backend: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!(
        "gateway_cache_operations_total",
        "backend" => backend,
        "result" => result
    )
    .increment(1);
}

pub fn record_cache_selected(backend: &'static str) {
    for candidate in ["memory", "distributed"] {
        let value = if candidate == backend { 1.0 } else { 0.0 };
        metrics::gauge!("gateway_cache_selected", "backend" => candidate).set(value);
    }
}
