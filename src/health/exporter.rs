//! Breaker health projections.
//!
//! # Responsibilities
//! - Summarise breaker state into a health status
//! - Flatten breaker stats into a metrics document
//! - Render the same numbers as Prometheus text
//!
//! # Design Decisions
//! - Read-only: every projection works from `BreakerSnapshot`s
//! - Any open breaker degrades the gateway; half-open alone means recovering

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;

use crate::resilience::circuit_breaker::{BreakerSnapshot, CircuitBreakerManager, CircuitState};
use crate::resilience::rolling_window::BreakerStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Recovering,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub state: CircuitState,
    pub stats: BreakerStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub open: usize,
    pub half_open: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub circuit_breakers: BTreeMap<String, BreakerHealth>,
    pub summary: HealthSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub requests_total: u64,
    pub requests_successful: u64,
    pub requests_failed: u64,
    pub requests_timeout: u64,
    pub requests_rejected: u64,
    pub fallbacks_total: u64,
    pub error_rate: f64,
    pub state: CircuitState,
}

pub type MetricsReport = BTreeMap<String, BreakerMetrics>;

pub fn health_report(snapshots: &[BreakerSnapshot]) -> HealthReport {
    let mut summary = HealthSummary::default();
    let mut circuit_breakers = BTreeMap::new();

    for snapshot in snapshots {
        summary.total += 1;
        match snapshot.state {
            CircuitState::Open => summary.open += 1,
            CircuitState::HalfOpen => summary.half_open += 1,
            CircuitState::Closed => summary.closed += 1,
        }
        circuit_breakers.insert(
            snapshot.key.clone(),
            BreakerHealth {
                state: snapshot.state,
                stats: snapshot.stats,
            },
        );
    }

    let status = if summary.open > 0 {
        HealthStatus::Degraded
    } else if summary.half_open > 0 {
        HealthStatus::Recovering
    } else {
        HealthStatus::Healthy
    };

    HealthReport {
        status,
        circuit_breakers,
        summary,
    }
}

/// Error rate rounded to two decimals.
fn rounded_error_rate(stats: &BreakerStats) -> f64 {
    (stats.error_rate() * 100.0).round() / 100.0
}

pub fn metrics_report(snapshots: &[BreakerSnapshot]) -> MetricsReport {
    snapshots
        .iter()
        .map(|s| {
            (
                s.key.clone(),
                BreakerMetrics {
                    requests_total: s.stats.fires,
                    requests_successful: s.stats.successes,
                    requests_failed: s.stats.failures,
                    requests_timeout: s.stats.timeouts,
                    requests_rejected: s.stats.rejects,
                    fallbacks_total: s.stats.fallbacks,
                    error_rate: rounded_error_rate(&s.stats),
                    state: s.state,
                },
            )
        })
        .collect()
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Prometheus text exposition (format 0.0.4).
pub fn prometheus_text(snapshots: &[BreakerSnapshot]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# HELP circuit_breaker_requests_total Requests seen by the circuit breaker by result");
    let _ = writeln!(out, "# TYPE circuit_breaker_requests_total counter");
    for s in snapshots {
        let service = escape_label(&s.key);
        for (result, value) in [
            ("success", s.stats.successes),
            ("failure", s.stats.failures),
            ("timeout", s.stats.timeouts),
            ("rejected", s.stats.rejects),
        ] {
            let _ = writeln!(
                out,
                "circuit_breaker_requests_total{{service=\"{}\",result=\"{}\"}} {}",
                service, result, value
            );
        }
    }

    let _ = writeln!(out, "# HELP circuit_breaker_fallbacks_total Fallback responses served");
    let _ = writeln!(out, "# TYPE circuit_breaker_fallbacks_total counter");
    for s in snapshots {
        let _ = writeln!(
            out,
            "circuit_breaker_fallbacks_total{{service=\"{}\"}} {}",
            escape_label(&s.key),
            s.stats.fallbacks
        );
    }

    let _ = writeln!(out, "# HELP circuit_breaker_error_rate Failure percentage within the rolling window");
    let _ = writeln!(out, "# TYPE circuit_breaker_error_rate gauge");
    for s in snapshots {
        let _ = writeln!(
            out,
            "circuit_breaker_error_rate{{service=\"{}\"}} {}",
            escape_label(&s.key),
            rounded_error_rate(&s.stats)
        );
    }

    let _ = writeln!(out, "# HELP circuit_breaker_state Circuit state (0=closed, 1=half_open, 2=open)");
    let _ = writeln!(out, "# TYPE circuit_breaker_state gauge");
    for s in snapshots {
        let _ = writeln!(
            out,
            "circuit_breaker_state{{service=\"{}\"}} {}",
            escape_label(&s.key),
            s.state.gauge_value()
        );
    }

    out
}

/// Read-only view over a breaker manager.
#[derive(Debug, Clone)]
pub struct HealthMetricsExporter {
    breakers: Arc<CircuitBreakerManager>,
}

impl HealthMetricsExporter {
    pub fn new(breakers: Arc<CircuitBreakerManager>) -> Self {
        Self { breakers }
    }

    pub fn health(&self) -> HealthReport {
        health_report(&self.breakers.snapshots())
    }

    pub fn metrics(&self) -> MetricsReport {
        metrics_report(&self.breakers.snapshots())
    }

    pub fn prometheus(&self) -> String {
        prometheus_text(&self.breakers.snapshots())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(key: &str, state: CircuitState, fires: u64, failures: u64) -> BreakerSnapshot {
        BreakerSnapshot {
            key: key.to_string(),
            service: key.split('-').next().unwrap_or(key).to_string(),
            operation: "default".to_string(),
            state,
            stats: BreakerStats {
                fires,
                successes: fires - failures,
                failures,
                ..BreakerStats::default()
            },
        }
    }

    #[test]
    fn test_status_precedence() {
        let healthy = health_report(&[snapshot("a", CircuitState::Closed, 1, 0)]);
        assert_eq!(healthy.status, HealthStatus::Healthy);

        let recovering = health_report(&[
            snapshot("a", CircuitState::Closed, 1, 0),
            snapshot("b", CircuitState::HalfOpen, 1, 1),
        ]);
        assert_eq!(recovering.status, HealthStatus::Recovering);

        let degraded = health_report(&[
            snapshot("a", CircuitState::Open, 1, 1),
            snapshot("b", CircuitState::HalfOpen, 1, 1),
        ]);
        assert_eq!(degraded.status, HealthStatus::Degraded);
        assert_eq!(
            degraded.summary,
            HealthSummary {
                total: 2,
                open: 1,
                half_open: 1,
                closed: 0
            }
        );
    }

    #[test]
    fn test_empty_is_healthy() {
        let report = health_report(&[]);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.summary.total, 0);
    }

    #[test]
    fn test_health_json_shape() {
        let report = health_report(&[snapshot("weather-search", CircuitState::HalfOpen, 3, 1)]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "recovering");
        assert_eq!(json["circuit_breakers"]["weather-search"]["state"], "half_open");
        assert_eq!(json["circuit_breakers"]["weather-search"]["stats"]["fires"], 3);
        assert_eq!(json["summary"]["half_open"], 1);
    }

    #[test]
    fn test_metrics_shape() {
        let report = metrics_report(&[snapshot("weather", CircuitState::Open, 3, 2)]);
        let weather = &report["weather"];
        assert_eq!(weather.requests_total, 3);
        assert_eq!(weather.requests_failed, 2);
        assert_eq!(weather.error_rate, 66.67);
        assert_eq!(weather.state, CircuitState::Open);
    }

    #[test]
    fn test_prometheus_text() {
        let text = prometheus_text(&[snapshot("weather-search", CircuitState::Open, 10, 10)]);
        assert!(text.contains("# TYPE circuit_breaker_requests_total counter"));
        assert!(text.contains("circuit_breaker_requests_total{service=\"weather-search\",result=\"failure\"} 10"));
        assert!(text.contains("circuit_breaker_requests_total{service=\"weather-search\",result=\"rejected\"} 0"));
        assert!(text.contains("circuit_breaker_error_rate{service=\"weather-search\"} 100"));
        assert!(text.contains("circuit_breaker_state{service=\"weather-search\"} 2"));
    }

    #[test]
    fn test_label_escaping() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }
}
