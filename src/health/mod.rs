//! Health and metrics projections over the circuit breakers.
//!
//! # Data Flow
//! ```text
//! CircuitBreakerManager::snapshots()
//!     → exporter.rs
//!         → health report (healthy / recovering / degraded)
//!         → metrics document (JSON)
//!         → Prometheus text
//! ```

pub mod exporter;

pub use exporter::{HealthMetricsExporter, HealthReport, HealthStatus, MetricsReport};
