//! HTTP surface of the gateway.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, tracing, timeout)
//!     → middleware/rate_limit.rs (per-IP budget, limit headers)
//!     → Gateway::call (breaker, fallback)
//!     → downstream.rs (reqwest call to the configured service)
//! ```

pub mod downstream;
pub mod middleware;
pub mod server;

pub use downstream::{build_client, register_downstreams, HttpAction};
pub use server::HttpServer;
