//! Resilience gateway library.
//!
//! Circuit breakers with per-service fallbacks, a per-client rate limiter
//! and a shared cache that switches between in-process and Redis backends.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
