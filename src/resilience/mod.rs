//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to downstream:
//!     → circuit_breaker.rs (admit, reject to fallback.rs when open)
//!     → timeouts.rs (deadline on the action future)
//!     → error_classifier.rs (does this failure count against the circuit?)
//!     → rolling_window.rs (bucketed stats drive the open decision)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every downstream call has a deadline
//! - Errors are normalised once, at the action boundary
//! - Breakers live for the process lifetime
//! - Client mistakes (4xx) never open a circuit

pub mod circuit_breaker;
pub mod error_classifier;
pub mod fallback;
pub mod rolling_window;
pub mod timeouts;

/// Request and response bodies flowing through breakers.
pub type Payload = serde_json::Value;
