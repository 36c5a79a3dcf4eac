//! Rate limiting subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (spend one point for the client identifier)
//!     → limiter_store.rs (shared cache counters or in-process table)
//!     → admitted with quota headers, or 429 with Retry-After
//! ```
//!
//! # Design Decisions
//! - The store follows the cache selection and is swapped atomically
//! - Fail open to the in-process table when the shared store errors
//! - Time comes from `clock.rs` so windows can be driven in tests

pub mod clock;
pub mod limiter_store;
pub mod rate_limit;

pub use rate_limit::{RateLimitExceeded, RateLimitQuota, RateLimiterController};
