//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → cache strategy change applied, limiter reinitialized
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; breaker profiles never change at runtime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BreakerConfig, CacheConfig, CacheStrategy, DownstreamConfig, GatewayConfig, ListenerConfig,
    LogFormat, ObservabilityConfig, RateLimitConfig, ServiceProfile, WindowKind,
};
