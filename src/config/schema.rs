//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the resilience gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Shared cache backend selection.
    pub cache: CacheConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker profiles.
    pub breakers: BreakerConfig,

    /// Downstream endpoints used by the bundled HTTP actions.
    pub downstream: HashMap<String, DownstreamConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Whole-request timeout applied by the HTTP layer, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pretty output for development, JSON for production.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Which cache backend to use.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    #[default]
    Memory,
    Distributed,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::Memory => "memory",
            CacheStrategy::Distributed => "distributed",
        }
    }
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Preferred backend.
    pub strategy: CacheStrategy,

    /// Redis connection URL for the distributed backend.
    pub redis_url: String,

    /// Prefix applied to every distributed key.
    pub key_prefix: String,

    /// Upper bound on the distributed connect attempt, in milliseconds.
    pub connect_timeout_ms: u64,

    /// TTL applied by callers that do not pass one (0 = never expire).
    pub default_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::Memory,
            redis_url: "redis://127.0.0.1:6379/".to_string(),
            key_prefix: "gateway:".to_string(),
            connect_timeout_ms: 2000,
            default_ttl_ms: 0,
        }
    }
}

/// Rate limiter window semantics.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    #[default]
    Fixed,
    Sliding,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Requests allowed per window per identifier.
    pub points: u64,

    /// Window length in seconds.
    pub duration_secs: u64,

    /// Penalty once the budget is exhausted (0 = none).
    pub block_duration_secs: u64,

    /// Fixed or sliding window.
    pub window: WindowKind,

    /// Prefix for limiter keys in the shared store.
    pub key_prefix: String,

    /// How often expired in-process entries are swept, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            points: 100,
            duration_secs: 60,
            block_duration_secs: 0,
            window: WindowKind::Fixed,
            key_prefix: "rl:".to_string(),
            sweep_interval_secs: 30,
        }
    }
}

/// Per-service breaker tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServiceProfile {
    /// Filled from the table key when loaded.
    pub name: String,
    pub error_threshold_percentage: f64,
    pub timeout_ms: u64,
    pub reset_timeout_ms: u64,
    pub rolling_window_ms: u64,
    pub rolling_buckets: u32,
    pub volume_threshold: u64,
}

impl ServiceProfile {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_window_ms)
    }
}

impl Default for ServiceProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            error_threshold_percentage: 50.0,
            timeout_ms: 10_000,
            reset_timeout_ms: 30_000,
            rolling_window_ms: 10_000,
            rolling_buckets: 10,
            volume_threshold: 5,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Services whose 401 responses are expected client failures.
    pub critical_services: Vec<String>,

    /// Profiles keyed by service name. The `default` entry covers
    /// services without their own profile.
    pub profiles: HashMap<String, ServiceProfile>,
}

pub const DEFAULT_PROFILE: &str = "default";

impl Default for BreakerConfig {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), ServiceProfile::default());
        profiles.insert(
            "weather".to_string(),
            ServiceProfile {
                name: "weather".to_string(),
                error_threshold_percentage: 60.0,
                timeout_ms: 8_000,
                reset_timeout_ms: 30_000,
                volume_threshold: 10,
                ..ServiceProfile::default()
            },
        );
        profiles.insert(
            "auth".to_string(),
            ServiceProfile {
                name: "auth".to_string(),
                error_threshold_percentage: 50.0,
                timeout_ms: 5_000,
                reset_timeout_ms: 60_000,
                volume_threshold: 5,
                ..ServiceProfile::default()
            },
        );

        Self {
            critical_services: vec!["auth".to_string()],
            profiles,
        }
    }
}

/// Downstream endpoint for a service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DownstreamConfig {
    /// Base URL; the operation name is appended as a path segment.
    pub base_url: String,

    /// Client-side timeout for the HTTP call. The breaker deadline still applies.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Operations that get their own breaker and path segment. Anything else
    /// goes to `base_url` under the service's default breaker.
    #[serde(default)]
    pub operations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert!(config.breakers.profiles.contains_key(DEFAULT_PROFILE));
    }

    #[test]
    fn test_parse_full_sections() {
        let raw = r#"
            [cache]
            strategy = "distributed"
            redis_url = "redis://cache:6379/"

            [rate_limit]
            points = 5
            duration_secs = 60
            window = "sliding"

            [breakers]
            critical_services = ["auth"]

            [breakers.profiles.weather]
            error_threshold_percentage = 60.0
            timeout_ms = 8000
            reset_timeout_ms = 30000
            volume_threshold = 10

            [downstream.weather]
            base_url = "http://weather.internal"
            operations = ["forecast", "search"]
        "#;
        let config: GatewayConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.cache.strategy, CacheStrategy::Distributed);
        assert_eq!(config.rate_limit.window, WindowKind::Sliding);
        assert_eq!(config.rate_limit.points, 5);
        let weather = &config.breakers.profiles["weather"];
        assert_eq!(weather.volume_threshold, 10);
        // Unspecified profile fields fall back to defaults.
        assert_eq!(weather.rolling_buckets, 10);
        assert_eq!(config.downstream["weather"].base_url, "http://weather.internal");
        assert_eq!(config.downstream["weather"].operations, vec!["forecast", "search"]);
    }
}
