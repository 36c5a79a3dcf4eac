//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, percentages in range)
//! - Check addresses and URLs parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{CacheStrategy, GatewayConfig, ServiceProfile};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if config.cache.strategy == CacheStrategy::Distributed {
        match url::Url::parse(&config.cache.redis_url) {
            Ok(url) if url.scheme() == "redis" || url.scheme() == "rediss" => {}
            Ok(url) => errors.push(ValidationError::new(
                "cache.redis_url",
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => errors.push(ValidationError::new("cache.redis_url", e.to_string())),
        }
    }
    if config.cache.connect_timeout_ms == 0 {
        errors.push(ValidationError::new("cache.connect_timeout_ms", "must be > 0"));
    }

    let rl = &config.rate_limit;
    if rl.enabled {
        if rl.points == 0 {
            errors.push(ValidationError::new("rate_limit.points", "must be > 0"));
        }
        if rl.duration_secs == 0 {
            errors.push(ValidationError::new("rate_limit.duration_secs", "must be > 0"));
        }
    }

    for (name, profile) in &config.breakers.profiles {
        validate_profile(name, profile, &mut errors);
    }

    for (service, downstream) in &config.downstream {
        if let Err(e) = url::Url::parse(&downstream.base_url) {
            errors.push(ValidationError::new(
                format!("downstream.{}.base_url", service),
                e.to_string(),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_profile(name: &str, profile: &ServiceProfile, errors: &mut Vec<ValidationError>) {
    let field = |f: &str| format!("breakers.profiles.{}.{}", name, f);

    if !(0.0..=100.0).contains(&profile.error_threshold_percentage) {
        errors.push(ValidationError::new(
            field("error_threshold_percentage"),
            "must be within 0..=100",
        ));
    }
    if profile.timeout_ms == 0 {
        errors.push(ValidationError::new(field("timeout_ms"), "must be > 0"));
    }
    if profile.reset_timeout_ms == 0 {
        errors.push(ValidationError::new(field("reset_timeout_ms"), "must be > 0"));
    }
    if profile.rolling_buckets == 0 {
        errors.push(ValidationError::new(field("rolling_buckets"), "must be > 0"));
    } else if profile.rolling_window_ms < profile.rolling_buckets as u64 {
        errors.push(ValidationError::new(
            field("rolling_window_ms"),
            "must be at least one millisecond per bucket",
        ));
    }
}
