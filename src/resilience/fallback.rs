//! Degraded-response producers.
//!
//! Lookup order: exact `(service, operation)`, then `(service, "default")`,
//! then the registry-wide default.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;

use crate::error::{GatewayError, GatewayResult};
use crate::resilience::circuit_breaker::{BreakerKey, DEFAULT_OPERATION};
use crate::resilience::Payload;

/// Produces the response used in place of a rejected downstream call.
pub trait FallbackProducer: Send + Sync {
    fn produce(&self, service: &str, operation: &str) -> GatewayResult<Payload>;
}

impl<F> FallbackProducer for F
where
    F: Fn(&str, &str) -> GatewayResult<Payload> + Send + Sync,
{
    fn produce(&self, service: &str, operation: &str) -> GatewayResult<Payload> {
        self(service, operation)
    }
}

pub struct FallbackRegistry {
    entries: DashMap<(String, String), Arc<dyn FallbackProducer>>,
    global: Arc<dyn FallbackProducer>,
}

impl fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackRegistry")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Default for FallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic "service unavailable" envelope.
pub fn unavailable_envelope(service: &str, operation: &str) -> GatewayResult<Payload> {
    Ok(json!({
        "success": false,
        "fallback": true,
        "error": "Service temporarily unavailable",
        "service": service,
        "operation": operation,
    }))
}

impl FallbackRegistry {
    /// Empty registry whose global default is the unavailable envelope.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            global: Arc::new(unavailable_envelope),
        }
    }

    /// Empty registry whose global default fails with `CircuitOpen`.
    pub fn strict() -> Self {
        Self {
            entries: DashMap::new(),
            global: Arc::new(|service: &str, operation: &str| {
                Err(GatewayError::CircuitOpen {
                    key: BreakerKey::new(service, operation).to_string(),
                })
            }),
        }
    }

    /// Registry preloaded with the gateway's built-in producers.
    pub fn with_defaults() -> Self {
        let registry = Self::new();

        registry.register("weather", "search", |_: &str, _: &str| {
            Ok(json!({
                "success": false,
                "fallback": true,
                "data": [],
                "message": "Weather search is temporarily unavailable",
            }))
        });
        registry.register("weather", DEFAULT_OPERATION, |_: &str, _: &str| {
            Ok(json!({
                "success": false,
                "fallback": true,
                "data": null,
                "message": "Weather service is temporarily unavailable",
            }))
        });
        // No safe default exists for authentication.
        registry.register("auth", DEFAULT_OPERATION, |service: &str, operation: &str| {
            Err(GatewayError::ServiceUnavailable {
                service: service.to_string(),
                operation: operation.to_string(),
                message: "authentication cannot be served from a fallback".to_string(),
            })
        });

        registry
    }

    pub fn register<P>(&self, service: &str, operation: &str, producer: P)
    where
        P: FallbackProducer + 'static,
    {
        self.entries.insert(
            (service.to_string(), operation.to_string()),
            Arc::new(producer),
        );
    }

    /// Replace the registry-wide default.
    pub fn set_global<P>(&mut self, producer: P)
    where
        P: FallbackProducer + 'static,
    {
        self.global = Arc::new(producer);
    }

    pub fn resolve(&self, service: &str, operation: &str) -> Arc<dyn FallbackProducer> {
        let exact = (service.to_string(), operation.to_string());
        if let Some(producer) = self.entries.get(&exact) {
            return producer.value().clone();
        }
        let service_default = (service.to_string(), DEFAULT_OPERATION.to_string());
        if let Some(producer) = self.entries.get(&service_default) {
            return producer.value().clone();
        }
        self.global.clone()
    }
}
