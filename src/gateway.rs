//! Gateway context.
//!
//! # Responsibilities
//! - Build every component once from `GatewayConfig`
//! - Hold the registered downstream actions
//! - Run the background loops (cache-change listener, limiter sweeper)
//!
//! # Design Decisions
//! - One explicit context object passed by `Arc`, no process-wide singletons
//! - Breaker profiles are fixed at construction; only the cache strategy
//!   can change at runtime

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::cache::{CacheSelector, Connector, RedisConnector, SelectionChange, UnifiedCache};
use crate::config::schema::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::health::exporter::HealthMetricsExporter;
use crate::lifecycle::Shutdown;
use crate::resilience::circuit_breaker::{Action, CircuitBreakerManager, DEFAULT_OPERATION};
use crate::resilience::fallback::FallbackRegistry;
use crate::resilience::Payload;
use crate::security::clock::{Clock, SystemClock};
use crate::security::rate_limit::{RateLimitExceeded, RateLimitQuota, RateLimiterController};

pub struct Gateway {
    config: GatewayConfig,
    selector: Arc<CacheSelector>,
    cache: UnifiedCache,
    limiter: Arc<RateLimiterController>,
    breakers: Arc<CircuitBreakerManager>,
    exporter: HealthMetricsExporter,
    actions: DashMap<(String, String), Arc<dyn Action>>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("cache", &self.selector.get_cache_info())
            .field("limiter", &self.limiter)
            .field("breakers", &self.breakers)
            .field("actions", &self.actions.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Production wiring: Redis for the distributed cache, built-in fallbacks,
    /// system clock.
    pub fn new(config: GatewayConfig) -> Self {
        let connector = Arc::new(RedisConnector::from_config(&config.cache));
        Self::with_components(config, connector, FallbackRegistry::with_defaults(), Arc::new(SystemClock))
    }

    pub fn with_components(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        fallbacks: FallbackRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let selector = Arc::new(CacheSelector::with_connector(config.cache.clone(), connector));
        let mut cache = UnifiedCache::new(selector.clone());
        if config.cache.default_ttl_ms > 0 {
            cache = cache.with_default_ttl(std::time::Duration::from_millis(config.cache.default_ttl_ms));
        }

        let limiter = Arc::new(RateLimiterController::with_clock(
            config.rate_limit.clone(),
            cache.clone(),
            clock,
        ));
        let breakers = Arc::new(CircuitBreakerManager::new(&config.breakers, Arc::new(fallbacks)));
        let exporter = HealthMetricsExporter::new(breakers.clone());

        Self {
            config,
            selector,
            cache,
            limiter,
            breakers,
            exporter,
            actions: DashMap::new(),
            shutdown: Shutdown::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &UnifiedCache {
        &self.cache
    }

    pub fn selector(&self) -> &Arc<CacheSelector> {
        &self.selector
    }

    pub fn limiter(&self) -> &Arc<RateLimiterController> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn exporter(&self) -> &HealthMetricsExporter {
        &self.exporter
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Select the cache backend, point the limiter at it and start the
    /// background loops. Stop them with `shutdown().trigger()`.
    pub async fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let changes = self.selector.subscribe();
        self.limiter.reinitialize().await;

        let listener = tokio::spawn(self.clone().watch_cache_changes(changes, self.shutdown.subscribe()));
        let sweeper = tokio::spawn(self.limiter.clone().run_sweeper(self.shutdown.subscribe()));

        let info = self.selector.get_cache_info();
        tracing::info!(
            cache = %info.strategy,
            limiter_store = self.limiter.store_kind(),
            profiles = self.config.breakers.profiles.len(),
            "Gateway started"
        );
        vec![listener, sweeper]
    }

    async fn watch_cache_changes(
        self: Arc<Self>,
        mut changes: watch::Receiver<SelectionChange>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let change = *changes.borrow_and_update();
                    tracing::info!(
                        strategy = %change.info.strategy,
                        generation = change.generation,
                        "Cache selection changed, reinitializing rate limiter"
                    );
                    self.limiter.reinitialize().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Cache change listener received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Register the downstream action for `(service, operation)`.
    ///
    /// Must happen before the first call; a breaker keeps the action it was
    /// created with.
    pub fn register_action(&self, service: &str, operation: &str, action: Arc<dyn Action>) {
        self.actions
            .insert((service.to_string(), operation.to_string()), action);
    }

    fn action_for(&self, service: &str, operation: &str) -> Option<Arc<dyn Action>> {
        self.actions
            .get(&(service.to_string(), operation.to_string()))
            .or_else(|| {
                self.actions
                    .get(&(service.to_string(), DEFAULT_OPERATION.to_string()))
            })
            .map(|a| a.value().clone())
    }

    /// Spend one rate-limit point for `identifier`.
    pub async fn admit(&self, identifier: &str) -> Result<RateLimitQuota, RateLimitExceeded> {
        self.limiter.consume(identifier).await
    }

    /// Dispatch `request` to `(service, operation)` through its breaker.
    pub async fn call(&self, service: &str, operation: &str, request: Payload) -> GatewayResult<Payload> {
        let action = self
            .action_for(service, operation)
            .ok_or_else(|| GatewayError::UnknownAction(format!("{}/{}", service, operation)))?;
        let handle = self.breakers.get_or_create(action, service, operation)?;
        self.breakers.fire(&handle, request).await
    }

    /// Apply a reloaded configuration. Only the cache strategy is live.
    pub async fn apply_config(&self, new: &GatewayConfig) {
        let current = self.selector.configured_strategy();
        if new.cache.strategy != current {
            self.selector.switch_strategy(new.cache.strategy).await;
        }
        if new.breakers != self.config.breakers || new.rate_limit != self.config.rate_limit {
            tracing::warn!("Breaker and rate limit changes take effect after restart");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::distributed::fake::FakeConnector;
    use crate::config::schema::CacheStrategy;
    use crate::resilience::error_classifier::DownstreamError;
    use crate::security::clock::ManualClock;
    use serde_json::json;

    fn gateway(config: GatewayConfig) -> Arc<Gateway> {
        Arc::new(Gateway::with_components(
            config,
            Arc::new(FakeConnector::new()),
            FallbackRegistry::with_defaults(),
            Arc::new(ManualClock::new(0)),
        ))
    }

    #[tokio::test]
    async fn test_call_routes_to_registered_action() {
        let gw = gateway(GatewayConfig::default());
        let action: Arc<dyn Action> = Arc::new(|req: Payload| async move { Ok::<_, DownstreamError>(json!({"echo": req})) });
        gw.register_action("weather", DEFAULT_OPERATION, action);

        let out = gw.call("weather", "forecast", json!({"city": "Oslo"})).await.unwrap();
        assert_eq!(out["echo"]["city"], "Oslo");
        assert!(gw.breakers().get("weather", "forecast").is_some());
    }

    #[tokio::test]
    async fn test_missing_action_is_a_routing_miss() {
        let gw = gateway(GatewayConfig::default());
        let err = gw.call("billing", "charge", json!({})).await.unwrap_err();
        assert!(matches!(&err, GatewayError::UnknownAction(route) if route == "billing/charge"));
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_string(), "no downstream action registered for 'billing/charge'");
    }

    #[tokio::test]
    async fn test_strategy_switch_reinitializes_limiter() {
        let gw = gateway(GatewayConfig::default());
        let handles = gw.start().await;
        assert_eq!(gw.limiter().store_kind(), "memory");

        let mut reloaded = GatewayConfig::default();
        reloaded.cache.strategy = CacheStrategy::Distributed;
        gw.apply_config(&reloaded).await;

        // The listener task reinitializes asynchronously.
        for _ in 0..100 {
            if gw.limiter().store_kind() == "distributed" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(gw.limiter().store_kind(), "distributed");

        gw.shutdown().trigger();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
