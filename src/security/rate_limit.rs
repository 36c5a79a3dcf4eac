//! Per-identifier request budgets.
//!
//! # Responsibilities
//! - Enforce `points` per `duration` per client identifier
//! - Apply the block penalty once a budget is exhausted
//! - Keep counters in the shared cache when it is distributed and
//!   connected, otherwise in a private in-process table
//!
//! # Design Decisions
//! - The active store is an `ArcSwap`; `reinitialize` exchanges it and
//!   in-flight calls finish against the store they loaded
//! - A distributed store failure degrades that one call to the local table
//!   (fail-safe) without switching stores
//! - Sliding windows are aligned to Unix time so every process sharing the
//!   store computes the same window index

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::cache::{CacheResult, ConnectionState, UnifiedCache};
use crate::config::schema::{CacheStrategy, RateLimitConfig, WindowKind};
use crate::observability::metrics;
use crate::security::clock::{Clock, SystemClock};
use crate::security::limiter_store::{CacheLimiterStore, LimiterStore, MemoryLimiterStore};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";

/// Seconds a rejected client should wait, from a millisecond hint.
///
/// `max(1, ceil(ms / 1000))`; a missing or non-positive hint gives 1.
pub fn retry_after_seconds(ms_before_next: Option<i64>) -> u64 {
    match ms_before_next {
        Some(ms) if ms > 0 => (ms as u64).div_ceil(1000).max(1),
        _ => 1,
    }
}

/// Budget left after an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitQuota {
    pub remaining: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[error("rate limit exceeded, retry after {retry_after_seconds}s")]
pub struct RateLimitExceeded {
    pub retry_after_seconds: u64,
    pub limit: u64,
    pub remaining: u64,
}

impl RateLimitExceeded {
    fn new(limit: u64, ms_before_next: Option<i64>) -> Self {
        Self {
            retry_after_seconds: retry_after_seconds(ms_before_next),
            limit,
            remaining: 0,
        }
    }
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": "Too many requests",
            "retry_after_seconds": self.retry_after_seconds,
            "limit": self.limit,
            "remaining": self.remaining,
        }));
        let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(self.retry_after_seconds));
        headers.insert(HEADER_LIMIT, HeaderValue::from(self.limit));
        headers.insert(HEADER_REMAINING, HeaderValue::from(0u64));
        response
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

struct ActiveStore {
    store: Arc<dyn LimiterStore>,
}

pub struct RateLimiterController {
    config: RateLimitConfig,
    cache: UnifiedCache,
    clock: Arc<dyn Clock>,
    local: Arc<MemoryLimiterStore>,
    active: ArcSwap<ActiveStore>,
}

impl std::fmt::Debug for RateLimiterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterController")
            .field("points", &self.config.points)
            .field("duration_secs", &self.config.duration_secs)
            .field("store", &self.store_kind())
            .finish_non_exhaustive()
    }
}

impl RateLimiterController {
    pub fn new(config: RateLimitConfig, cache: UnifiedCache) -> Self {
        Self::with_clock(config, cache, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, cache: UnifiedCache, clock: Arc<dyn Clock>) -> Self {
        let local = Arc::new(MemoryLimiterStore::new(clock.clone()));
        let active = ArcSwap::from_pointee(ActiveStore {
            store: local.clone(),
        });
        Self {
            config,
            cache,
            clock,
            local,
            active,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// `memory` or `distributed`.
    pub fn store_kind(&self) -> &'static str {
        self.active.load().store.kind()
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.duration_secs.max(1))
    }

    fn block_duration(&self) -> Option<Duration> {
        (self.config.block_duration_secs > 0).then(|| Duration::from_secs(self.config.block_duration_secs))
    }

    /// Re-read the cache selection and swap stores if needed.
    pub async fn reinitialize(&self) {
        let backend = self.cache.backend().await;
        let shared = backend.strategy() == CacheStrategy::Distributed
            && backend.connection_state() == ConnectionState::Connected;

        let next: Arc<dyn LimiterStore> = if shared {
            Arc::new(CacheLimiterStore::new(backend))
        } else {
            self.local.clone()
        };
        let previous = self.active.swap(Arc::new(ActiveStore { store: next.clone() }));

        if previous.store.kind() != next.kind() {
            tracing::info!(from = previous.store.kind(), to = next.kind(), "Rate limiter store switched");
        } else {
            tracing::debug!(store = next.kind(), "Rate limiter reinitialized");
        }
    }

    /// Consume one point for `identifier`.
    pub async fn consume(&self, identifier: &str) -> Result<RateLimitQuota, RateLimitExceeded> {
        if !self.config.enabled {
            return Ok(RateLimitQuota {
                remaining: self.config.points,
                limit: self.config.points,
            });
        }

        let active = self.active.load_full();
        let decision = match self.decide(active.store.as_ref(), identifier).await {
            Ok(decision) => {
                metrics::record_rate_limit(outcome_label(&decision), active.store.kind());
                decision
            }
            Err(e) => {
                tracing::warn!(
                    identifier,
                    store = active.store.kind(),
                    error = %e,
                    "Rate limiter store failed, using local table for this request"
                );
                let decision = self.decide_locally(identifier).await;
                metrics::record_rate_limit(outcome_label(&decision), self.local.kind());
                decision
            }
        };

        if let Err(exceeded) = &decision {
            tracing::debug!(identifier, retry_after = exceeded.retry_after_seconds, "Rate limit exceeded");
        }
        decision
    }

    async fn decide_locally(&self, identifier: &str) -> Result<RateLimitQuota, RateLimitExceeded> {
        match self.decide(self.local.as_ref(), identifier).await {
            Ok(decision) => decision,
            // The local table cannot fail; admit if it somehow does.
            Err(_) => Ok(RateLimitQuota {
                remaining: self.config.points,
                limit: self.config.points,
            }),
        }
    }

    async fn decide(
        &self,
        store: &dyn LimiterStore,
        identifier: &str,
    ) -> CacheResult<Result<RateLimitQuota, RateLimitExceeded>> {
        let limit = self.config.points;
        let block_key = format!("{}block:{}", self.config.key_prefix, identifier);

        if self.block_duration().is_some() {
            if let Some(remaining) = store.blocked_for(&block_key).await? {
                return Ok(Err(RateLimitExceeded::new(limit, Some(millis(remaining)))));
            }
        }

        let (consumed, window_remaining) = match self.config.window {
            WindowKind::Fixed => self.fixed_window(store, identifier).await?,
            WindowKind::Sliding => self.sliding_window(store, identifier).await?,
        };

        if consumed > limit as f64 {
            let wait = match self.block_duration() {
                Some(block) => {
                    store.block(&block_key, block).await?;
                    block
                }
                None => window_remaining,
            };
            return Ok(Err(RateLimitExceeded::new(limit, Some(millis(wait)))));
        }

        let used = consumed.ceil() as u64;
        Ok(Ok(RateLimitQuota {
            remaining: limit.saturating_sub(used),
            limit,
        }))
    }

    /// Counter keyed by identifier, expiring one window after the first hit.
    async fn fixed_window(&self, store: &dyn LimiterStore, identifier: &str) -> CacheResult<(f64, Duration)> {
        let window = self.window();
        let key = format!("{}{}", self.config.key_prefix, identifier);
        let counter = store.increment(&key, window).await?;
        Ok((counter.count as f64, counter.ttl.unwrap_or(window)))
    }

    /// Weighted estimate over the current and previous wall-clock windows.
    async fn sliding_window(&self, store: &dyn LimiterStore, identifier: &str) -> CacheResult<(f64, Duration)> {
        let window = self.window();
        let window_ms = window.as_millis() as u64;
        let now = self.clock.now_millis();
        let index = now / window_ms;
        let elapsed = now % window_ms;

        let current_key = format!("{}{}:{}", self.config.key_prefix, identifier, index);
        let previous_key = format!("{}{}:{}", self.config.key_prefix, identifier, index.saturating_sub(1));

        // Kept for two windows so it can serve as "previous" next time.
        let current = store.increment(&current_key, window * 2).await?;
        let previous = if index == 0 { 0 } else { store.count(&previous_key).await? };

        let weight = 1.0 - (elapsed as f64 / window_ms as f64);
        let estimate = previous as f64 * weight + current.count as f64;
        Ok((estimate, Duration::from_millis(window_ms - elapsed)))
    }

    /// Sweep expired entries from the local table until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.local.purge_expired();
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.local.len(), "Swept expired rate limit entries");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Rate limit sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

fn outcome_label(decision: &Result<RateLimitQuota, RateLimitExceeded>) -> &'static str {
    match decision {
        Ok(_) => "allowed",
        Err(_) => "rejected",
    }
}
