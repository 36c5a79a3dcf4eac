//! Where rate limiter counters live.
//!
//! # Stores
//! - `MemoryLimiterStore`: private to this process, sharded by `DashMap`
//! - `CacheLimiterStore`: the shared cache backend, atomic increment-and-expire
//!
//! Both expose the same four operations so the limiter algorithm is written
//! once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::{CacheBackend, CacheResult, Counter};
use crate::security::clock::Clock;

#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Short label for logs and metrics.
    fn kind(&self) -> &'static str;

    /// Add one hit. A new counter expires after `ttl`.
    async fn increment(&self, key: &str, ttl: Duration) -> CacheResult<Counter>;

    /// Current count, 0 when absent.
    async fn count(&self, key: &str) -> CacheResult<u64>;

    async fn block(&self, key: &str, duration: Duration) -> CacheResult<()>;

    /// Remaining block time, if blocked.
    async fn blocked_for(&self, key: &str) -> CacheResult<Option<Duration>>;
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at_ms: u64,
}

impl Slot {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }

    fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms))
    }
}

pub struct MemoryLimiterStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryLimiterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLimiterStore")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl MemoryLimiterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    /// Drop expired counters. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl LimiterStore for MemoryLimiterStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn increment(&self, key: &str, ttl: Duration) -> CacheResult<Counter> {
        let now = self.clock.now_millis();
        let mut slot = self.slots.entry(key.to_string()).or_insert(Slot {
            count: 0,
            expires_at_ms: now + ttl.as_millis() as u64,
        });
        if !slot.is_live(now) {
            *slot = Slot {
                count: 0,
                expires_at_ms: now + ttl.as_millis() as u64,
            };
        }
        slot.count += 1;
        Ok(Counter {
            count: slot.count,
            ttl: Some(slot.remaining(now)),
        })
    }

    async fn count(&self, key: &str) -> CacheResult<u64> {
        let now = self.clock.now_millis();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map_or(0, |slot| slot.count))
    }

    async fn block(&self, key: &str, duration: Duration) -> CacheResult<()> {
        let now = self.clock.now_millis();
        self.slots.insert(
            key.to_string(),
            Slot {
                count: 1,
                expires_at_ms: now + duration.as_millis() as u64,
            },
        );
        Ok(())
    }

    async fn blocked_for(&self, key: &str) -> CacheResult<Option<Duration>> {
        let now = self.clock.now_millis();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.remaining(now)))
    }
}

/// Limiter state kept in the shared cache backend.
#[derive(Debug, Clone)]
pub struct CacheLimiterStore {
    backend: Arc<dyn CacheBackend>,
}

impl CacheLimiterStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LimiterStore for CacheLimiterStore {
    fn kind(&self) -> &'static str {
        "distributed"
    }

    async fn increment(&self, key: &str, ttl: Duration) -> CacheResult<Counter> {
        self.backend.increment(key, ttl).await
    }

    async fn count(&self, key: &str) -> CacheResult<u64> {
        Ok(self
            .backend
            .peek(key)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    async fn block(&self, key: &str, duration: Duration) -> CacheResult<()> {
        self.backend.set(key, "1".to_string(), Some(duration)).await
    }

    async fn blocked_for(&self, key: &str) -> CacheResult<Option<Duration>> {
        self.backend.ttl(key).await
    }
}
