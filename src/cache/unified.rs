//! One cache contract regardless of backend.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::selector::{CacheInfo, CacheSelector};
use crate::cache::{CacheBackend, CacheResult, CacheStats, Counter};

/// Typed facade over whichever backend the selector is serving.
///
/// Each call resolves the backend once, so a concurrent switch never splits
/// a single operation across two backends.
#[derive(Debug, Clone)]
pub struct UnifiedCache {
    selector: Arc<CacheSelector>,
    default_ttl: Option<Duration>,
}

impl UnifiedCache {
    pub fn new(selector: Arc<CacheSelector>) -> Self {
        Self {
            selector,
            default_ttl: None,
        }
    }

    /// TTL applied by `set` when the caller passes none.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl).filter(|t| !t.is_zero());
        self
    }

    pub fn selector(&self) -> &Arc<CacheSelector> {
        &self.selector
    }

    pub async fn backend(&self) -> Arc<dyn CacheBackend> {
        self.selector.get_instance().await
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()> {
        let encoded = serde_json::to_string(value)?;
        self.backend().await.set(key, encoded, ttl.or(self.default_ttl)).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.backend().await.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn has(&self, key: &str) -> bool {
        self.backend().await.has(key).await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.backend().await.delete(key).await
    }

    pub async fn clear(&self) -> CacheResult<()> {
        self.backend().await.clear().await
    }

    pub async fn size(&self) -> usize {
        self.backend().await.size().await
    }

    pub async fn increment(&self, key: &str, ttl: Duration) -> CacheResult<Counter> {
        self.backend().await.increment(key, ttl).await
    }

    pub async fn get_stats(&self) -> CacheStats {
        self.backend().await.stats().await
    }

    pub fn get_cache_info(&self) -> CacheInfo {
        self.selector.get_cache_info()
    }
}
