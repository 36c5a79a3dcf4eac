//! Shared cache backend.
//!
//! # Responsibilities
//! - Own the lifecycle of one remote connection (`connect` / `disconnect`)
//! - Refuse work before connect with `CacheError::NotConnected`
//! - Degrade `has` / `delete` / `size` to `false` / `false` / `0` on failure
//!
//! # Design Decisions
//! - The wire protocol sits behind `RemoteStore` so this type holds no
//!   Redis specifics and can be exercised with an in-process fake
//! - The connection is shared via `Arc`; callers already holding it finish
//!   their call even if `disconnect` runs concurrently

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{CacheBackend, CacheError, CacheResult, CacheStats, ConnectionState, Counter};
use crate::config::schema::CacheStrategy;
use crate::observability::metrics;

/// Commands the distributed backend needs from a remote store.
///
/// Keys passed in are un-prefixed; namespacing is the store's job.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()>;
    async fn exists(&self, key: &str) -> CacheResult<bool>;
    async fn del(&self, key: &str) -> CacheResult<bool>;
    /// Delete every key in this store's namespace.
    async fn clear(&self) -> CacheResult<()>;
    /// Count keys in this store's namespace.
    async fn count(&self) -> CacheResult<usize>;
    /// Atomic increment; the expiry is set only when the counter is new.
    async fn incr(&self, key: &str, ttl: Duration) -> CacheResult<Counter>;
    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>>;
}

/// Opens remote connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> CacheResult<Arc<dyn RemoteStore>>;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

pub struct DistributedCache {
    connector: Arc<dyn Connector>,
    store: RwLock<Option<Arc<dyn RemoteStore>>>,
    state: AtomicU8,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for DistributedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCache")
            .field("target", &self.connector.describe())
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl DistributedCache {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            store: RwLock::new(None),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn store(&self) -> CacheResult<Arc<dyn RemoteStore>> {
        self.store
            .read()
            .expect("distributed cache lock poisoned")
            .clone()
            .ok_or(CacheError::NotConnected)
    }

    pub async fn connect(&self) -> CacheResult<()> {
        if self.connection_state() == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);
        match self.connector.connect().await {
            Ok(store) => {
                *self.store.write().expect("distributed cache lock poisoned") = Some(store);
                self.set_state(ConnectionState::Connected);
                tracing::info!(target_store = %self.connector.describe(), "Distributed cache connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    pub fn disconnect(&self) {
        let previous = self.store.write().expect("distributed cache lock poisoned").take();
        self.set_state(ConnectionState::Disconnected);
        if previous.is_some() {
            tracing::info!(target_store = %self.connector.describe(), "Distributed cache disconnected");
        }
    }
}

#[async_trait]
impl CacheBackend for DistributedCache {
    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::Distributed
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        let ttl = ttl.filter(|t| !t.is_zero());
        self.store()?.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let value = self.store()?.get(key).await?;
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache_read("distributed", value.is_some());
        Ok(value)
    }

    async fn peek(&self, key: &str) -> CacheResult<Option<String>> {
        self.store()?.get(key).await
    }

    async fn has(&self, key: &str) -> bool {
        match self.store() {
            Ok(store) => store.exists(key).await.unwrap_or_else(|e| {
                tracing::warn!(key, error = %e, "Distributed cache has() failed");
                false
            }),
            Err(_) => false,
        }
    }

    async fn delete(&self, key: &str) -> bool {
        match self.store() {
            Ok(store) => store.del(key).await.unwrap_or_else(|e| {
                tracing::warn!(key, error = %e, "Distributed cache delete() failed");
                false
            }),
            Err(_) => false,
        }
    }

    async fn clear(&self) -> CacheResult<()> {
        self.store()?.clear().await
    }

    async fn size(&self) -> usize {
        match self.store() {
            Ok(store) => store.count().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Distributed cache size() failed");
                0
            }),
            Err(_) => 0,
        }
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.size().await,
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> CacheResult<Counter> {
        self.store()?.incr(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        self.store()?.ttl(key).await
    }
}
