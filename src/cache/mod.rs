//! Cache subsystem.
//!
//! # Data Flow
//! ```text
//! Caller:
//!     → unified.rs (serde at the edge, one contract)
//!     → selector.rs (memoised backend choice, fallback to memory)
//!     → memory.rs | distributed.rs (string key/value with TTL)
//!                       → redis_store.rs (Redis behind the RemoteStore seam)
//! ```
//!
//! # Design Decisions
//! - Backends store strings; typed values are serialised once, in `UnifiedCache`
//! - Switching backends exchanges an `Arc`, in-flight users keep theirs
//! - `increment` is the only compound operation and is atomic per backend

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::schema::CacheStrategy;

pub mod distributed;
pub mod memory;
pub mod redis_store;
pub mod selector;
pub mod unified;

pub use distributed::{Connector, DistributedCache, RemoteStore};
pub use memory::MemoryCache;
pub use redis_store::{RedisConnector, RedisStore};
pub use selector::{CacheInfo, CacheSelector, SelectionChange};
pub use unified::UnifiedCache;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend is not connected")]
    NotConnected,

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<CacheError> for crate::error::GatewayError {
    fn from(err: CacheError) -> Self {
        crate::error::GatewayError::CacheBackendUnavailable(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

/// Result of an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub count: u64,
    /// Time until the counter expires, if it has an expiry.
    pub ttl: Option<Duration>,
}

/// A key/value store with TTL.
///
/// `has`, `delete` and `size` never fail: an unreachable backend answers
/// `false`, `false` and `0`.
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    fn strategy(&self) -> CacheStrategy;

    fn connection_state(&self) -> ConnectionState;

    /// Store `value` under `key`. `None` never expires.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Like `get` but leaves hit/miss statistics alone.
    async fn peek(&self, key: &str) -> CacheResult<Option<String>>;

    async fn has(&self, key: &str) -> bool;

    async fn delete(&self, key: &str) -> bool;

    async fn clear(&self) -> CacheResult<()>;

    async fn size(&self) -> usize;

    async fn stats(&self) -> CacheStats;

    /// Add one to the counter at `key`. A new counter expires after `ttl`.
    async fn increment(&self, key: &str, ttl: Duration) -> CacheResult<Counter>;

    /// Remaining time to live. `None` if the key is missing or never expires.
    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>>;
}
