//! Redis implementation of `RemoteStore`.
//!
//! # Design Decisions
//! - One multiplexed connection per store; clones share the pipe
//! - Connect is bounded by `connect_timeout_ms`
//! - Every key is namespaced with `key_prefix`; `clear` and `count` walk
//!   the namespace with `SCAN`, never `KEYS` or `FLUSHDB`
//! - Increment and first-hit expiry run as one Lua script

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};

use crate::cache::distributed::{Connector, RemoteStore};
use crate::cache::{CacheError, CacheResult, Counter};
use crate::config::schema::CacheConfig;

const SCAN_BATCH: usize = 100;

/// INCR, then set the expiry when the counter is new or has none.
/// Returns `{count, pttl}`.
const INCR_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return {count, redis.call('PTTL', KEYS[1])}
"#;

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Convert a PTTL reply into a duration. Negative means "missing" or "no expiry".
fn pttl_to_duration(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    incr_script: Arc<Script>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    pub fn new(conn: MultiplexedConnection, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            incr_script: Arc::new(Script::new(INCR_WITH_EXPIRY)),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn scan_namespace(&self) -> CacheResult<Vec<String>> {
        let pattern = format!("{}*", self.key_prefix);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            found.extend(keys);
            if next == 0 {
                return Ok(found);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.key(key)).await?)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        match ttl {
            Some(ttl) => {
                let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(key, value, ms).await?;
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.key(key)).await?)
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.key(key)).await?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> CacheResult<()> {
        let keys = self.scan_namespace().await?;
        let mut conn = self.conn.clone();
        for batch in keys.chunks(SCAN_BATCH) {
            conn.del::<_, ()>(batch).await?;
        }
        tracing::debug!(prefix = %self.key_prefix, removed = keys.len(), "Cleared distributed namespace");
        Ok(())
    }

    async fn count(&self) -> CacheResult<usize> {
        Ok(self.scan_namespace().await?.len())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> CacheResult<Counter> {
        let mut conn = self.conn.clone();
        let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let (count, pttl): (i64, i64) = self
            .incr_script
            .key(self.key(key))
            .arg(ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(Counter {
            count: u64::try_from(count).unwrap_or(0),
            ttl: pttl_to_duration(pttl),
        })
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let pttl: i64 = conn.pttl(self.key(key)).await?;
        Ok(pttl_to_duration(pttl))
    }
}

/// Opens `RedisStore`s from cache configuration.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    url: String,
    key_prefix: String,
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(url: impl Into<String>, key_prefix: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            key_prefix: key_prefix.into(),
            connect_timeout,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.redis_url.clone(),
            config.key_prefix.clone(),
            Duration::from_millis(config.connect_timeout_ms),
        )
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> CacheResult<Arc<dyn RemoteStore>> {
        let client = Client::open(self.url.as_str())?;
        let conn = tokio::time::timeout(self.connect_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| {
                CacheError::Backend(format!(
                    "connect to {} timed out after {}ms",
                    self.url,
                    self.connect_timeout.as_millis()
                ))
            })??;

        // Fail at connect time, not on the first real command.
        let mut probe = conn.clone();
        redis::cmd("PING").query_async::<String>(&mut probe).await?;

        Ok(Arc::new(RedisStore::new(conn, self.key_prefix.clone())))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, DistributedCache};

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
    }

    #[test]
    fn test_pttl_mapping() {
        assert_eq!(pttl_to_duration(1500), Some(Duration::from_millis(1500)));
        assert_eq!(pttl_to_duration(-1), None);
        assert_eq!(pttl_to_duration(-2), None);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_connect() {
        let connector = RedisConnector::new("redis://127.0.0.1:1/", "test:", Duration::from_millis(200));
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis server running
    async fn test_redis_backend_contract() {
        let prefix = format!("gateway-test-{}:", std::process::id());
        let connector = RedisConnector::new(redis_url(), prefix, Duration::from_secs(2));
        let cache = DistributedCache::new(Arc::new(connector));
        cache.connect().await.expect("Redis should be reachable");
        cache.clear().await.unwrap();

        cache.set("a", "1".into(), None).await.unwrap();
        cache
            .set("b", "2".into(), Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(cache.size().await, 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!cache.has("b").await);

        let first = cache.increment("counter", Duration::from_secs(60)).await.unwrap();
        let second = cache.increment("counter", Duration::from_secs(60)).await.unwrap();
        assert_eq!((first.count, second.count), (1, 2));
        assert!(second.ttl.is_some());

        cache.clear().await.unwrap();
        assert_eq!(cache.size().await, 0);
    }
}
