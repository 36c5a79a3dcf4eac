//! In-process cache backend.
//!
//! Every key with a TTL owns an expiry task. Replacing the key aborts the old
//! task, `clear` aborts all of them. Reads also check the deadline so a value
//! is never served late if the task has not run yet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::cache::{CacheBackend, CacheResult, CacheStats, ConnectionState, Counter};
use crate::config::schema::CacheStrategy;
use crate::observability::metrics;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }

    fn cancel_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

type Table = DashMap<String, Entry>;

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Arc<Table>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// A zero TTL means "no expiry".
fn effective_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|t| !t.is_zero())
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn spawn_expiry(&self, key: &str, generation: u64, ttl: Duration) -> AbortHandle {
        let table: Weak<Table> = Arc::downgrade(&self.entries);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(table) = table.upgrade() {
                table.remove_if(&key, |_, entry| entry.generation == generation);
            }
        })
        .abort_handle()
    }

    fn new_entry(&self, key: &str, value: String, ttl: Option<Duration>, now: Instant) -> Entry {
        let generation = self.next_generation();
        let ttl = effective_ttl(ttl);
        Entry {
            value,
            expires_at: ttl.map(|t| now + t),
            generation,
            timer: ttl.map(|t| self.spawn_expiry(key, generation, t)),
        }
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.cancel_timer();
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::Memory
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        let entry = self.new_entry(key, value, ttl, Instant::now());
        if let Some(previous) = self.entries.insert(key.to_string(), entry) {
            previous.cancel_timer();
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let value = self.live_value(key);
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache_read("memory", value.is_some());
        Ok(value)
    }

    async fn peek(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn has(&self, key: &str) -> bool {
        self.live_value(key).is_some()
    }

    async fn delete(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.cancel_timer();
                !entry.is_expired(Instant::now())
            }
            None => false,
        }
    }

    async fn clear(&self) -> CacheResult<()> {
        for entry in self.entries.iter() {
            entry.cancel_timer();
        }
        self.entries.clear();
        Ok(())
    }

    async fn size(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.size().await,
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> CacheResult<Counter> {
        let now = Instant::now();
        let counter = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let entry = occupied.get_mut();
                let count = entry.value.parse::<u64>().unwrap_or(0) + 1;
                entry.value = count.to_string();
                Counter {
                    count,
                    ttl: entry.remaining(now),
                }
            }
            MapEntry::Occupied(mut occupied) => {
                let fresh = self.new_entry(key, "1".to_string(), Some(ttl), now);
                let remaining = fresh.remaining(now);
                occupied.insert(fresh).cancel_timer();
                Counter {
                    count: 1,
                    ttl: remaining,
                }
            }
            MapEntry::Vacant(vacant) => {
                let fresh = self.new_entry(key, "1".to_string(), Some(ttl), now);
                let remaining = fresh.remaining(now);
                vacant.insert(fresh);
                Counter {
                    count: 1,
                    ttl: remaining,
                }
            }
        };
        Ok(counter)
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.remaining(now)))
    }
}
