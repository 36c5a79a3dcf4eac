//! Backend selection.
//!
//! # Responsibilities
//! - Build the configured backend on first use and memoise it
//! - Fall back to memory when the distributed backend cannot connect
//! - Publish every new selection on a watch channel
//!
//! # Design Decisions
//! - Double-checked: a lock-free `ArcSwapOption` read on the hot path, an
//!   async mutex around the one-time selection so concurrent first callers
//!   open at most one connection
//! - A failed distributed selection is not retried until `reset()`

use std::sync::{Arc, RwLock};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::cache::distributed::{Connector, DistributedCache};
use crate::cache::memory::MemoryCache;
use crate::cache::redis_store::RedisConnector;
use crate::cache::CacheBackend;
use crate::config::schema::{CacheConfig, CacheStrategy};
use crate::observability::metrics;

/// What the selector is currently serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    pub strategy: CacheStrategy,
    pub is_distributed: bool,
    pub is_memory: bool,
}

impl CacheInfo {
    fn selected(strategy: CacheStrategy) -> Self {
        Self {
            strategy,
            is_distributed: strategy == CacheStrategy::Distributed,
            is_memory: strategy == CacheStrategy::Memory,
        }
    }

    fn unselected(strategy: CacheStrategy) -> Self {
        Self {
            strategy,
            is_distributed: false,
            is_memory: false,
        }
    }
}

/// One published selection.
///
/// `generation` grows with every selection, so a reconnect that keeps the
/// same strategy is still seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionChange {
    pub generation: u64,
    pub info: CacheInfo,
}

struct Selection {
    backend: Arc<dyn CacheBackend>,
    strategy: CacheStrategy,
}

pub struct CacheSelector {
    config: RwLock<CacheConfig>,
    connector: Arc<dyn Connector>,
    active: ArcSwapOption<Selection>,
    init: Mutex<()>,
    changes: watch::Sender<SelectionChange>,
}

impl std::fmt::Debug for CacheSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSelector")
            .field("info", &self.get_cache_info())
            .finish_non_exhaustive()
    }
}

impl CacheSelector {
    /// Selector whose distributed backend is Redis.
    pub fn new(config: CacheConfig) -> Self {
        let connector = Arc::new(RedisConnector::from_config(&config));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: CacheConfig, connector: Arc<dyn Connector>) -> Self {
        let (changes, _) = watch::channel(SelectionChange {
            generation: 0,
            info: CacheInfo::unselected(config.strategy),
        });
        Self {
            config: RwLock::new(config),
            connector,
            active: ArcSwapOption::empty(),
            init: Mutex::new(()),
            changes,
        }
    }

    pub fn configured_strategy(&self) -> CacheStrategy {
        self.config.read().expect("cache selector config lock poisoned").strategy
    }

    /// The active backend, selecting one on first use.
    pub async fn get_instance(&self) -> Arc<dyn CacheBackend> {
        if let Some(selection) = self.active.load_full() {
            return selection.backend.clone();
        }

        let _guard = self.init.lock().await;
        if let Some(selection) = self.active.load_full() {
            return selection.backend.clone();
        }

        let selection = self.select().await;
        let backend = selection.backend.clone();
        let info = CacheInfo::selected(selection.strategy);
        self.active.store(Some(Arc::new(selection)));

        metrics::record_cache_selected(info.strategy.as_str());
        self.changes.send_modify(|current| {
            current.generation += 1;
            current.info = info;
        });
        backend
    }

    async fn select(&self) -> Selection {
        match self.configured_strategy() {
            CacheStrategy::Memory => {
                tracing::info!(strategy = "memory", "Cache backend selected");
                memory_selection()
            }
            CacheStrategy::Distributed => {
                let distributed = DistributedCache::new(self.connector.clone());
                match distributed.connect().await {
                    Ok(()) => {
                        tracing::info!(strategy = "distributed", target_store = %self.connector.describe(), "Cache backend selected");
                        Selection {
                            backend: Arc::new(distributed),
                            strategy: CacheStrategy::Distributed,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            target_store = %self.connector.describe(),
                            error = %e,
                            "Distributed cache unavailable, falling back to memory"
                        );
                        memory_selection()
                    }
                }
            }
        }
    }

    /// Forget the current selection. Callers holding the old backend keep it.
    pub async fn reset(&self) {
        let _guard = self.init.lock().await;
        if self.active.swap(None).is_some() {
            tracing::debug!("Cache selection reset");
        }
    }

    /// Change the configured strategy and select again.
    pub async fn switch_strategy(&self, strategy: CacheStrategy) -> Arc<dyn CacheBackend> {
        let previous = {
            let mut config = self.config.write().expect("cache selector config lock poisoned");
            std::mem::replace(&mut config.strategy, strategy)
        };
        tracing::info!(from = %previous, to = %strategy, "Switching cache strategy");
        self.reset().await;
        self.get_instance().await
    }

    /// Synchronous view of the current selection.
    pub fn get_cache_info(&self) -> CacheInfo {
        match &*self.active.load() {
            Some(selection) => CacheInfo::selected(selection.strategy),
            None => CacheInfo::unselected(self.configured_strategy()),
        }
    }

    /// Receive every new selection, including same-strategy reconnects.
    pub fn subscribe(&self) -> watch::Receiver<SelectionChange> {
        self.changes.subscribe()
    }
}

fn memory_selection() -> Selection {
    Selection {
        backend: Arc::new(MemoryCache::new()),
        strategy: CacheStrategy::Memory,
    }
}
