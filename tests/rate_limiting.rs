//! Rate limiting through the gateway, on both stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use resilience_gateway::cache::{CacheResult, Connector, RemoteStore};
use resilience_gateway::config::{CacheStrategy, GatewayConfig, RateLimitConfig, WindowKind};
use resilience_gateway::Gateway;

mod common;

use common::{SharedConnector, SharedStore};

fn config(points: u64, strategy: CacheStrategy) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.cache.strategy = strategy;
    config.rate_limit = RateLimitConfig {
        points,
        duration_secs: 60,
        ..RateLimitConfig::default()
    };
    config
}

#[tokio::test]
async fn test_five_points_per_minute() {
    let (gateway, clock) = common::gateway(config(5, CacheStrategy::Memory));
    gateway.limiter().reinitialize().await;

    for expected in (0..5).rev() {
        let quota = gateway.admit("10.0.0.1").await.unwrap();
        assert_eq!(quota.remaining, expected);
        assert_eq!(quota.limit, 5);
    }

    let exceeded = gateway.admit("10.0.0.1").await.unwrap_err();
    assert_eq!(exceeded.retry_after_seconds, 60);
    assert_eq!(exceeded.remaining, 0);

    // Other clients have their own budget.
    assert!(gateway.admit("10.0.0.2").await.is_ok());

    clock.advance(Duration::from_secs(60));
    assert_eq!(gateway.admit("10.0.0.1").await.unwrap().remaining, 4);
}

#[tokio::test]
async fn test_block_duration_outlasts_window() {
    let mut cfg = config(2, CacheStrategy::Memory);
    cfg.rate_limit.duration_secs = 10;
    cfg.rate_limit.block_duration_secs = 120;
    let (gateway, clock) = common::gateway(cfg);
    gateway.limiter().reinitialize().await;

    gateway.admit("client").await.unwrap();
    gateway.admit("client").await.unwrap();
    let exceeded = gateway.admit("client").await.unwrap_err();
    assert_eq!(exceeded.retry_after_seconds, 120);

    // The window has rolled over but the block still holds.
    clock.advance(Duration::from_secs(30));
    let exceeded = gateway.admit("client").await.unwrap_err();
    assert_eq!(exceeded.retry_after_seconds, 90);

    clock.advance(Duration::from_secs(91));
    assert!(gateway.admit("client").await.is_ok());
}

#[tokio::test]
async fn test_sliding_window_carries_previous_traffic() {
    let mut cfg = config(10, CacheStrategy::Memory);
    cfg.rate_limit.window = WindowKind::Sliding;
    let (gateway, clock) = common::gateway(cfg);
    gateway.limiter().reinitialize().await;

    clock.set(60_000);
    for _ in 0..10 {
        gateway.admit("client").await.unwrap();
    }

    // Halfway into the next window half of the previous ten still count.
    clock.set(150_000);
    for _ in 0..5 {
        gateway.admit("client").await.unwrap();
    }
    assert!(gateway.admit("client").await.is_err());
}

#[tokio::test]
async fn test_distributed_budget_is_shared_between_gateways() {
    let store = Arc::new(SharedStore::default());
    let (a, _) = common::gateway_with(
        config(5, CacheStrategy::Distributed),
        Arc::new(SharedConnector::new(store.clone())),
    );
    let (b, _) = common::gateway_with(
        config(5, CacheStrategy::Distributed),
        Arc::new(SharedConnector::new(store.clone())),
    );
    a.limiter().reinitialize().await;
    b.limiter().reinitialize().await;
    assert_eq!(a.limiter().store_kind(), "distributed");

    for _ in 0..3 {
        a.admit("10.0.0.9").await.unwrap();
    }
    for _ in 0..2 {
        b.admit("10.0.0.9").await.unwrap();
    }
    assert!(a.admit("10.0.0.9").await.is_err());
    assert!(b.admit("10.0.0.9").await.is_err());
}

#[tokio::test]
async fn test_store_failure_fails_open_per_request() {
    let store = Arc::new(SharedStore::default());
    let (gateway, _) = common::gateway_with(
        config(3, CacheStrategy::Distributed),
        Arc::new(SharedConnector::new(store.clone())),
    );
    gateway.limiter().reinitialize().await;

    store.failing.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        assert!(gateway.admit("client").await.is_ok());
    }
    // The local table still enforces the budget.
    assert!(gateway.admit("client").await.is_err());
    assert_eq!(gateway.limiter().store_kind(), "distributed");

    store.failing.store(false, Ordering::SeqCst);
    assert!(gateway.admit("client").await.is_ok());
}

#[tokio::test]
async fn test_unreachable_store_uses_local_table() {
    let (gateway, _) = common::gateway_with(
        config(5, CacheStrategy::Distributed),
        Arc::new(SharedConnector::unreachable()),
    );
    let tasks = gateway.start().await;

    assert_eq!(gateway.limiter().store_kind(), "memory");
    assert!(!gateway.cache().get_cache_info().is_distributed);
    assert!(gateway.admit("client").await.is_ok());

    gateway.shutdown().trigger();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_disabled_limiter_admits_everything() {
    let mut cfg = config(1, CacheStrategy::Memory);
    cfg.rate_limit.enabled = false;
    let (gateway, _) = common::gateway(cfg);

    for _ in 0..50 {
        assert!(gateway.admit("client").await.is_ok());
    }
}

async fn admitted_concurrently(gateway: &Arc<Gateway>, identifier: &str, attempts: usize) -> usize {
    let mut tasks = Vec::new();
    for _ in 0..attempts {
        let gateway = gateway.clone();
        let identifier = identifier.to_string();
        tasks.push(tokio::spawn(async move { gateway.admit(&identifier).await.is_ok() }));
    }
    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    admitted
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_on_local_table() {
    let (gateway, _) = common::gateway(config(5, CacheStrategy::Memory));
    gateway.limiter().reinitialize().await;
    assert_eq!(gateway.limiter().store_kind(), "memory");

    assert_eq!(admitted_concurrently(&gateway, "10.0.0.1", 40).await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_on_shared_store() {
    let store = Arc::new(SharedStore::default());
    let (a, _) = common::gateway_with(
        config(5, CacheStrategy::Distributed),
        Arc::new(SharedConnector::new(store.clone())),
    );
    let (b, _) = common::gateway_with(
        config(5, CacheStrategy::Distributed),
        Arc::new(SharedConnector::new(store.clone())),
    );
    a.limiter().reinitialize().await;
    b.limiter().reinitialize().await;
    assert_eq!(a.limiter().store_kind(), "distributed");

    let (from_a, from_b) = tokio::join!(
        admitted_concurrently(&a, "10.0.0.1", 20),
        admitted_concurrently(&b, "10.0.0.1", 20),
    );
    assert_eq!(from_a + from_b, 5);
}

/// Hands out a different store on each connect, keeping the last one.
struct ReconnectingConnector {
    stores: Vec<Arc<SharedStore>>,
    next: AtomicUsize,
}

#[async_trait]
impl Connector for ReconnectingConnector {
    async fn connect(&self) -> CacheResult<Arc<dyn RemoteStore>> {
        let i = self.next.fetch_add(1, Ordering::SeqCst).min(self.stores.len() - 1);
        Ok(self.stores[i].clone())
    }

    fn describe(&self) -> String {
        "reconnecting://test".to_string()
    }
}

#[tokio::test]
async fn test_limiter_follows_same_strategy_reconnect() {
    let first = Arc::new(SharedStore::default());
    let second = Arc::new(SharedStore::default());
    let connector = ReconnectingConnector {
        stores: vec![first.clone(), second.clone()],
        next: AtomicUsize::new(0),
    };
    let (gateway, _) = common::gateway_with(config(5, CacheStrategy::Distributed), Arc::new(connector));
    let tasks = gateway.start().await;

    gateway.admit("client").await.unwrap();
    assert_eq!(first.count_keys(), 1);

    // The first connection dies; reselect and reconnect.
    first.failing.store(true, Ordering::SeqCst);
    gateway.selector().reset().await;
    gateway.selector().get_instance().await;

    // Let the cache-change listener run.
    tokio::time::sleep(Duration::from_millis(20)).await;

    for expected in [4, 3, 2] {
        assert_eq!(gateway.admit("client").await.unwrap().remaining, expected);
    }
    assert_eq!(gateway.limiter().store_kind(), "distributed");
    assert_eq!(second.count_keys(), 1);
    assert_eq!(second.get("rl:client").await.unwrap().as_deref(), Some("3"));

    gateway.shutdown().trigger();
    for task in tasks {
        task.await.unwrap();
    }
}
