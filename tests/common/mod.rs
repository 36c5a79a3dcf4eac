//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing_subscriber::fmt::MakeWriter;

use resilience_gateway::cache::{CacheError, CacheResult, Connector, Counter, RemoteStore};
use resilience_gateway::config::GatewayConfig;
use resilience_gateway::resilience::circuit_breaker::Action;
use resilience_gateway::resilience::error_classifier::DownstreamError;
use resilience_gateway::resilience::fallback::FallbackRegistry;
use resilience_gateway::resilience::Payload;
use resilience_gateway::security::clock::ManualClock;
use resilience_gateway::Gateway;

type Responder = dyn Fn(usize, Payload) -> Result<Payload, DownstreamError> + Send + Sync;

/// Downstream stand-in that counts invocations and answers from a closure.
#[derive(Clone)]
pub struct ScriptedAction {
    calls: Arc<AtomicUsize>,
    responder: Arc<Responder>,
    delay: Option<Duration>,
}

impl ScriptedAction {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(usize, Payload) -> Result<Payload, DownstreamError> + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            responder: Arc::new(responder),
            delay: None,
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_, request| Ok(serde_json::json!({ "ok": true, "request": request })))
    }

    pub fn failing(error: DownstreamError) -> Self {
        Self::new(move |_, _| Err(error.clone()))
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for ScriptedAction {
    async fn call(&self, request: Payload) -> Result<Payload, DownstreamError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(n, request)
    }
}

/// In-process stand-in for Redis, shareable between gateways.
#[derive(Default)]
pub struct SharedStore {
    data: Mutex<HashMap<String, (String, Option<Instant>)>>,
    pub failing: AtomicBool,
}

impl SharedStore {
    fn check(&self) -> CacheResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Backend("connection reset by peer".into()))
        } else {
            Ok(())
        }
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Option<Instant>)>> {
        let mut data = self.data.lock().unwrap();
        let now = Instant::now();
        data.retain(|_, (_, exp)| exp.map_or(true, |at| at > now));
        data
    }

    pub fn count_keys(&self) -> usize {
        self.live().len()
    }
}

#[async_trait]
impl RemoteStore for SharedStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check()?;
        Ok(self.live().get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        self.check()?;
        self.live()
            .insert(key.to_string(), (value, ttl.map(|t| Instant::now() + t)));
        Ok(())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.check()?;
        Ok(self.live().contains_key(key))
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        self.check()?;
        Ok(self.live().remove(key).is_some())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.check()?;
        self.live().clear();
        Ok(())
    }

    async fn count(&self) -> CacheResult<usize> {
        self.check()?;
        Ok(self.live().len())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> CacheResult<Counter> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.live();
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| ("0".to_string(), Some(now + ttl)));
        let count = entry.0.parse::<u64>().unwrap_or(0) + 1;
        entry.0 = count.to_string();
        Ok(Counter {
            count,
            ttl: entry.1.map(|at| at.saturating_duration_since(now)),
        })
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .live()
            .get(key)
            .and_then(|(_, exp)| exp.map(|at| at.saturating_duration_since(now))))
    }
}

pub struct SharedConnector {
    pub store: Arc<SharedStore>,
    pub reachable: AtomicBool,
}

impl SharedConnector {
    pub fn new(store: Arc<SharedStore>) -> Self {
        Self {
            store,
            reachable: AtomicBool::new(true),
        }
    }

    pub fn unreachable() -> Self {
        let connector = Self::new(Arc::new(SharedStore::default()));
        connector.reachable.store(false, Ordering::SeqCst);
        connector
    }
}

#[async_trait]
impl Connector for SharedConnector {
    async fn connect(&self) -> CacheResult<Arc<dyn RemoteStore>> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("connection refused".into()));
        }
        Ok(self.store.clone())
    }

    fn describe(&self) -> String {
        "shared://test".to_string()
    }
}

/// Gateway with default fallbacks, a manual clock at t=0 and the given connector.
pub fn gateway_with(config: GatewayConfig, connector: Arc<dyn Connector>) -> (Arc<Gateway>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let gateway = Gateway::with_components(config, connector, FallbackRegistry::with_defaults(), clock.clone());
    (Arc::new(gateway), clock)
}

pub fn gateway(config: GatewayConfig) -> (Arc<Gateway>, Arc<ManualClock>) {
    gateway_with(config, Arc::new(SharedConnector::new(Arc::new(SharedStore::default()))))
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }
}

pub struct CapturedWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CapturedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CapturedWriter { buf: self.buf.clone() }
    }
}

/// Install a thread-local subscriber writing into a `CapturedLogs`.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}
