//! Circuit breakers for downstream protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: downstream assumed down, requests fail fast to the fallback
//! - Half-Open: testing if downstream recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: fires >= volume_threshold and error rate >= threshold within window
//! Open → Half-Open: reset_timeout elapsed (observed lazily on the next read)
//! Half-Open → Closed: probe request succeeds (rolling stats cleared)
//! Half-Open → Open: probe request fails (reset timer restarts)
//! ```
//!
//! # Design Decisions
//! - One breaker per (service, operation), created lazily, never removed
//! - Fail fast in Open state (no downstream call)
//! - Single probe in Half-Open, released by an RAII guard if the caller
//!   drops the future
//! - State lock is never held across an await

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::schema::{BreakerConfig, ServiceProfile, DEFAULT_PROFILE};
use crate::error::{GatewayError, GatewayResult};
use crate::observability::metrics;
use crate::resilience::error_classifier::{DownstreamError, ErrorClassifier};
use crate::resilience::fallback::FallbackRegistry;
use crate::resilience::rolling_window::{BreakerStats, Outcome, RollingWindow};
use crate::resilience::timeouts::with_deadline;
use crate::resilience::Payload;

/// Operation name used when the caller does not specify one.
pub const DEFAULT_OPERATION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0=closed, 1=half_open, 2=open.
    pub fn gauge_value(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub service: String,
    pub operation: String,
}

impl BreakerKey {
    pub fn new(service: &str, operation: &str) -> Self {
        Self {
            service: service.to_string(),
            operation: operation.to_string(),
        }
    }
}

/// `service` for the default operation, `service-operation` otherwise.
impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operation == DEFAULT_OPERATION {
            write!(f, "{}", self.service)
        } else {
            write!(f, "{}-{}", self.service, self.operation)
        }
    }
}

/// The downstream capability a breaker wraps.
#[async_trait]
pub trait Action: Send + Sync {
    async fn call(&self, request: Payload) -> Result<Payload, DownstreamError>;
}

#[async_trait]
impl<F, Fut> Action for F
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, DownstreamError>> + Send + 'static,
{
    async fn call(&self, request: Payload) -> Result<Payload, DownstreamError> {
        (self)(request).await
    }
}

/// A state change, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    pub breaker: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub service: String,
    pub operation: String,
    pub state: CircuitState,
    pub stats: BreakerStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pass,
    Probe,
    Reject,
}

#[derive(Debug, Clone, Copy)]
enum Completion {
    Success,
    Failure { timed_out: bool },
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    window: RollingWindow,
}

impl BreakerCore {
    fn transition(&mut self, to: CircuitState, now: Instant) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        match to {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::Closed => self.opened_at = None,
            CircuitState::HalfOpen => {}
        }
        (from, to)
    }

    /// Move Open → Half-Open once the reset timeout has passed.
    fn refresh(&mut self, now: Instant, profile: &ServiceProfile) -> Option<(CircuitState, CircuitState)> {
        if self.state != CircuitState::Open {
            return None;
        }
        let opened_at = self.opened_at?;
        if now.saturating_duration_since(opened_at) >= profile.reset_timeout() {
            self.probe_in_flight = false;
            Some(self.transition(CircuitState::HalfOpen, now))
        } else {
            None
        }
    }

    fn should_trip(&mut self, now: Instant, profile: &ServiceProfile) -> bool {
        let totals = self.window.totals(now);
        totals.fires >= profile.volume_threshold
            && totals.fires > 0
            && totals.error_rate() >= profile.error_threshold_percentage
    }
}

/// A single breaker instance.
pub struct Breaker {
    key: BreakerKey,
    label: String,
    profile: ServiceProfile,
    action: Arc<dyn Action>,
    core: Mutex<BreakerCore>,
    events: broadcast::Sender<BreakerTransition>,
}

impl fmt::Debug for Breaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breaker")
            .field("key", &self.label)
            .field("profile", &self.profile.name)
            .finish_non_exhaustive()
    }
}

impl Breaker {
    fn new(
        key: BreakerKey,
        profile: ServiceProfile,
        action: Arc<dyn Action>,
        events: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        let window = RollingWindow::new(profile.rolling_window(), profile.rolling_buckets, Instant::now());
        Self {
            label: key.to_string(),
            key,
            profile,
            action,
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                opened_at: None,
                probe_in_flight: false,
                window,
            }),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        self.core.lock().expect("circuit breaker mutex poisoned")
    }

    pub fn key(&self) -> &BreakerKey {
        &self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn profile(&self) -> &ServiceProfile {
        &self.profile
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let (transition, state, stats) = {
            let mut core = self.lock();
            let transition = core.refresh(now, &self.profile);
            (transition, core.state, core.window.totals(now))
        };
        if let Some((from, to)) = transition {
            self.publish(from, to);
        }
        BreakerSnapshot {
            key: self.label.clone(),
            service: self.key.service.clone(),
            operation: self.key.operation.clone(),
            state,
            stats,
        }
    }

    fn admit(&self, now: Instant) -> Admission {
        let (transition, admission) = {
            let mut core = self.lock();
            let transition = core.refresh(now, &self.profile);
            core.window.record(Outcome::Fire, now);

            let admission = match core.state {
                CircuitState::Closed => Admission::Pass,
                CircuitState::HalfOpen if !core.probe_in_flight => {
                    core.probe_in_flight = true;
                    Admission::Probe
                }
                CircuitState::HalfOpen | CircuitState::Open => {
                    core.window.record(Outcome::Reject, now);
                    Admission::Reject
                }
            };
            (transition, admission)
        };

        if let Some((from, to)) = transition {
            self.publish(from, to);
        }
        match admission {
            Admission::Probe => {
                tracing::info!(breaker = %self.label, "Circuit breaker admitting half-open probe");
            }
            Admission::Reject => {
                tracing::debug!(breaker = %self.label, "Circuit breaker rejected request");
                metrics::record_breaker_event(&self.label, "reject");
            }
            Admission::Pass => {}
        }
        admission
    }

    fn complete(&self, admission: Admission, completion: Completion, now: Instant) {
        let transition = {
            let mut core = self.lock();
            if admission == Admission::Probe {
                core.probe_in_flight = false;
            }

            match completion {
                Completion::Success => {
                    core.window.record(Outcome::Success, now);
                    match (admission, core.state) {
                        (Admission::Probe, CircuitState::HalfOpen) => {
                            core.window.reset(now);
                            Some(core.transition(CircuitState::Closed, now))
                        }
                        (Admission::Pass, CircuitState::Closed) if core.should_trip(now, &self.profile) => {
                            Some(core.transition(CircuitState::Open, now))
                        }
                        _ => None,
                    }
                }
                Completion::Failure { timed_out } => {
                    if timed_out {
                        core.window.record(Outcome::Timeout, now);
                    }
                    core.window.record(Outcome::Failure, now);
                    match (admission, core.state) {
                        (Admission::Probe, CircuitState::HalfOpen) => {
                            Some(core.transition(CircuitState::Open, now))
                        }
                        (Admission::Pass, CircuitState::Closed) if core.should_trip(now, &self.profile) => {
                            Some(core.transition(CircuitState::Open, now))
                        }
                        _ => None,
                    }
                }
            }
        };

        let event = match completion {
            Completion::Success => "success",
            Completion::Failure { timed_out: true } => "timeout",
            Completion::Failure { timed_out: false } => "failure",
        };
        metrics::record_breaker_event(&self.label, event);

        if let Some((from, to)) = transition {
            self.publish(from, to);
        }
    }

    fn record_fallback(&self) {
        self.lock().window.record(Outcome::Fallback, Instant::now());
        metrics::record_breaker_event(&self.label, "fallback");
    }

    fn release_probe(&self) {
        let mut core = self.lock();
        if core.state == CircuitState::HalfOpen {
            core.probe_in_flight = false;
        }
    }

    fn publish(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => {
                tracing::warn!(breaker = %self.label, from = %from, "Circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.label, "Circuit breaker half-open");
            }
            CircuitState::Closed => {
                tracing::info!(breaker = %self.label, "Circuit breaker closed");
            }
        }
        metrics::record_breaker_event(&self.label, to.as_str());
        metrics::record_breaker_state(&self.label, to.gauge_value());

        // No subscribers is fine.
        let _ = self.events.send(BreakerTransition {
            breaker: self.label.clone(),
            from,
            to,
        });
    }
}

/// Releases the half-open probe slot if the call never completes.
struct ProbeGuard<'a> {
    breaker: &'a Breaker,
    armed: bool,
}

impl<'a> ProbeGuard<'a> {
    fn new(breaker: &'a Breaker, armed: bool) -> Self {
        Self { breaker, armed }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe();
        }
    }
}

/// Cheap, cloneable reference to a managed breaker.
#[derive(Debug, Clone)]
pub struct BreakerHandle {
    breaker: Arc<Breaker>,
}

impl BreakerHandle {
    pub fn key(&self) -> &BreakerKey {
        self.breaker.key()
    }

    pub fn label(&self) -> &str {
        self.breaker.label()
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn stats(&self) -> BreakerStats {
        self.breaker.snapshot().stats
    }
}

/// Owns every breaker in the process.
pub struct CircuitBreakerManager {
    profiles: std::collections::HashMap<String, ServiceProfile>,
    breakers: DashMap<BreakerKey, Arc<Breaker>>,
    fallbacks: Arc<FallbackRegistry>,
    classifier: ErrorClassifier,
    events: broadcast::Sender<BreakerTransition>,
}

impl fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("profiles", &self.profiles.len())
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerManager {
    pub fn new(config: &BreakerConfig, fallbacks: Arc<FallbackRegistry>) -> Self {
        let (events, _) = broadcast::channel(64);
        let profiles = config
            .profiles
            .iter()
            .map(|(name, profile)| {
                let mut profile = profile.clone();
                profile.name = name.clone();
                (name.clone(), profile)
            })
            .collect();

        Self {
            profiles,
            breakers: DashMap::new(),
            fallbacks,
            classifier: ErrorClassifier::new(config.critical_services.iter().cloned()),
            events,
        }
    }

    /// Subscribe to state transitions of every breaker.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    pub fn fallbacks(&self) -> &Arc<FallbackRegistry> {
        &self.fallbacks
    }

    /// Profile for `service`, falling back to the `default` profile.
    pub fn profile_for(&self, service: &str) -> GatewayResult<ServiceProfile> {
        self.profiles
            .get(service)
            .or_else(|| self.profiles.get(DEFAULT_PROFILE))
            .cloned()
            .ok_or_else(|| GatewayError::UnknownService(service.to_string()))
    }

    /// Return the breaker for `(service, operation)`, creating it on first use.
    ///
    /// The action is only used when the breaker is created; later callers
    /// share the first registration.
    pub fn get_or_create(
        &self,
        action: Arc<dyn Action>,
        service: &str,
        operation: &str,
    ) -> GatewayResult<BreakerHandle> {
        let key = BreakerKey::new(service, operation);
        if let Some(existing) = self.breakers.get(&key) {
            return Ok(BreakerHandle {
                breaker: existing.value().clone(),
            });
        }

        let profile = self.profile_for(service)?;
        let breaker = self
            .breakers
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::info!(
                    breaker = %key,
                    profile = %profile.name,
                    volume_threshold = profile.volume_threshold,
                    error_threshold = profile.error_threshold_percentage,
                    timeout_ms = profile.timeout_ms,
                    "Circuit breaker created"
                );
                metrics::record_breaker_state(&key.to_string(), CircuitState::Closed.gauge_value());
                Arc::new(Breaker::new(key.clone(), profile, action, self.events.clone()))
            })
            .value()
            .clone();

        Ok(BreakerHandle { breaker })
    }

    /// Look up an existing breaker without creating one.
    pub fn get(&self, service: &str, operation: &str) -> Option<BreakerHandle> {
        self.breakers
            .get(&BreakerKey::new(service, operation))
            .map(|b| BreakerHandle {
                breaker: b.value().clone(),
            })
    }

    /// Invoke the breaker's action under its state machine.
    pub async fn fire(&self, handle: &BreakerHandle, request: Payload) -> GatewayResult<Payload> {
        let breaker = handle.breaker.as_ref();
        let admission = breaker.admit(Instant::now());
        if admission == Admission::Reject {
            return self.fall_back(breaker);
        }

        let mut guard = ProbeGuard::new(breaker, admission == Admission::Probe);
        let result = with_deadline(breaker.profile.timeout(), breaker.action.call(request)).await;
        guard.disarm();

        match result {
            Ok(payload) => {
                breaker.complete(admission, Completion::Success, Instant::now());
                Ok(payload)
            }
            Err(err) => {
                let classification = self.classifier.classify(&err, &breaker.key.service);
                if classification.trip_circuit {
                    if err.is_timeout() {
                        tracing::warn!(breaker = %breaker.label, timeout_ms = breaker.profile.timeout_ms, "Downstream call timed out");
                    } else {
                        tracing::warn!(breaker = %breaker.label, error = %err, "Downstream call failed");
                    }
                    breaker.complete(
                        admission,
                        Completion::Failure {
                            timed_out: err.is_timeout(),
                        },
                        Instant::now(),
                    );
                } else {
                    tracing::debug!(breaker = %breaker.label, error = %err, "Downstream error not counted against circuit");
                    breaker.complete(admission, Completion::Success, Instant::now());
                }
                Err(err.into())
            }
        }
    }

    fn fall_back(&self, breaker: &Breaker) -> GatewayResult<Payload> {
        let producer = self
            .fallbacks
            .resolve(&breaker.key.service, &breaker.key.operation);
        breaker.record_fallback();
        let result = producer.produce(&breaker.key.service, &breaker.key.operation);
        if let Err(e) = &result {
            tracing::debug!(breaker = %breaker.label, error = %e, "Fallback declined to produce a response");
        }
        result
    }

    /// Snapshots of every breaker, ordered by key.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<Breaker>> = self.breakers.iter().map(|b| b.value().clone()).collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub fn health(&self) -> crate::health::exporter::HealthReport {
        crate::health::exporter::health_report(&self.snapshots())
    }

    pub fn metrics(&self) -> crate::health::exporter::MetricsReport {
        crate::health::exporter::metrics_report(&self.snapshots())
    }
}
