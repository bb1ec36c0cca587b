//! Per-service circuit breaker.
//!
//! Each service name gets its own closed/open/half-open state machine, created
//! lazily the first time the name is seen. Transitions out of `Open` happen
//! lazily too: the first [`CircuitBreakerRegistry::is_open`] call after the reset
//! timeout moves the circuit to `HalfOpen` and starts handing out trial calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use mender_types::{MenderError, Result};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing trials.
    #[serde(with = "mender_types::duration_serde")]
    pub reset_timeout: Duration,
    /// Trial calls granted while half-open.
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(30_000),
            half_open_requests: 1,
        }
    }
}

/// Per-service override; unset fields fall back to the registry defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub half_open_requests: Option<u32>,
}

impl BreakerOverrides {
    fn apply(&self, base: &BreakerConfig) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            reset_timeout: self
                .reset_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.reset_timeout),
            half_open_requests: self
                .half_open_requests
                .unwrap_or(base.half_open_requests)
                .max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct ServiceCircuit {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    next_retry: Option<Instant>,
    half_open_allowed: u32,
}

impl ServiceCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure: None,
            next_retry: None,
            half_open_allowed: 0,
        }
    }

    fn trip(&mut self, now: Instant, reset_timeout: Duration) {
        self.state = CircuitState::Open;
        self.successes = 0;
        self.half_open_allowed = 0;
        self.next_retry = Some(now + reset_timeout);
    }
}

/// Point-in-time view of one service's circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub service: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub retry_in_ms: Option<u64>,
    pub last_failure_ago_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    overrides: HashMap<String, BreakerOverrides>,
    circuits: HashMap<String, ServiceCircuit>,
}

/// Circuit breakers for every external service a process talks to.
///
/// Constructed once and shared by reference (usually inside an `Arc`).
pub struct CircuitBreakerRegistry {
    defaults: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreakerRegistry {
    /// A half-open circuit always grants at least one trial, whatever
    /// `half_open_requests` says, or it could never close again.
    pub fn new(mut defaults: BreakerConfig) -> Self {
        defaults.half_open_requests = defaults.half_open_requests.max(1);
        Self {
            defaults,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn config_for(&self, inner: &Inner, service: &str) -> BreakerConfig {
        inner
            .overrides
            .get(service)
            .map(|o| o.apply(&self.defaults))
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Override the breaker settings for one service.
    pub fn configure(&self, service: &str, overrides: BreakerOverrides) {
        self.lock().overrides.insert(service.to_string(), overrides);
    }

    /// Whether a call to `service` should be rejected right now.
    ///
    /// Moves an expired open circuit to half-open and consumes one trial
    /// allowance for every call it lets through while half-open.
    pub fn is_open(&self, service: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let config = self.config_for(&inner, service);
        let circuit = inner
            .circuits
            .entry(service.to_string())
            .or_insert_with(ServiceCircuit::new);

        if circuit.state == CircuitState::Open {
            let expired = circuit.next_retry.map_or(true, |at| now >= at);
            if !expired {
                return true;
            }
            tracing::info!(service, "Circuit half-open, allowing trial requests");
            circuit.state = CircuitState::HalfOpen;
            circuit.half_open_allowed = config.half_open_requests;
        }

        match circuit.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if circuit.half_open_allowed > 0 => {
                circuit.half_open_allowed -= 1;
                false
            }
            _ => true,
        }
    }

    pub fn record_success(&self, service: &str) {
        let mut inner = self.lock();
        let circuit = inner
            .circuits
            .entry(service.to_string())
            .or_insert_with(ServiceCircuit::new);
        match circuit.state {
            CircuitState::HalfOpen => {
                tracing::info!(service, "Circuit closed after successful trial");
                *circuit = ServiceCircuit::new();
            }
            CircuitState::Closed => {
                circuit.failures = 0;
                circuit.successes += 1;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, service: &str) {
        let now = Instant::now();
        let mut inner = self.lock();
        let config = self.config_for(&inner, service);
        let circuit = inner
            .circuits
            .entry(service.to_string())
            .or_insert_with(ServiceCircuit::new);
        circuit.failures += 1;
        circuit.last_failure = Some(now);

        match circuit.state {
            CircuitState::HalfOpen => {
                tracing::warn!(service, "Trial request failed, circuit re-opened");
                circuit.trip(now, config.reset_timeout);
            }
            CircuitState::Closed if circuit.failures >= config.failure_threshold => {
                tracing::warn!(
                    service,
                    failures = circuit.failures,
                    reset_ms = %config.reset_timeout.as_millis(),
                    "Circuit opened"
                );
                circuit.trip(now, config.reset_timeout);
            }
            _ => {}
        }
    }

    /// Run `f` unless the circuit for `service` is open, recording the outcome.
    pub async fn with_circuit_breaker<T, F, Fut>(&self, service: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_open(service) {
            let retry_in_ms = self
                .status(service)
                .and_then(|s| s.retry_in_ms)
                .unwrap_or(0);
            return Err(MenderError::CircuitOpen {
                service: service.to_string(),
                retry_in_ms,
            });
        }

        match f().await {
            Ok(value) => {
                self.record_success(service);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(service);
                Err(e)
            }
        }
    }

    /// Status of one service, `None` if it has never been referenced.
    pub fn status(&self, service: &str) -> Option<CircuitStatus> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .circuits
            .get(service)
            .map(|c| snapshot(service, c, now))
    }

    /// Status of every referenced service, sorted by name.
    pub fn all_status(&self) -> Vec<CircuitStatus> {
        let now = Instant::now();
        let inner = self.lock();
        let mut all: Vec<CircuitStatus> = inner
            .circuits
            .iter()
            .map(|(name, c)| snapshot(name, c, now))
            .collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    /// Force one service back to a fresh closed circuit.
    pub fn reset(&self, service: &str) {
        self.lock().circuits.remove(service);
    }

    pub fn reset_all(&self) {
        self.lock().circuits.clear();
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

fn snapshot(service: &str, c: &ServiceCircuit, now: Instant) -> CircuitStatus {
    CircuitStatus {
        service: service.to_string(),
        state: c.state,
        failures: c.failures,
        successes: c.successes,
        retry_in_ms: match c.state {
            CircuitState::Open => c
                .next_retry
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            _ => None,
        },
        last_failure_ago_ms: c
            .last_failure
            .map(|at| now.saturating_duration_since(at).as_millis() as u64),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
