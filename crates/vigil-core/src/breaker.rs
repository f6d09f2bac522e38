//! Circuit breaker layer
//!
//! Every call to an unreliable downstream dependency (an agent, a queue
//! backend, an external API) is wrapped by a per-dependency breaker:
//! - Closed: normal operation, calls pass through
//! - Open: consecutive failures exceeded the threshold, calls are rejected
//!   without touching the dependency
//! - HalfOpen: after the reset timeout, trial calls probe for recovery
//!
//! Transitions only follow Closed → Open → HalfOpen → {Closed | Open}.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Failures exceeded threshold - calls are rejected
    Open,
    /// Testing recovery - trial calls pass through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Errors produced by the breaker layer.
///
/// `Open` is a distinct kind so callers can tell "dependency down" apart
/// from "request failed".
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The breaker is open; the call was rejected without being attempted
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Dependency name
        name: String,
    },

    /// The wrapped call exceeded its timeout
    #[error("call through breaker '{name}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Dependency name
        name: String,
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// The wrapped call returned an error
    #[error("call through breaker '{name}' failed: {message}")]
    CallFailed {
        /// Dependency name
        name: String,
        /// Underlying error message
        message: String,
    },
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive successes in half-open state to close the circuit
    pub success_threshold: u32,
    /// Duration to wait after the last failure before probing (open → half-open)
    pub reset_timeout: Duration,
    /// Timeout applied to each wrapped call
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl BreakerConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set success threshold for half-open state
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set reset timeout
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set per-call timeout
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Lifetime counters for one breaker instance.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Total calls attempted (including rejected)
    pub total_calls: u64,
    /// Successful calls
    pub success_count: u64,
    /// Failed calls (errors and timeouts, not open-rejections)
    pub failure_count: u64,
    /// Current consecutive failure streak
    pub consecutive_failures: u32,
    /// Last recorded failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Last recorded success
    pub last_success_at: Option<DateTime<Utc>>,
    /// Number of state transitions since creation
    pub state_transitions: u64,
}

impl BreakerStats {
    /// Failure rate over all completed calls, in [0, 1].
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let completed = self.success_count + self.failure_count;
        if completed == 0 {
            0.0
        } else {
            self.failure_count as f64 / completed as f64
        }
    }
}

/// Circuit breaker for one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: RwLock<CircuitState>,
    total_calls: AtomicU64,
    success_total: AtomicU64,
    failure_total: AtomicU64,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    last_failure_ms: AtomicU64,
    last_success_ms: AtomicU64,
    transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            total_calls: AtomicU64::new(0),
            success_total: AtomicU64::new(0),
            failure_total: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            last_success_ms: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    /// Get the breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap()
    }

    /// Check if the circuit allows a call, performing the open → half-open
    /// probe transition once the reset timeout has elapsed.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        self.maybe_probe();

        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        self.success_total.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.last_success_ms.store(now_ms(), Ordering::SeqCst);

        if self.state() == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(
                name = %self.name,
                successes = successes,
                threshold = self.config.success_threshold,
                "Breaker success in half-open state"
            );
            if successes >= self.config.success_threshold {
                self.transition(CircuitState::Closed);
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        self.failure_total.fetch_add(1, Ordering::SeqCst);
        self.last_failure_ms.store(now_ms(), Ordering::SeqCst);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        match self.state() {
            CircuitState::Closed => {
                debug!(
                    name = %self.name,
                    failures = failures,
                    threshold = self.config.failure_threshold,
                    "Breaker failure recorded"
                );
                if failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while probing reopens the circuit
                warn!(name = %self.name, "Breaker failure in half-open state, reopening");
                self.transition(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Reset the breaker to closed and clear the failure streak.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.half_open_successes.store(0, Ordering::SeqCst);
        if self.state() != CircuitState::Closed {
            self.transition(CircuitState::Closed);
        }
    }

    /// Snapshot the lifetime stats.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state(),
            total_calls: self.total_calls.load(Ordering::SeqCst),
            success_count: self.success_total.load(Ordering::SeqCst),
            failure_count: self.failure_total.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_failure_at: ms_to_datetime(self.last_failure_ms.load(Ordering::SeqCst)),
            last_success_at: ms_to_datetime(self.last_success_ms.load(Ordering::SeqCst)),
            state_transitions: self.transitions.load(Ordering::SeqCst),
        }
    }

    /// Execute an operation through the breaker.
    ///
    /// Rejects immediately with [`BreakerError::Open`] when the circuit is
    /// open. The call runs under the configured timeout; a timeout counts as
    /// a failure for breaker accounting.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.total_calls.fetch_add(1, Ordering::SeqCst);

        if !self.can_execute() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }

        match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(BreakerError::CallFailed {
                    name: self.name.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                self.record_failure();
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    timeout_ms: self.config.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Transition open → half-open once the reset timeout has elapsed since
    /// the last failure.
    fn maybe_probe(&self) {
        if self.state() != CircuitState::Open {
            return;
        }
        let last_failure = self.last_failure_ms.load(Ordering::SeqCst);
        let elapsed = Duration::from_millis(now_ms().saturating_sub(last_failure));
        if elapsed >= self.config.reset_timeout {
            self.half_open_successes.store(0, Ordering::SeqCst);
            self.transition(CircuitState::HalfOpen);
        }
    }

    fn transition(&self, to: CircuitState) {
        let mut state = self.state.write().unwrap();
        if *state != to {
            info!(name = %self.name, from = %*state, to = %to, "Breaker state change");
            *state = to;
            self.transitions.fetch_add(1, Ordering::SeqCst);
            if to == CircuitState::Closed {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.half_open_successes.store(0, Ordering::SeqCst);
            }
        }
    }
}

/// Health classification for one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyHealth {
    /// Closed with a failure rate at or below 30%
    Healthy,
    /// Still closed but failure rate above 30%
    Degraded,
    /// Open or half-open
    Unhealthy,
}

/// Aggregate health dashboard across all registered breakers.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Number of healthy dependencies
    pub healthy: usize,
    /// Number of degraded dependencies
    pub degraded: usize,
    /// Number of unhealthy dependencies
    pub unhealthy: usize,
    /// Per-dependency classification
    pub dependencies: Vec<(String, DependencyHealth)>,
}

/// Failure rate above which a closed breaker counts as degraded.
const DEGRADED_FAILURE_RATE: f64 = 0.3;

/// Registry of circuit breakers keyed by dependency name.
///
/// Lazily creates one breaker per named dependency. Safe for concurrent
/// access; this is the only cross-incident shared mutable state in the core.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
}

impl BreakerRegistry {
    /// Create a registry whose lazily-created breakers use `config`.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: config,
        }
    }

    /// Get or lazily create the breaker for a dependency.
    #[must_use]
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }

    /// Number of registered breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Build the aggregate health dashboard.
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        let mut report = HealthReport {
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            dependencies: Vec::new(),
        };

        for entry in self.breakers.iter() {
            let stats = entry.value().stats();
            let health = match stats.state {
                CircuitState::Open | CircuitState::HalfOpen => DependencyHealth::Unhealthy,
                CircuitState::Closed if stats.failure_rate() > DEGRADED_FAILURE_RATE => {
                    DependencyHealth::Degraded
                }
                CircuitState::Closed => DependencyHealth::Healthy,
            };
            match health {
                DependencyHealth::Healthy => report.healthy += 1,
                DependencyHealth::Degraded => report.degraded += 1,
                DependencyHealth::Unhealthy => report.unhealthy += 1,
            }
            report.dependencies.push((entry.key().clone(), health));
        }

        report.dependencies.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn ms_to_datetime(ms: u64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        None
    } else {
        DateTime::from_timestamp_millis(ms as i64)
    }
}
