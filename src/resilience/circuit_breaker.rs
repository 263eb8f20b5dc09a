//! # Circuit Breaker Implementation
//!
//! Isolates the pipeline from a wedged external operation. Three states:
//! Closed (normal operation), Open (failing fast), and Half-Open (exactly one
//! trial call in flight).
//!
//! State lives behind a `parking_lot::Mutex` that is never held across an
//! await point: admission and bookkeeping are synchronous, only the guarded
//! future itself is awaited.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a single trial call is allowed
    HalfOpen,
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (or a half-open trial is already running)
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen {
        component: String,
        /// Time until the breaker will next admit a call
        retry_after: Duration,
    },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    metrics: CircuitBreakerMetrics,
}

/// Whether an admitted call is the half-open trial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Core circuit breaker implementation
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    config: CircuitBreakerConfig,

    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                trial_in_flight: false,
                metrics: CircuitBreakerMetrics::new(),
            }),
        }
    }

    /// Get current circuit state
    ///
    /// An open breaker whose cooldown has elapsed still reports `Open` until
    /// the next call is admitted as the trial.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get component name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Rejected calls never invoke `operation`.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().map_err(|retry_after| CircuitBreakerError::CircuitOpen {
            component: self.name.clone(),
            retry_after,
        })?;

        let mut guard = CallGuard {
            breaker: self,
            admission,
            settled: false,
        };

        let start_time = Instant::now();
        let result = operation().await;
        let duration = start_time.elapsed();

        guard.settled = true;
        match &result {
            Ok(_) => self.record_success(admission, duration),
            Err(_) => self.record_failure(admission, duration),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Decide whether a call may proceed; `Err` carries the remaining wait
    fn admit(&self) -> Result<Admission, Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let remaining = inner
                    .opened_at
                    .map(|opened| self.config.cooldown.saturating_sub(opened.elapsed()))
                    .unwrap_or(Duration::ZERO);
                if remaining.is_zero() {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    inner.metrics.half_open_calls += 1;
                    Ok(Admission::Trial)
                } else {
                    inner.metrics.rejected_count += 1;
                    debug!(
                        component = %self.name,
                        retry_after_ms = remaining.as_millis() as u64,
                        "⛔ Call rejected, circuit open"
                    );
                    Err(remaining)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.metrics.rejected_count += 1;
                    Err(self.config.cooldown)
                } else {
                    inner.trial_in_flight = true;
                    inner.metrics.half_open_calls += 1;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Record a successful operation
    fn record_success(&self, admission: Admission, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;
        inner.metrics.total_duration += duration;

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );

        match (admission, inner.state) {
            (Admission::Trial, _) => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Closed);
            }
            (Admission::Normal, CircuitState::Closed) => {
                inner.metrics.consecutive_failures = 0;
            }
            // A call admitted before the breaker opened finished late
            (Admission::Normal, _) => {}
        }
    }

    /// Record a failed operation
    fn record_failure(&self, admission: Admission, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;
        inner.metrics.total_duration += duration;

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🔴 Operation failed"
        );

        match (admission, inner.state) {
            (Admission::Trial, _) => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Open);
            }
            (Admission::Normal, CircuitState::Closed) => {
                inner.metrics.consecutive_failures += 1;
                if inner.metrics.consecutive_failures >= u64::from(self.config.failure_threshold) {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (Admission::Normal, _) => {}
        }
    }

    /// Release an abandoned trial so the next caller can run one
    fn abandon(&self, admission: Admission) {
        if admission == Admission::Trial {
            let mut inner = self.inner.lock();
            inner.trial_in_flight = false;
            debug!(component = %self.name, "Half-open trial abandoned before completing");
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.metrics.current_state = to;
        inner.metrics.last_transition_at = Utc::now();

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                error!(
                    component = %self.name,
                    from = ?from,
                    consecutive_failures = inner.metrics.consecutive_failures,
                    failure_threshold = self.config.failure_threshold,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "🔴 Circuit breaker opened (failing fast)"
                );
            }
            CircuitState::HalfOpen => {
                info!(component = %self.name, "🟡 Circuit breaker half-open (testing recovery)");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.metrics.consecutive_failures = 0;
                info!(
                    component = %self.name,
                    total_calls = inner.metrics.total_calls,
                    "🟢 Circuit breaker closed (recovered)"
                );
            }
        }
    }

    /// Time until an open breaker admits its trial call, if it is open
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => inner
                .opened_at
                .map(|opened| self.config.cooldown.saturating_sub(opened.elapsed())),
            _ => None,
        }
    }

    /// Force circuit to open state
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Force circuit to closed state
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.inner.lock().metrics.clone()
    }
}

/// Settles the half-open trial if the guarded future is dropped mid-flight
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(self.admission);
        }
    }
}
