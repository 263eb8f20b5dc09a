//! # Circuit Breaker Metrics
//!
//! Point-in-time snapshots of breaker counters for logging and run summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::resilience::CircuitState;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that reached the guarded operation
    pub total_calls: u64,

    pub success_count: u64,

    pub failure_count: u64,

    /// Calls turned away without invoking the operation
    pub rejected_count: u64,

    /// Current consecutive failure count
    pub consecutive_failures: u64,

    /// Trial calls admitted while half-open
    pub half_open_calls: u64,

    /// Total duration of all operations
    pub total_duration: Duration,

    pub current_state: CircuitState,

    /// When the breaker last changed state
    pub last_transition_at: DateTime<Utc>,
}

impl CircuitBreakerMetrics {
    /// Create new metrics instance with zero values
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            consecutive_failures: 0,
            half_open_calls: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            last_transition_at: Utc::now(),
        }
    }

    /// Fraction of executed calls that failed (0.0 to 1.0)
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.failure_count as f64 / self.total_calls as f64
    }

    /// Average duration of executed calls
    pub fn average_duration(&self) -> Duration {
        match u32::try_from(self.total_calls) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(calls) => self.total_duration / calls,
        }
    }

    /// Format metrics for logging
    pub fn format_summary(&self) -> String {
        format!(
            "State: {:?} | Calls: {} | Failures: {} | Rejected: {} | Avg Duration: {}ms",
            self.current_state,
            self.total_calls,
            self.failure_count,
            self.rejected_count,
            self.average_duration().as_millis()
        )
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for every guarded operation family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    /// Metrics for individual circuit breakers by name
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,

    pub collected_at: DateTime<Utc>,
}

impl SystemCircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            circuit_breakers: HashMap::new(),
            collected_at: Utc::now(),
        }
    }

    /// Add metrics for a circuit breaker
    pub fn add_circuit_breaker(&mut self, name: String, metrics: CircuitBreakerMetrics) {
        self.circuit_breakers.insert(name, metrics);
        self.collected_at = Utc::now();
    }

    /// Names of breakers currently rejecting calls
    pub fn open_circuits(&self) -> Vec<&str> {
        let mut open: Vec<&str> = self
            .circuit_breakers
            .iter()
            .filter(|(_, metrics)| metrics.current_state == CircuitState::Open)
            .map(|(name, _)| name.as_str())
            .collect();
        open.sort_unstable();
        open
    }

    pub fn total_rejections(&self) -> u64 {
        self.circuit_breakers
            .values()
            .map(|metrics| metrics.rejected_count)
            .sum()
    }
}

impl Default for SystemCircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
