//! # Circuit Breaker Manager
//!
//! Holds one breaker per guarded operation family and aggregates their metrics.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::config::CircuitBreakerSettings;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, SystemCircuitBreakerMetrics};

/// External operation families guarded by a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardedOperation {
    Extraction,
    Conversion,
}

impl GuardedOperation {
    pub const ALL: [GuardedOperation; 2] = [GuardedOperation::Extraction, GuardedOperation::Conversion];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Conversion => "conversion",
        }
    }
}

impl fmt::Display for GuardedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manager for the breakers of every guarded operation family
#[derive(Debug)]
pub struct CircuitBreakerManager {
    circuit_breakers: RwLock<HashMap<GuardedOperation, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    /// Create one closed breaker per family from the loaded settings
    pub fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        let breakers = GuardedOperation::ALL
            .into_iter()
            .map(|operation| {
                let config = match operation {
                    GuardedOperation::Extraction => settings.extraction.to_resilience_config(),
                    GuardedOperation::Conversion => settings.conversion.to_resilience_config(),
                };
                (
                    operation,
                    Arc::new(CircuitBreaker::new(operation.to_string(), config)),
                )
            })
            .collect();

        info!("Initialized circuit breaker manager");

        Self {
            circuit_breakers: RwLock::new(breakers),
        }
    }

    /// Breaker guarding an operation family
    pub fn breaker(&self, operation: GuardedOperation) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.read().get(&operation) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.circuit_breakers.write();
        Arc::clone(breakers.entry(operation).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                operation.to_string(),
                CircuitBreakerConfig::default(),
            ))
        }))
    }

    /// Replace a family's breaker, resetting it to closed with new thresholds
    ///
    /// Calls already holding the previous breaker finish against it.
    pub fn reconfigure(&self, operation: GuardedOperation, config: CircuitBreakerConfig) {
        info!(
            component = %operation,
            failure_threshold = config.failure_threshold,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "🔄 Circuit breaker reconfigured"
        );
        self.circuit_breakers.write().insert(
            operation,
            Arc::new(CircuitBreaker::new(operation.to_string(), config)),
        );
    }

    /// Get system-wide circuit breaker metrics
    pub fn system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut system_metrics = SystemCircuitBreakerMetrics::new();
        for (operation, breaker) in self.circuit_breakers.read().iter() {
            system_metrics.add_circuit_breaker(operation.to_string(), breaker.metrics());
        }
        system_metrics
    }
}
