//! # Resilience Module
//!
//! Fault isolation for the unreliable external operations the pipeline
//! depends on (archive extraction, document conversion).
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: one per guarded operation family, shared by every worker
//! - **Metrics Collection**: call, failure and rejection counters per breaker
//! - **Configuration**: thresholds loaded from the `circuit_breakers` config section
//!
//! Breaker state is never persisted; every process starts closed.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use unitflow::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 3,
//!     cooldown: Duration::from_secs(30),
//! };
//!
//! let circuit_breaker = CircuitBreaker::new("conversion".to_string(), config);
//!
//! let result = circuit_breaker.call(|| async {
//!     Ok::<&str, std::io::Error>("converted")
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerConfig;
pub use manager::{CircuitBreakerManager, GuardedOperation};
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
