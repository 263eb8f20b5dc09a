//! # Error Policy Engine
//!
//! Turns a stage failure into retry, quarantine or skip. Data-driven: each
//! [`ErrorKind`] has its own attempt budget and backoff in
//! [`ErrorPolicyConfig`].

use std::time::Duration;
use tracing::debug;

use crate::config::{ErrorPolicyConfig, KindPolicyConfig};
use crate::error::ErrorKind;
use crate::state_machine::{QuarantineKind, Stage};

/// What the orchestrator does after a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Run the same stage again after the delay
    Retry(Duration),
    /// Give up and place the unit in this bucket
    Quarantine(QuarantineKind),
    /// Treat the stage as done without its effect
    Skip,
}

#[derive(Debug, Clone)]
pub struct ErrorPolicyEngine {
    config: ErrorPolicyConfig,
}

impl ErrorPolicyEngine {
    pub fn new(config: ErrorPolicyConfig) -> Self {
        Self { config }
    }

    pub fn policy_for(&self, kind: ErrorKind) -> &KindPolicyConfig {
        self.config.for_kind(kind)
    }

    /// Decide the response to the `attempt`-th failure (1-based) of `stage`
    ///
    /// Permanent failures and non-retryable kinds quarantine at once. Skip
    /// is only ever chosen for stages that do not affect routing.
    pub fn decide(
        &self,
        kind: ErrorKind,
        attempt: u32,
        stage: Stage,
        permanent: bool,
    ) -> PolicyDecision {
        let policy = self.policy_for(kind);

        let decision = if permanent || !policy.retryable {
            PolicyDecision::Quarantine(QuarantineKind::from(kind))
        } else if policy.skippable && !stage.affects_routing() {
            PolicyDecision::Skip
        } else if attempt < policy.max_attempts {
            PolicyDecision::Retry(Self::backoff_delay(policy, attempt))
        } else {
            PolicyDecision::Quarantine(QuarantineKind::from(kind))
        };

        debug!(
            error_kind = %kind,
            attempt = attempt,
            stage = %stage,
            permanent = permanent,
            decision = ?decision,
            "Error policy decision"
        );
        decision
    }

    /// `base * multiplier^(attempt-1)`, capped at the kind's maximum delay
    pub fn backoff_delay(policy: &KindPolicyConfig, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(policy.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for ErrorPolicyEngine {
    fn default() -> Self {
        Self::new(ErrorPolicyConfig::default())
    }
}
