//! # Pipeline Configuration
//!
//! Explicitly constructed, validated and immutable configuration. Nothing in the
//! pipeline reads ambient globals: the orchestrator receives a
//! [`PipelineConfig`] at startup and hands slices of it to each component.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use unitflow::config::ConfigLoader;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load(Some(Path::new("config/unitflow.toml")))?;
//! println!("workers: {}", config.execution.worker_count);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

use crate::error::ErrorKind;
use crate::resilience::CircuitBreakerConfig;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker pool, cycle budget and external-resource pool
    pub execution: ExecutionConfig,

    /// Limits handed to the archive extractor
    pub extraction: ExtractionConfig,

    /// One breaker per guarded operation family
    pub circuit_breakers: CircuitBreakerSettings,

    /// Retry/quarantine/skip policy per error kind
    pub error_policy: ErrorPolicyConfig,

    /// Type labels the decision engine treats specially
    pub types: TypeCatalogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub worker_count: usize,
    pub max_cycles: u32,
    /// Converter execution slots
    pub resource_slots: usize,
    pub resource_acquire_timeout_ms: u64,
    pub metadata_sync_timeout_ms: u64,
}

impl ExecutionConfig {
    pub fn resource_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_acquire_timeout_ms)
    }

    pub fn metadata_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_sync_timeout_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_cycles: 3,
            resource_slots: 2,
            resource_acquire_timeout_ms: 30_000,
            metadata_sync_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub max_depth: u32,
    pub max_expanded_size_bytes: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_expanded_size_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Breaker thresholds for a single operation family
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerComponentConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl BreakerComponentConfig {
    /// Convert to resilience module's format
    pub fn to_resilience_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

impl Default for BreakerComponentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub extraction: BreakerComponentConfig,
    pub conversion: BreakerComponentConfig,
}

/// Policy for one error kind
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct KindPolicyConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub retryable: bool,
    /// Transient and inconsequential on stages that do not affect routing
    pub skippable: bool,
}

impl KindPolicyConfig {
    pub fn retrying(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            ..Self::default()
        }
    }

    pub fn non_retryable() -> Self {
        Self {
            max_attempts: 1,
            retryable: false,
            ..Self::default()
        }
    }
}

impl Default for KindPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            retryable: true,
            skippable: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ErrorPolicyConfig {
    pub extraction_failed: KindPolicyConfig,
    pub conversion_failed: KindPolicyConfig,
    pub ambiguous_classification: KindPolicyConfig,
    pub empty_content: KindPolicyConfig,
    pub other: KindPolicyConfig,
}

impl ErrorPolicyConfig {
    pub fn for_kind(&self, kind: ErrorKind) -> &KindPolicyConfig {
        match kind {
            ErrorKind::ExtractionFailed => &self.extraction_failed,
            ErrorKind::ConversionFailed => &self.conversion_failed,
            ErrorKind::AmbiguousClassification => &self.ambiguous_classification,
            ErrorKind::EmptyContent => &self.empty_content,
            ErrorKind::Other => &self.other,
        }
    }

    pub fn for_kind_mut(&mut self, kind: ErrorKind) -> &mut KindPolicyConfig {
        match kind {
            ErrorKind::ExtractionFailed => &mut self.extraction_failed,
            ErrorKind::ConversionFailed => &mut self.conversion_failed,
            ErrorKind::AmbiguousClassification => &mut self.ambiguous_classification,
            ErrorKind::EmptyContent => &mut self.empty_content,
            ErrorKind::Other => &mut self.other,
        }
    }
}

impl Default for ErrorPolicyConfig {
    fn default() -> Self {
        Self {
            extraction_failed: KindPolicyConfig::retrying(2, 1_000),
            conversion_failed: KindPolicyConfig::retrying(3, 2_000),
            ambiguous_classification: KindPolicyConfig::non_retryable(),
            empty_content: KindPolicyConfig::non_retryable(),
            other: KindPolicyConfig {
                skippable: true,
                ..KindPolicyConfig::retrying(2, 500)
            },
        }
    }
}

/// Type labels with pipeline meaning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TypeCatalogConfig {
    /// Label the detector returns for files it cannot type
    pub unknown_label: String,
    /// Container formats handled by extraction
    pub archive_types: Vec<String>,
    /// Legacy formats and the format they convert to
    pub conversion_targets: BTreeMap<String, String>,
    /// Extension spellings folded onto a canonical label during normalization
    pub extension_aliases: BTreeMap<String, String>,
}

impl Default for TypeCatalogConfig {
    fn default() -> Self {
        let conversion_targets = [("doc", "docx"), ("xls", "xlsx"), ("ppt", "pptx"), ("rtf", "docx")]
            .into_iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        let extension_aliases = [("jpeg", "jpg"), ("tif", "tiff")]
            .into_iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();

        Self {
            unknown_label: "unknown".to_string(),
            archive_types: ["zip", "rar", "7z", "tar", "gz"]
                .into_iter()
                .map(String::from)
                .collect(),
            conversion_targets,
            extension_aliases,
        }
    }
}

impl PipelineConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        let execution = &self.execution;
        if execution.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.worker_count",
                execution.worker_count,
                "at least one worker is required",
            ));
        }
        if execution.max_cycles == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_cycles",
                execution.max_cycles,
                "at least one cycle is required",
            ));
        }
        if execution.resource_slots == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.resource_slots",
                execution.resource_slots,
                "conversion needs at least one slot",
            ));
        }
        if execution.resource_acquire_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.resource_acquire_timeout_ms",
                execution.resource_acquire_timeout_ms,
                "must be greater than 0",
            ));
        }

        for (family, breaker) in [
            ("extraction", &self.circuit_breakers.extraction),
            ("conversion", &self.circuit_breakers.conversion),
        ] {
            if breaker.failure_threshold == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("circuit_breakers.{family}.failure_threshold"),
                    breaker.failure_threshold,
                    "must be greater than 0",
                ));
            }
            if breaker.cooldown_ms == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("circuit_breakers.{family}.cooldown_ms"),
                    breaker.cooldown_ms,
                    "must be greater than 0",
                ));
            }
        }

        for kind in ErrorKind::ALL {
            let policy = self.error_policy.for_kind(kind);
            if policy.max_attempts == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("error_policy.{kind}.max_attempts"),
                    policy.max_attempts,
                    "must be at least 1",
                ));
            }
            if policy.backoff_multiplier < 1.0 {
                return Err(ConfigurationError::invalid_value(
                    format!("error_policy.{kind}.backoff_multiplier"),
                    policy.backoff_multiplier,
                    "delays must not shrink between attempts",
                ));
            }
        }

        if self.types.unknown_label.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "types.unknown_label",
                &self.types.unknown_label,
                "must not be empty",
            ));
        }
        if let Some(label) = self
            .types
            .archive_types
            .iter()
            .find(|label| self.types.conversion_targets.contains_key(*label))
        {
            return Err(ConfigurationError::invalid_value(
                "types.archive_types",
                label,
                "a label cannot be both an archive and convertible",
            ));
        }

        Ok(())
    }
}
