//! Error types for the unit pipeline.
//!
//! Subsystems keep their own `thiserror` enums; everything converges into
//! [`PipelineError`] at the orchestrator boundary, where recoverable variants are
//! mapped onto the closed [`ErrorKind`] set consumed by the error policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigurationError;
use crate::manifest::ManifestError;
use crate::routing::RoutingError;
use crate::state_machine::StateMachineError;

/// Closed set of stage failure kinds recorded in a unit's error records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ExtractionFailed,
    ConversionFailed,
    AmbiguousClassification,
    EmptyContent,
    Other,
}

impl ErrorKind {
    /// Every kind, in declaration order
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::ExtractionFailed,
        ErrorKind::ConversionFailed,
        ErrorKind::AmbiguousClassification,
        ErrorKind::EmptyContent,
        ErrorKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractionFailed => "extraction_failed",
            Self::ConversionFailed => "conversion_failed",
            Self::AmbiguousClassification => "ambiguous_classification",
            Self::EmptyContent => "empty_content",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Invalid error kind: {s}"))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] StateMachineError),

    #[error("Routing gap: {0}")]
    RoutingGap(#[from] RoutingError),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    #[error("Ambiguous classification: {0}")]
    AmbiguousClassification(String),

    #[error("Empty content: {0}")]
    EmptyContent(String),

    #[error("Timed out after {waited:?} waiting for resource '{resource}'")]
    ResourceAcquisitionTimeout { resource: String, waited: Duration },

    #[error("Manifest inconsistency for unit {unit_id}: {detail}")]
    ManifestInconsistency { unit_id: String, detail: String },

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Batch cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Recoverable failures map onto an [`ErrorKind`]; fatal ones return `None`
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::ExtractionFailed(_) => Some(ErrorKind::ExtractionFailed),
            Self::ConversionFailed(_) | Self::ResourceAcquisitionTimeout { .. } => {
                Some(ErrorKind::ConversionFailed)
            }
            Self::AmbiguousClassification(_) => Some(ErrorKind::AmbiguousClassification),
            Self::EmptyContent(_) => Some(ErrorKind::EmptyContent),
            Self::Io(_) => Some(ErrorKind::Other),
            Self::InvalidTransition(_)
            | Self::RoutingGap(_)
            | Self::ManifestInconsistency { .. }
            | Self::Manifest(_)
            | Self::Configuration(_)
            | Self::Cancelled => None,
        }
    }

    /// Failures that must abort the batch before any unit is dispatched
    pub fn is_configuration_level(&self) -> bool {
        matches!(self, Self::RoutingGap(_) | Self::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
