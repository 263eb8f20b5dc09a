//! # Routing Registry
//!
//! The single authority mapping `(state, outcome)` to `(next state, destination)`.
//! Every outcome label the pipeline can produce is declared here; a registry
//! that leaves a declared pair unrouted, or routes one twice, fails to build.

pub mod registry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::constants::areas;
use crate::error::ErrorKind;
use crate::state_machine::{QuarantineKind, Stage, UnitState};

pub use registry::{Route, RoutingRegistry, RoutingRegistryBuilder};

/// Outcome labels produced by classification, stage completion or failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOutcome {
    /// Unit adopted and ready for its first classification
    Admitted,
    /// Archive containers still wait for extraction
    ArchivesPresent,
    /// Legacy formats still wait for conversion
    ConversionRequired,
    /// One type holds a strict majority
    Dominant,
    /// Several known types without a majority
    Mixed,
    /// No meaningful files
    Empty,
    /// Meaningful files but no usable type
    Ambiguous,
    /// The last stage finished and produced final output
    StageCompleted,
    /// The inventory must be classified again
    RequiresReclassification,
    /// The error policy gave up on the unit
    Failed(ErrorKind),
}

impl RouteOutcome {
    /// Every label, error kinds expanded
    pub fn all() -> Vec<RouteOutcome> {
        let mut outcomes = vec![
            Self::Admitted,
            Self::ArchivesPresent,
            Self::ConversionRequired,
            Self::Dominant,
            Self::Mixed,
            Self::Empty,
            Self::Ambiguous,
            Self::StageCompleted,
            Self::RequiresReclassification,
        ];
        outcomes.extend(ErrorKind::ALL.into_iter().map(Self::Failed));
        outcomes
    }
}

impl fmt::Display for RouteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admitted => f.write_str("admitted"),
            Self::ArchivesPresent => f.write_str("archives_present"),
            Self::ConversionRequired => f.write_str("conversion_required"),
            Self::Dominant => f.write_str("dominant"),
            Self::Mixed => f.write_str("mixed"),
            Self::Empty => f.write_str("empty"),
            Self::Ambiguous => f.write_str("ambiguous"),
            Self::StageCompleted => f.write_str("stage_completed"),
            Self::RequiresReclassification => f.write_str("requires_reclassification"),
            Self::Failed(kind) => write!(f, "failed:{kind}"),
        }
    }
}

/// Storage location a route sends a unit to, relative to the destination root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// Stays in the processing area while the given stage runs
    Processing(Stage),
    /// Ready area, subdivided by dominant type
    Ready,
    /// Ready area for units without a dominant type
    ReadyMixed,
    Quarantine(QuarantineKind),
}

impl Destination {
    /// Directory the unit lives in once placed here
    pub fn unit_dir(&self, root: &Path, unit_id: &str, dominant_type: Option<&str>) -> PathBuf {
        match self {
            Self::Processing(_) => root.join(areas::PROCESSING).join(unit_id),
            Self::Ready => root
                .join(areas::READY)
                .join(dominant_type.unwrap_or(areas::MIXED))
                .join(unit_id),
            Self::ReadyMixed => root.join(areas::READY).join(areas::MIXED).join(unit_id),
            Self::Quarantine(kind) => root
                .join(areas::QUARANTINE)
                .join(kind.area_name())
                .join(unit_id),
        }
    }

    /// Same as [`Destination::unit_dir`], relative to the destination root
    pub fn relative_dir(&self, unit_id: &str, dominant_type: Option<&str>) -> String {
        self.unit_dir(Path::new(""), unit_id, dominant_type)
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing(_))
    }

    /// Where a unit in a terminal state belongs
    pub fn for_terminal_state(state: UnitState, dominant_type: Option<&str>) -> Option<Self> {
        match state {
            UnitState::Ready if dominant_type.is_some() => Some(Self::Ready),
            UnitState::Ready => Some(Self::ReadyMixed),
            UnitState::Quarantined(kind) => Some(Self::Quarantine(kind)),
            _ => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processing(stage) => write!(f, "{}/{stage}", areas::PROCESSING),
            Self::Ready => f.write_str(areas::READY),
            Self::ReadyMixed => write!(f, "{}/{}", areas::READY, areas::MIXED),
            Self::Quarantine(kind) => write!(f, "{}/{}", areas::QUARANTINE, kind.area_name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("Duplicate route for state '{state}' and outcome '{outcome}'")]
    DuplicateRoute { state: String, outcome: String },

    #[error("No route registered for state '{state}' and outcome '{outcome}'")]
    MissingRoute { state: String, outcome: String },

    #[error("Route for state '{state}' and outcome '{outcome}' is not declared as reachable")]
    UndeclaredRoute { state: String, outcome: String },

    #[error("Route for state '{state}' and outcome '{outcome}' targets '{target}', which the state machine cannot reach")]
    UnreachableTarget {
        state: String,
        outcome: String,
        target: String,
    },

    #[error("Unrouted outcome '{outcome}' from state '{state}'")]
    Unrouted { state: String, outcome: String },
}
