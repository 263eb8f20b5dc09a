use serde::{Deserialize, Serialize};
use std::fmt;

use super::states::{QuarantineKind, UnitState};

/// Pipeline stages a unit passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    Extract,
    Convert,
    Normalize,
    Merge,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Classify,
        Stage::Extract,
        Stage::Convert,
        Stage::Normalize,
        Stage::Merge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Extract => "extract",
            Self::Convert => "convert",
            Self::Normalize => "normalize",
            Self::Merge => "merge",
        }
    }

    /// Whether a failure in this stage can change where the unit ends up
    pub fn affects_routing(&self) -> bool {
        !matches!(self, Self::Normalize)
    }

    /// Stage whose completion commits the given state
    pub fn producing(state: UnitState) -> Option<Stage> {
        match state {
            UnitState::Classified => Some(Self::Classify),
            UnitState::Extracted => Some(Self::Extract),
            UnitState::Converted => Some(Self::Convert),
            UnitState::Normalized => Some(Self::Normalize),
            UnitState::Ready | UnitState::Quarantined(_) => Some(Self::Merge),
            UnitState::Input => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that can trigger unit state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum UnitEvent {
    /// Classification committed a typed inventory
    Classify,
    /// Archive extraction completed
    Extract,
    /// Conversion completed
    Convert,
    /// Normalization completed
    Normalize,
    /// Unit placed in the ready area
    Merge,
    /// Unit placed in a quarantine bucket
    Quarantine(QuarantineKind),
    /// A stage attempt began; reflexive
    StageStarted(Stage),
    /// A stage attempt failed and the error was recorded; reflexive
    StageFailed(Stage),
    /// Recovery reset an interrupted attempt; reflexive
    Recover,
}

impl UnitEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Extract => "extract",
            Self::Convert => "convert",
            Self::Normalize => "normalize",
            Self::Merge => "merge",
            Self::Quarantine(_) => "quarantine",
            Self::StageStarted(_) => "stage_started",
            Self::StageFailed(_) => "stage_failed",
            Self::Recover => "recover",
        }
    }

    /// Completion event for a stage
    pub fn completion_of(stage: Stage) -> Self {
        match stage {
            Stage::Classify => Self::Classify,
            Stage::Extract => Self::Extract,
            Stage::Convert => Self::Convert,
            Stage::Normalize => Self::Normalize,
            Stage::Merge => Self::Merge,
        }
    }

    /// Audit events never move a unit to another state
    pub fn is_audit_only(&self) -> bool {
        matches!(
            self,
            Self::StageStarted(_) | Self::StageFailed(_) | Self::Recover
        )
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merge | Self::Quarantine(_))
    }
}

impl fmt::Display for UnitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quarantine(kind) => write!(f, "quarantine({kind})"),
            Self::StageStarted(stage) => write!(f, "stage_started({stage})"),
            Self::StageFailed(stage) => write!(f, "stage_failed({stage})"),
            other => f.write_str(other.event_type()),
        }
    }
}
