use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorKind;

/// Quarantine buckets, one per terminal failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineKind {
    Empty,
    ExtractionFailed,
    ConversionFailed,
    Ambiguous,
}

impl QuarantineKind {
    pub const ALL: [QuarantineKind; 4] = [
        QuarantineKind::Empty,
        QuarantineKind::ExtractionFailed,
        QuarantineKind::ConversionFailed,
        QuarantineKind::Ambiguous,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::ExtractionFailed => "extraction_failed",
            Self::ConversionFailed => "conversion_failed",
            Self::Ambiguous => "ambiguous",
        }
    }

    /// Directory name of the quarantine bucket under the quarantine area
    pub fn area_name(&self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::ExtractionFailed => "ErExtract",
            Self::ConversionFailed => "ErConvert",
            Self::Ambiguous => "Ambiguous",
        }
    }
}

impl From<ErrorKind> for QuarantineKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ExtractionFailed => Self::ExtractionFailed,
            ErrorKind::ConversionFailed | ErrorKind::Other => Self::ConversionFailed,
            ErrorKind::AmbiguousClassification => Self::Ambiguous,
            ErrorKind::EmptyContent => Self::Empty,
        }
    }
}

impl fmt::Display for QuarantineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit state definitions
///
/// Serialized as flat strings (`"classified"`, `"quarantined:empty"`) so the
/// manifest stays readable by hand and by other tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UnitState {
    /// Unit adopted into the pipeline, nothing classified yet
    Input,
    /// File inventory has detected types
    Classified,
    /// Archive containers were unpacked
    Extracted,
    /// Legacy formats were converted
    Converted,
    /// Names and extensions were normalized
    Normalized,
    /// Placed in the ready area
    Ready,
    /// Placed in a quarantine bucket
    Quarantined(QuarantineKind),
}

impl UnitState {
    /// Every state, used by registry coverage checks and property tests
    pub fn all() -> Vec<UnitState> {
        let mut states = vec![
            Self::Input,
            Self::Classified,
            Self::Extracted,
            Self::Converted,
            Self::Normalized,
            Self::Ready,
        ];
        states.extend(QuarantineKind::ALL.into_iter().map(Self::Quarantined));
        states
    }

    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Quarantined(_))
    }

    pub fn is_quarantined(&self) -> bool {
        matches!(self, Self::Quarantined(_))
    }

    /// States a unit leaves `Classified` for after new files appear
    pub fn can_cycle_back(&self) -> bool {
        matches!(self, Self::Extracted | Self::Converted | Self::Normalized)
    }
}

impl Default for UnitState {
    fn default() -> Self {
        Self::Input
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Classified => write!(f, "classified"),
            Self::Extracted => write!(f, "extracted"),
            Self::Converted => write!(f, "converted"),
            Self::Normalized => write!(f, "normalized"),
            Self::Ready => write!(f, "ready"),
            Self::Quarantined(kind) => write!(f, "quarantined:{kind}"),
        }
    }
}

impl std::str::FromStr for UnitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(Self::Input),
            "classified" => Ok(Self::Classified),
            "extracted" => Ok(Self::Extracted),
            "converted" => Ok(Self::Converted),
            "normalized" => Ok(Self::Normalized),
            "ready" => Ok(Self::Ready),
            other => other
                .strip_prefix("quarantined:")
                .and_then(|kind| {
                    QuarantineKind::ALL
                        .into_iter()
                        .find(|candidate| candidate.as_str() == kind)
                })
                .map(Self::Quarantined)
                .ok_or_else(|| format!("Invalid unit state: {s}")),
        }
    }
}

impl TryFrom<String> for UnitState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnitState> for String {
    fn from(state: UnitState) -> Self {
        state.to_string()
    }
}
