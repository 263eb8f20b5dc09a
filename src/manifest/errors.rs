use thiserror::Error;

use crate::state_machine::UnitState;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("No manifest for unit {unit_id}")]
    NotFound { unit_id: String },

    #[error("Manifest already exists for unit {unit_id}")]
    AlreadyExists { unit_id: String },

    #[error("Manifest schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },

    #[error("Invalid manifest document: {0}")]
    InvalidDocument(String),

    #[error("Concurrent modification of unit {unit_id}: expected state {expected}, found {actual}")]
    ConcurrentModification {
        unit_id: String,
        expected: UnitState,
        actual: UnitState,
    },

    #[error("Unit {unit_id} cannot be relocated: {reason}")]
    Relocation { unit_id: String, reason: String },

    #[error("Manifest I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ManifestResult<T> = Result<T, ManifestError>;
