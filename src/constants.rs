//! # System Constants
//!
//! Names that define the on-disk layout of a pipeline run: where manifests
//! live, which directories the storage areas use, and the schema version
//! this build writes.

/// Manifest file co-located with every unit's files
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Schema version written by every commit
pub const CURRENT_SCHEMA_VERSION: u32 = 4;

/// Scratch directory inside a unit used while extracting
pub const STAGING_DIR: &str = ".staging";

/// Prefix of the temporary files used for atomic manifest replacement
pub const MANIFEST_TEMP_PREFIX: &str = ".manifest-";

/// Storage areas under the destination root
pub mod areas {
    pub const PROCESSING: &str = "Processing";
    pub const READY: &str = "Ready";
    pub const QUARANTINE: &str = "Quarantine";

    /// Ready sub-area for units without a dominant type
    pub const MIXED: &str = "Mixed";
}

/// Resource names used in logs and timeout errors
pub mod resources {
    pub const CONVERTER_SLOTS: &str = "converter_slots";
    pub const WORKER_SLOTS: &str = "worker_slots";
}

/// Check whether a path component belongs to the pipeline rather than the unit
pub fn is_pipeline_artifact(name: &str) -> bool {
    name == MANIFEST_FILE_NAME || name == STAGING_DIR || name.starts_with(MANIFEST_TEMP_PREFIX)
}
