//! # Capability Interfaces
//!
//! The external operations the pipeline drives but does not implement:
//! type detection, archive extraction, document conversion and metadata sync.
//! Concrete engines implement these traits; tests substitute counting doubles.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::ExtractionConfig;
use crate::manifest::Manifest;

/// Type label returned by a detector, e.g. `"pdf"` or the unknown label
pub type TypeLabel = String;

/// Failures reported by an external capability
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Input the capability can never handle, e.g. an unsupported compression method
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Size or depth guard tripped
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Corrupt input: {0}")]
    Corrupt(String),

    /// The backing service or tool is not reachable right now
    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CapabilityError {
    /// Retrying the same input cannot succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat(_) | Self::LimitExceeded(_) | Self::Corrupt(_)
        )
    }
}

/// Zip-bomb guard handed to the extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionLimits {
    pub max_depth: u32,
    pub max_expanded_size: u64,
}

impl From<&ExtractionConfig> for ExtractionLimits {
    fn from(config: &ExtractionConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_expanded_size: config.max_expanded_size_bytes,
        }
    }
}

#[async_trait]
pub trait TypeDetector: Send + Sync {
    /// Never fails; unreadable files get the unknown label
    async fn detect(&self, path: &Path) -> TypeLabel;
}

#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Unpack `archive` into `dest`, returning the files written
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        limits: ExtractionLimits,
    ) -> Result<Vec<PathBuf>, CapabilityError>;
}

#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Convert one file; runs under the converter slot pool and never retries
    async fn convert(&self, source: &Path, target_format: &str) -> Result<PathBuf, CapabilityError>;
}

#[async_trait]
pub trait MetadataSync: Send + Sync {
    /// Best-effort record update after a unit reaches a terminal state
    async fn sync(&self, manifest: &Manifest) -> Result<(), CapabilityError>;
}

/// Metadata sync for deployments without an external store
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetadataSync;

#[async_trait]
impl MetadataSync for NoopMetadataSync {
    async fn sync(&self, _manifest: &Manifest) -> Result<(), CapabilityError> {
        Ok(())
    }
}

/// The set of external engines an orchestrator drives
#[derive(Clone)]
pub struct Capabilities {
    pub detector: Arc<dyn TypeDetector>,
    pub extractor: Arc<dyn ArchiveExtractor>,
    pub converter: Arc<dyn DocumentConverter>,
    pub metadata_sync: Arc<dyn MetadataSync>,
}

impl Capabilities {
    pub fn new(
        detector: Arc<dyn TypeDetector>,
        extractor: Arc<dyn ArchiveExtractor>,
        converter: Arc<dyn DocumentConverter>,
    ) -> Self {
        Self {
            detector,
            extractor,
            converter,
            metadata_sync: Arc::new(NoopMetadataSync),
        }
    }

    pub fn with_metadata_sync(mut self, metadata_sync: Arc<dyn MetadataSync>) -> Self {
        self.metadata_sync = metadata_sync;
        self
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
