//! Counting capability doubles
//!
//! Archives are plain text: one `path=content` line per member. An archive
//! whose first line is `UNSUPPORTED` fails the way an archive using an
//! unsupported compression method would; one whose first line is `FLAKY`
//! fails transiently on its first extraction only. Content may itself be a
//! one-line listing, which nests archives.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use unitflow::{
    ArchiveExtractor, Capabilities, CapabilityError, DocumentConverter, ExtractionLimits,
    Manifest, MetadataSync, TypeDetector, TypeLabel, UnitId,
};

/// Labels files by lowercased extension
///
/// A littering detector also drops `stray-<n>.pdf` next to the file it
/// inspects on each of its first `n` calls, changing the unit behind the
/// pipeline's back.
#[derive(Debug, Default)]
pub struct ExtensionDetector {
    pub calls: AtomicUsize,
    pub litter: AtomicUsize,
}

impl ExtensionDetector {
    pub fn littering(strays: usize) -> Self {
        Self {
            litter: AtomicUsize::new(strays),
            ..Self::default()
        }
    }
}

#[async_trait]
impl TypeDetector for ExtensionDetector {
    async fn detect(&self, path: &Path) -> TypeLabel {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stray = self
            .litter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if let (Ok(left), Some(dir)) = (stray, path.parent()) {
            tokio::fs::write(dir.join(format!("stray-{left}.pdf")), "%PDF")
                .await
                .unwrap();
        }

        path.extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Default)]
pub struct TextArchiveExtractor {
    pub calls: AtomicUsize,
    pub failed_once: Mutex<HashSet<PathBuf>>,
}

#[async_trait]
impl ArchiveExtractor for TextArchiveExtractor {
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        _limits: ExtractionLimits,
    ) -> Result<Vec<PathBuf>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let listing = tokio::fs::read_to_string(archive).await?;
        if listing.starts_with("UNSUPPORTED") {
            return Err(CapabilityError::UnsupportedFormat(
                "compression method deflate64".to_string(),
            ));
        }
        let listing = match listing.strip_prefix("FLAKY") {
            Some(rest) => {
                if self.failed_once.lock().insert(archive.to_path_buf()) {
                    return Err(CapabilityError::Unavailable("archive mount busy".to_string()));
                }
                rest.to_string()
            }
            None => listing,
        };

        let mut written = Vec::new();
        for line in listing.lines().filter(|line| !line.trim().is_empty()) {
            let (name, content) = line
                .split_once('=')
                .ok_or_else(|| CapabilityError::Corrupt(format!("bad member line: {line}")))?;
            let target = dest.join(name);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await?;
            written.push(target);
        }
        Ok(written)
    }
}

/// How [`ScriptedConverter`] behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterMode {
    /// `memo.doc` becomes `memo.docx`
    Faithful,
    /// Every output is another legacy file, so the unit never settles
    Stubborn,
    /// Fails transiently for the first `n` calls, then behaves faithfully
    FlakyFor(usize),
    /// Takes this many milliseconds per file, then behaves faithfully
    Slow(u64),
}

#[derive(Debug)]
pub struct ScriptedConverter {
    pub mode: ConverterMode,
    pub calls: AtomicUsize,
}

impl ScriptedConverter {
    pub fn new(mode: ConverterMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DocumentConverter for ScriptedConverter {
    async fn convert(&self, source: &Path, target_format: &str) -> Result<PathBuf, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let stem = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source_ext = source
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();

        let output = match self.mode {
            ConverterMode::FlakyFor(failures) if call < failures => {
                return Err(CapabilityError::Unavailable("converter busy".to_string()));
            }
            ConverterMode::Slow(millis) => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                source.with_file_name(format!("{stem}.{target_format}"))
            }
            ConverterMode::Faithful | ConverterMode::FlakyFor(_) => {
                source.with_file_name(format!("{stem}.{target_format}"))
            }
            ConverterMode::Stubborn => source.with_file_name(format!("{stem}_v.{source_ext}")),
        };

        let content = tokio::fs::read(source).await?;
        tokio::fs::write(&output, content).await?;
        Ok(output)
    }
}

/// Records every synced unit; optionally fails every call
#[derive(Debug, Default)]
pub struct RecordingMetadataSync {
    pub fail: bool,
    pub synced: Mutex<Vec<UnitId>>,
}

impl RecordingMetadataSync {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn synced(&self) -> Vec<UnitId> {
        self.synced.lock().clone()
    }
}

#[async_trait]
impl MetadataSync for RecordingMetadataSync {
    async fn sync(&self, manifest: &Manifest) -> Result<(), CapabilityError> {
        self.synced.lock().push(manifest.unit_id.clone());
        if self.fail {
            Err(CapabilityError::Unavailable("metadata store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Doubles plus the [`Capabilities`] wired from them
pub struct TestCapabilities {
    pub detector: Arc<ExtensionDetector>,
    pub extractor: Arc<TextArchiveExtractor>,
    pub converter: Arc<ScriptedConverter>,
    pub metadata_sync: Arc<RecordingMetadataSync>,
}

impl TestCapabilities {
    pub fn new(mode: ConverterMode) -> Self {
        Self::with_sync(mode, RecordingMetadataSync::default())
    }

    pub fn with_sync(mode: ConverterMode, sync: RecordingMetadataSync) -> Self {
        Self {
            detector: Arc::new(ExtensionDetector::default()),
            extractor: Arc::new(TextArchiveExtractor::default()),
            converter: Arc::new(ScriptedConverter::new(mode)),
            metadata_sync: Arc::new(sync),
        }
    }

    pub fn with_detector(mut self, detector: ExtensionDetector) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            self.detector.clone(),
            self.extractor.clone(),
            self.converter.clone(),
        )
        .with_metadata_sync(self.metadata_sync.clone())
    }

    pub fn extractor_calls(&self) -> usize {
        self.extractor.calls.load(Ordering::SeqCst)
    }

    pub fn converter_calls(&self) -> usize {
        self.converter.calls.load(Ordering::SeqCst)
    }
}
