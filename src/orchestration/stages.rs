//! # Stage Runners
//!
//! The work behind each processing stage. A runner reads the unit directory,
//! drives the external capabilities and reports the inventory the stage
//! leaves behind; committing that result is the orchestrator's job.
//!
//! Extraction and conversion go through their circuit breakers, and
//! conversion additionally holds a converter slot for each file. Both write
//! only below the staging directory: the unit's own files change when the
//! orchestrator applies [`StagedChanges`] after the completion commit. A
//! failed attempt discards the staging directory and leaves the unit as it
//! found it.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::capabilities::{Capabilities, CapabilityError, ExtractionLimits};
use crate::constants::STAGING_DIR;
use crate::decision::DecisionEngine;
use crate::error::PipelineError;
use crate::manifest::{
    carry_forward, describe_file_async, relative_path, scan_inventory_async, scan_staged_async,
    InventoryEntry, Manifest,
};
use crate::resilience::{CircuitBreakerError, CircuitBreakerManager, GuardedOperation};
use crate::routing::RouteOutcome;
use crate::state_machine::Stage;

use super::resource_pool::ResourcePool;

/// Filesystem changes a stage prepared under the staging directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedChanges {
    /// Staged path and the unit path it is moved to
    pub promotions: Vec<(PathBuf, PathBuf)>,
    /// Unit files the promoted output replaces
    pub removals: Vec<PathBuf>,
}

impl StagedChanges {
    pub fn is_empty(&self) -> bool {
        self.promotions.is_empty() && self.removals.is_empty()
    }

    /// Move staged output into the unit and drop the inputs it replaces
    ///
    /// Called once the completion that describes the result is committed.
    /// An interruption part way leaves inventory drift, which recovery and
    /// the drive loop reconcile.
    pub async fn apply(&self, unit_dir: &Path) -> io::Result<()> {
        for (staged, target) in &self.promotions {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(staged, target).await?;
        }
        for removed in &self.removals {
            if tokio::fs::try_exists(removed).await? {
                tokio::fs::remove_file(removed).await?;
            }
        }
        discard_staging(unit_dir).await
    }
}

/// What a successful stage leaves for the completion commit
#[derive(Debug, Clone, PartialEq)]
pub struct StageCompletion {
    /// Inventory of the unit once `staged` is applied
    pub inventory: Vec<InventoryEntry>,
    /// Outcome the next routing decision must use instead of recomputing one
    pub pending_outcome: Option<RouteOutcome>,
    /// `Some` when the stage re-derived the unit's dominant type
    pub dominant_type: Option<Option<String>>,
    pub staged: StagedChanges,
}

impl StageCompletion {
    fn with_inventory(inventory: Vec<InventoryEntry>) -> Self {
        Self {
            inventory,
            pending_outcome: None,
            dominant_type: None,
            staged: StagedChanges::default(),
        }
    }
}

/// Why a stage attempt did not complete
#[derive(Debug)]
pub enum StageFailure {
    /// A guarded capability refused the call; not counted as an attempt
    CircuitOpen {
        operation: GuardedOperation,
        retry_after: Duration,
    },
    Failed {
        error: PipelineError,
        /// Retrying the same input cannot succeed
        permanent: bool,
        /// Unit file the failure concerns
        subject: Option<String>,
    },
}

impl StageFailure {
    fn transient(error: impl Into<PipelineError>) -> Self {
        Self::Failed {
            error: error.into(),
            permanent: false,
            subject: None,
        }
    }

    fn from_breaker(
        operation: GuardedOperation,
        err: CircuitBreakerError<CapabilityError>,
        wrap: fn(String) -> PipelineError,
    ) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen { retry_after, .. } => Self::CircuitOpen {
                operation,
                retry_after,
            },
            CircuitBreakerError::OperationFailed(cause) => Self::Failed {
                permanent: cause.is_permanent(),
                error: wrap(cause.to_string()),
                subject: None,
            },
        }
    }

    /// Attribute the failure to one unit file
    fn concerning(self, path: &str) -> Self {
        match self {
            Self::Failed {
                error, permanent, ..
            } => Self::Failed {
                error,
                permanent,
                subject: Some(path.to_string()),
            },
            other => other,
        }
    }
}

impl From<std::io::Error> for StageFailure {
    fn from(err: std::io::Error) -> Self {
        Self::transient(err)
    }
}

pub type StageResult = Result<StageCompletion, StageFailure>;

/// Executes stages against a unit directory
#[derive(Clone)]
pub struct StageRunner {
    capabilities: Capabilities,
    decision: Arc<DecisionEngine>,
    breakers: Arc<CircuitBreakerManager>,
    converter_slots: ResourcePool,
    limits: ExtractionLimits,
}

impl StageRunner {
    pub fn new(
        capabilities: Capabilities,
        decision: Arc<DecisionEngine>,
        breakers: Arc<CircuitBreakerManager>,
        converter_slots: ResourcePool,
        limits: ExtractionLimits,
    ) -> Self {
        Self {
            capabilities,
            decision,
            breakers,
            converter_slots,
            limits,
        }
    }

    /// Run one attempt of `stage` for the unit whose manifest is `manifest`
    ///
    /// Merge has no filesystem work of its own here: placement happens when
    /// the orchestrator relocates the unit.
    pub async fn run(&self, stage: Stage, manifest: &Manifest, unit_dir: &Path) -> StageResult {
        debug!(
            unit_id = %manifest.unit_id,
            stage = %stage,
            dir = %unit_dir.display(),
            "Running stage"
        );

        let result = match stage {
            Stage::Classify => self.classify(manifest, unit_dir).await,
            Stage::Extract => self.extract(manifest, unit_dir).await,
            Stage::Convert => self.convert(manifest, unit_dir).await,
            Stage::Normalize => self.normalize(manifest, unit_dir).await,
            Stage::Merge => Ok(StageCompletion::with_inventory(manifest.inventory.clone())),
        };

        if result.is_err() {
            if let Err(err) = discard_staging(unit_dir).await {
                warn!(
                    unit_id = %manifest.unit_id,
                    error = %err,
                    "Could not discard staging directory of failed attempt"
                );
            }
        }
        result
    }

    /// Detect every file and derive the unit's dominant type
    async fn classify(&self, manifest: &Manifest, unit_dir: &Path) -> StageResult {
        let scanned = scan_inventory_async(unit_dir).await?;
        let scanned = carry_forward(&manifest.inventory, scanned, Stage::Classify);
        let inventory = self
            .detect_all(scanned, |_| true, |entry| unit_dir.join(&entry.path))
            .await;

        let classification = self.decision.classify_unit(&inventory);
        info!(
            unit_id = %manifest.unit_id,
            files = inventory.len(),
            classification = %classification,
            "🔍 Unit classified"
        );

        Ok(StageCompletion {
            inventory,
            pending_outcome: None,
            dominant_type: Some(classification.dominant_type().map(str::to_string)),
            staged: StagedChanges::default(),
        })
    }

    /// Unpack every archive into staging, to be promoted next to where it was found
    async fn extract(&self, manifest: &Manifest, unit_dir: &Path) -> StageResult {
        let catalog = self.decision.catalog();
        let archives: Vec<&InventoryEntry> = manifest
            .inventory
            .iter()
            .filter(|entry| {
                entry
                    .detected_type
                    .as_deref()
                    .is_some_and(|label| catalog.is_archive(label))
            })
            .collect();

        let breaker = self.breakers.breaker(GuardedOperation::Extraction);
        let staging = unit_dir.join(STAGING_DIR);
        reset_dir(&staging).await?;

        let mut staged = StagedChanges::default();
        let mut extracted = Vec::new();
        let mut reserved = HashSet::new();

        for (index, archive) in archives.iter().enumerate() {
            let archive_path = unit_dir.join(&archive.path);
            let into = staging.join(index.to_string());
            tokio::fs::create_dir_all(&into).await?;

            let extractor = Arc::clone(&self.capabilities.extractor);
            let limits = self.limits;
            let written = breaker
                .call(|| async { extractor.extract(&archive_path, &into, limits).await })
                .await
                .map_err(|err| {
                    StageFailure::from_breaker(
                        GuardedOperation::Extraction,
                        err,
                        PipelineError::ExtractionFailed,
                    )
                    .concerning(&archive.path)
                })?;

            let target = unique_path(&extraction_dir(&archive_path), &reserved).await?;
            let prefix = relative_path(unit_dir, &target);
            extracted.extend(scan_staged_async(&into).await?.into_iter().map(|mut entry| {
                entry.path = format!("{prefix}/{}", entry.path);
                entry
            }));

            info!(
                unit_id = %manifest.unit_id,
                archive = %archive.path,
                files = written.len(),
                into = %prefix,
                "📂 Archive extracted"
            );
            reserved.insert(target.clone());
            staged.promotions.push((into, target));
            staged.removals.push(archive_path);
        }

        let replaced: HashSet<&str> = archives.iter().map(|entry| entry.path.as_str()).collect();
        let mut projected: Vec<InventoryEntry> = scan_inventory_async(unit_dir)
            .await?
            .into_iter()
            .filter(|entry| !replaced.contains(entry.path.as_str()))
            .chain(extracted)
            .collect();
        projected.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(StageCompletion {
            staged,
            ..StageCompletion::with_inventory(carry_forward(
                &manifest.inventory,
                projected,
                Stage::Extract,
            ))
        })
    }

    /// Convert every legacy file to its modern target format
    ///
    /// Each source is copied into its own staging directory and converted
    /// there; the output replaces the source on promotion.
    async fn convert(&self, manifest: &Manifest, unit_dir: &Path) -> StageResult {
        let catalog = self.decision.catalog();
        let pending: Vec<(&InventoryEntry, String)> = manifest
            .inventory
            .iter()
            .filter(|entry| entry.size > 0)
            .filter_map(|entry| {
                let label = entry.detected_type.as_deref()?;
                let target = catalog.conversion_target(label)?;
                Some((entry, target.to_string()))
            })
            .collect();

        let breaker = self.breakers.breaker(GuardedOperation::Conversion);
        let staging = unit_dir.join(STAGING_DIR);
        reset_dir(&staging).await?;

        let mut staged = StagedChanges::default();
        let mut reserved = HashSet::new();
        let mut replaced = HashSet::new();
        let mut outputs = Vec::new();
        let mut staged_at: HashMap<String, PathBuf> = HashMap::new();

        for (index, (entry, target_format)) in pending.iter().enumerate() {
            let source = unit_dir.join(&entry.path);
            let Some(file_name) = source.file_name() else {
                continue;
            };
            let work_dir = staging.join(index.to_string());
            tokio::fs::create_dir_all(&work_dir).await?;
            let staged_source = work_dir.join(file_name);
            tokio::fs::copy(&source, &staged_source).await?;

            let _slot = self
                .converter_slots
                .acquire()
                .await
                .map_err(|err| StageFailure::transient(err).concerning(&entry.path))?;

            let converter = Arc::clone(&self.capabilities.converter);
            let output = breaker
                .call(|| async { converter.convert(&staged_source, target_format).await })
                .await
                .map_err(|err| {
                    StageFailure::from_breaker(
                        GuardedOperation::Conversion,
                        err,
                        PipelineError::ConversionFailed,
                    )
                    .concerning(&entry.path)
                })?;

            let target = match output.file_name() {
                Some(name) if output != staged_source => {
                    staged.removals.push(source.clone());
                    unique_path(&source.with_file_name(name), &reserved).await?
                }
                _ => source.clone(),
            };
            let relative = relative_path(unit_dir, &target);
            outputs.push(describe_file_async(&output, relative.clone()).await?);

            info!(
                unit_id = %manifest.unit_id,
                source = %entry.path,
                output = %relative,
                target_format = %target_format,
                "🔄 File converted"
            );
            replaced.insert(entry.path.clone());
            replaced.insert(relative.clone());
            reserved.insert(target.clone());
            staged_at.insert(relative, output.clone());
            staged.promotions.push((output, target));
        }

        let mut projected: Vec<InventoryEntry> = scan_inventory_async(unit_dir)
            .await?
            .into_iter()
            .filter(|entry| !replaced.contains(&entry.path))
            .chain(outputs)
            .collect();
        projected.sort_by(|a, b| a.path.cmp(&b.path));

        let projected = carry_forward(&manifest.inventory, projected, Stage::Convert);
        let inventory = self
            .detect_all(
                projected,
                |entry| entry.last_modified_stage == Some(Stage::Convert),
                |entry| {
                    staged_at
                        .get(&entry.path)
                        .cloned()
                        .unwrap_or_else(|| unit_dir.join(&entry.path))
                },
            )
            .await;

        let unresolved = inventory
            .iter()
            .filter(|entry| entry.last_modified_stage == Some(Stage::Convert))
            .filter_map(|entry| entry.detected_type.as_deref())
            .any(|label| catalog.is_archive(label) || catalog.is_convertible(label));

        let pending_outcome = if unresolved {
            warn!(
                unit_id = %manifest.unit_id,
                "Conversion produced files that still need work, reclassifying"
            );
            RouteOutcome::RequiresReclassification
        } else {
            RouteOutcome::StageCompleted
        };

        Ok(StageCompletion {
            inventory,
            pending_outcome: Some(pending_outcome),
            dominant_type: None,
            staged,
        })
    }

    /// Sanitize file names and canonicalize extensions
    async fn normalize(&self, manifest: &Manifest, unit_dir: &Path) -> StageResult {
        let catalog = self.decision.catalog();
        let mut renamed = 0usize;

        for entry in &manifest.inventory {
            let current = unit_dir.join(&entry.path);
            let Some(file_name) = current.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };

            let type_label = entry
                .detected_type
                .as_deref()
                .filter(|label| !catalog.is_unknown(Some(*label)) && !catalog.is_archive(label));
            let normalized = normalized_file_name(&file_name, type_label, |ext| {
                catalog.canonical_extension(ext)
            });
            if normalized == file_name {
                continue;
            }

            let target = unique_path(&current.with_file_name(&normalized), &HashSet::new()).await?;
            tokio::fs::rename(&current, &target).await?;
            renamed += 1;
            debug!(
                unit_id = %manifest.unit_id,
                from = %entry.path,
                to = %target.display(),
                "Normalized file name"
            );
        }

        let scanned = scan_inventory_async(unit_dir).await?;
        let inventory = carry_forward(&manifest.inventory, scanned, Stage::Normalize);
        let classification = self.decision.classify_unit(&inventory);

        info!(
            unit_id = %manifest.unit_id,
            renamed = renamed,
            classification = %classification,
            "✨ Unit normalized"
        );

        Ok(StageCompletion {
            inventory,
            pending_outcome: None,
            dominant_type: Some(classification.dominant_type().map(str::to_string)),
            staged: StagedChanges::default(),
        })
    }

    /// Run the detector over the selected entries concurrently
    ///
    /// `locate` maps an entry to the file to inspect, which for staged
    /// output is not yet at its inventory path.
    async fn detect_all(
        &self,
        inventory: Vec<InventoryEntry>,
        select: impl Fn(&InventoryEntry) -> bool,
        locate: impl Fn(&InventoryEntry) -> PathBuf,
    ) -> Vec<InventoryEntry> {
        let detector = &self.capabilities.detector;
        let catalog = self.decision.catalog();

        join_all(inventory.into_iter().map(|mut entry| {
            let location = select(&entry).then(|| locate(&entry));
            async move {
                if let Some(location) = location {
                    let label = detector.detect(&location).await;
                    entry.detected_type = Some(if label.trim().is_empty() {
                        catalog.unknown_label().to_string()
                    } else {
                        label.to_ascii_lowercase()
                    });
                }
                entry
            }
        }))
        .await
    }
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("converter_slots", &self.converter_slots)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

async fn reset_dir(dir: &Path) -> io::Result<()> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await
}

async fn discard_staging(unit_dir: &Path) -> io::Result<()> {
    let staging = unit_dir.join(STAGING_DIR);
    if tokio::fs::try_exists(&staging).await? {
        tokio::fs::remove_dir_all(&staging).await?;
    }
    Ok(())
}

/// `reports/q3.zip` extracts into `reports/q3`
fn extraction_dir(archive: &Path) -> PathBuf {
    let stem = archive
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "extracted".to_string());
    archive.with_file_name(stem)
}

/// First free variant of `path`: `name`, `name-1`, `name-2`, ...
///
/// `reserved` holds targets already promised to other staged output.
async fn unique_path(path: &Path, reserved: &HashSet<PathBuf>) -> io::Result<PathBuf> {
    if !is_taken(path, reserved).await? {
        return Ok(path.to_path_buf());
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut counter = 1u32;
    loop {
        let name = match &extension {
            Some(ext) => format!("{stem}-{counter}.{ext}"),
            None => format!("{stem}-{counter}"),
        };
        let candidate = path.with_file_name(name);
        if !is_taken(&candidate, reserved).await? {
            return Ok(candidate);
        }
        counter += 1;
    }
}

async fn is_taken(path: &Path, reserved: &HashSet<PathBuf>) -> io::Result<bool> {
    Ok(reserved.contains(path) || tokio::fs::try_exists(path).await?)
}

/// Replace characters that are unsafe in file names on common platforms
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = sanitized.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sanitized name with a canonical extension
///
/// Files without an extension get one from their detected type.
pub fn normalized_file_name(
    name: &str,
    type_label: Option<&str>,
    canonical_extension: impl Fn(&str) -> String,
) -> String {
    let sanitized = sanitize_file_name(name);
    match sanitized.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!("{stem}.{}", canonical_extension(ext))
        }
        _ => match type_label {
            Some(label) => format!("{sanitized}.{}", canonical_extension(label)),
            None => sanitized,
        },
    }
}
