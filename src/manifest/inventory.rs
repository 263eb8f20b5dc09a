//! On-disk inventory scanning and reconciliation

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::schema::{InventoryEntry, Manifest};
use crate::constants::is_pipeline_artifact;
use crate::error::PipelineError;
use crate::state_machine::Stage;

/// Differences between a recorded inventory and the files on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryDiff {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub changed: Vec<String>,
}

impl InventoryDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.changed.is_empty()
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing [{}]", self.missing.join(", ")));
        }
        if !self.unexpected.is_empty() {
            parts.push(format!("unexpected [{}]", self.unexpected.join(", ")));
        }
        if !self.changed.is_empty() {
            parts.push(format!("changed [{}]", self.changed.join(", ")));
        }
        parts.join("; ")
    }
}

/// Build inventory entries for every unit file under `unit_dir`
///
/// The manifest, its temporary siblings and the staging directory are not
/// part of the unit. Entries are sorted by path.
pub fn scan_inventory(unit_dir: &Path) -> io::Result<Vec<InventoryEntry>> {
    scan_tree(unit_dir, true)
}

/// [`scan_inventory`] on the blocking pool
pub async fn scan_inventory_async(unit_dir: &Path) -> io::Result<Vec<InventoryEntry>> {
    let unit_dir = unit_dir.to_path_buf();
    tokio::task::spawn_blocking(move || scan_inventory(&unit_dir))
        .await
        .map_err(io::Error::other)?
}

/// Entries for every file under a staged directory, paths relative to it
///
/// Nothing is skipped: a staged tree is promoted below the unit root, where
/// pipeline artifact names carry no meaning.
pub async fn scan_staged_async(dir: &Path) -> io::Result<Vec<InventoryEntry>> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || scan_tree(&dir, false))
        .await
        .map_err(io::Error::other)?
}

/// Entry for a single file, recorded under `relative`
pub async fn describe_file_async(path: &Path, relative: String) -> io::Result<InventoryEntry> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let (content_hash, size) = hash_file(&path)?;
        Ok(InventoryEntry::new(relative, content_hash, size))
    })
    .await
    .map_err(io::Error::other)?
}

fn scan_tree(root: &Path, skip_artifacts: bool) -> io::Result<Vec<InventoryEntry>> {
    let mut entries = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for dir_entry in fs::read_dir(&dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            if skip_artifacts && dir == root && is_pipeline_artifact(&name.to_string_lossy()) {
                continue;
            }

            let path = dir_entry.path();
            let file_type = dir_entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let (content_hash, size) = hash_file(&path)?;
                entries.push(InventoryEntry::new(
                    relative_path(root, &path),
                    content_hash,
                    size,
                ));
            }
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// `path` below `root` as an inventory path with `/` separators
pub fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Compare recorded entries against scanned ones by path, hash and size
pub fn diff_inventory(recorded: &[InventoryEntry], actual: &[InventoryEntry]) -> InventoryDiff {
    let actual_by_path: HashMap<&str, &InventoryEntry> =
        actual.iter().map(|entry| (entry.path.as_str(), entry)).collect();
    let recorded_by_path: HashMap<&str, &InventoryEntry> =
        recorded.iter().map(|entry| (entry.path.as_str(), entry)).collect();

    let mut diff = InventoryDiff::default();
    for entry in recorded {
        match actual_by_path.get(entry.path.as_str()) {
            None => diff.missing.push(entry.path.clone()),
            Some(found) if !found.same_content(entry) => diff.changed.push(entry.path.clone()),
            Some(_) => {}
        }
    }
    for entry in actual {
        if !recorded_by_path.contains_key(entry.path.as_str()) {
            diff.unexpected.push(entry.path.clone());
        }
    }
    diff
}

/// Fail with `ManifestInconsistency` when the manifest no longer describes the unit directory
pub async fn verify_inventory(manifest: &Manifest, unit_dir: &Path) -> Result<(), PipelineError> {
    let actual = scan_inventory_async(unit_dir).await?;
    let diff = diff_inventory(&manifest.inventory, &actual);
    if diff.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::ManifestInconsistency {
            unit_id: manifest.unit_id.to_string(),
            detail: diff.describe(),
        })
    }
}

/// Keep detected types for files a stage did not touch
///
/// Files are matched by path first, then by content (a rename keeps the
/// hash). New or changed files are attributed to `stage`.
pub fn carry_forward(
    previous: &[InventoryEntry],
    scanned: Vec<InventoryEntry>,
    stage: Stage,
) -> Vec<InventoryEntry> {
    let by_path: HashMap<&str, &InventoryEntry> =
        previous.iter().map(|entry| (entry.path.as_str(), entry)).collect();
    let by_hash: HashMap<(&str, u64), &InventoryEntry> = previous
        .iter()
        .map(|entry| ((entry.content_hash.as_str(), entry.size), entry))
        .collect();

    scanned
        .into_iter()
        .map(|mut entry| {
            let prior = by_path
                .get(entry.path.as_str())
                .filter(|prior| prior.same_content(&entry))
                .or_else(|| by_hash.get(&(entry.content_hash.as_str(), entry.size)));

            match prior {
                Some(prior) => {
                    entry.detected_type = prior.detected_type.clone();
                    entry.last_modified_stage = if prior.path == entry.path {
                        prior.last_modified_stage
                    } else {
                        Some(stage)
                    };
                }
                None => entry.last_modified_stage = Some(stage),
            }
            entry
        })
        .collect()
}
