use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use super::errors::{ManifestError, ManifestResult};
use super::inventory::scan_inventory_async;
use super::mutation::ManifestMutation;
use super::schema::{Manifest, UnitId};
use crate::constants::{areas, MANIFEST_FILE_NAME, MANIFEST_TEMP_PREFIX};

/// Durable per-unit manifests
///
/// Commits for one unit are serialised; a commit is visible to `load` either
/// completely or not at all.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Create the manifest of a newly adopted unit; fails if one exists
    async fn create(&self, unit_id: &UnitId) -> ManifestResult<Manifest>;

    /// Load and migrate; `NotFound` if the unit has no manifest
    async fn load(&self, unit_id: &UnitId) -> ManifestResult<Manifest>;

    /// Apply a mutation as a single atomic write-and-replace
    async fn commit(&self, unit_id: &UnitId, mutation: ManifestMutation) -> ManifestResult<Manifest>;

    /// Directory currently holding the unit's files and manifest
    async fn unit_dir(&self, unit_id: &UnitId) -> ManifestResult<PathBuf>;

    /// Move a terminal unit, manifest included, to `new_dir`
    async fn relocate(&self, unit_id: &UnitId, new_dir: &Path) -> ManifestResult<PathBuf>;

    /// Every unit in the processing area, terminal or not
    fn list_processing(&self) -> BoxStream<'_, ManifestResult<UnitId>>;

    /// Units whose current state is not terminal
    ///
    /// Lazy and finite: the processing area is listed when the stream is
    /// first polled. Calling again starts a fresh listing.
    fn list_non_terminal(&self) -> BoxStream<'_, ManifestResult<UnitId>>;
}

/// Filesystem store keeping `manifest.json` inside each unit directory
#[derive(Debug)]
pub struct FsManifestStore {
    root: PathBuf,
    locations: DashMap<UnitId, PathBuf>,
    locks: DashMap<UnitId, Arc<Mutex<()>>>,
    #[cfg(test)]
    fail_before_persist: AtomicBool,
}

impl FsManifestStore {
    /// Store rooted at the destination root; units start in `<root>/Processing`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locations: DashMap::new(),
            locks: DashMap::new(),
            #[cfg(test)]
            fail_before_persist: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn processing_dir(&self) -> PathBuf {
        self.root.join(areas::PROCESSING)
    }

    fn lock_for(&self, unit_id: &UnitId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(unit_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Find the unit directory: known location, processing area, then placed areas
    async fn locate(&self, unit_id: &UnitId) -> ManifestResult<PathBuf> {
        if let Some(dir) = self.locations.get(unit_id) {
            return Ok(dir.clone());
        }

        let mut candidates = vec![self.processing_dir().join(unit_id.as_str())];
        for area in [areas::QUARANTINE, areas::READY] {
            let area_dir = self.root.join(area);
            let mut buckets = match tokio::fs::read_dir(&area_dir).await {
                Ok(buckets) => buckets,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(bucket) = buckets.next_entry().await? {
                candidates.push(bucket.path().join(unit_id.as_str()));
            }
        }

        for dir in candidates {
            if tokio::fs::try_exists(dir.join(MANIFEST_FILE_NAME)).await? {
                self.locations.insert(unit_id.clone(), dir.clone());
                return Ok(dir);
            }
        }

        Err(ManifestError::NotFound {
            unit_id: unit_id.to_string(),
        })
    }

    async fn read_manifest(dir: &Path, unit_id: &UnitId) -> ManifestResult<Manifest> {
        match tokio::fs::read(dir.join(MANIFEST_FILE_NAME)).await {
            Ok(bytes) => Manifest::from_json(&bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ManifestError::NotFound {
                unit_id: unit_id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Temp file in the unit directory, fsync, then rename over the manifest
    async fn write_atomic(&self, dir: &Path, manifest: &Manifest, create: bool) -> ManifestResult<()> {
        let bytes = manifest.to_json()?;
        let dir = dir.to_path_buf();
        let unit_id = manifest.unit_id.to_string();

        #[cfg(test)]
        let inject_failure = self.fail_before_persist.load(Ordering::SeqCst);
        #[cfg(not(test))]
        let inject_failure = false;

        tokio::task::spawn_blocking(move || -> ManifestResult<()> {
            let mut temp = tempfile::Builder::new()
                .prefix(MANIFEST_TEMP_PREFIX)
                .suffix(".tmp")
                .tempfile_in(&dir)?;
            temp.write_all(&bytes)?;
            temp.as_file().sync_all()?;

            if inject_failure {
                return Err(io::Error::other("injected failure before manifest rename").into());
            }

            let target = dir.join(MANIFEST_FILE_NAME);
            let persisted = if create {
                temp.persist_noclobber(&target)
            } else {
                temp.persist(&target)
            };
            match persisted {
                Ok(_) => Ok(()),
                Err(err) if create && err.error.kind() == io::ErrorKind::AlreadyExists => {
                    Err(ManifestError::AlreadyExists { unit_id })
                }
                Err(err) => Err(err.error.into()),
            }
        })
        .await
        .map_err(io::Error::other)?
    }

    #[cfg(test)]
    fn inject_write_failure(&self, enabled: bool) {
        self.fail_before_persist.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl ManifestStore for FsManifestStore {
    async fn create(&self, unit_id: &UnitId) -> ManifestResult<Manifest> {
        let lock = self.lock_for(unit_id);
        let _guard = lock.lock().await;

        let dir = self.processing_dir().join(unit_id.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        if tokio::fs::try_exists(dir.join(MANIFEST_FILE_NAME)).await? {
            return Err(ManifestError::AlreadyExists {
                unit_id: unit_id.to_string(),
            });
        }

        let inventory = scan_inventory_async(&dir).await?;
        let manifest = Manifest::new(unit_id.clone(), inventory);
        self.write_atomic(&dir, &manifest, true).await?;
        self.locations.insert(unit_id.clone(), dir);

        info!(
            unit_id = %unit_id,
            files = manifest.inventory.len(),
            "📝 Manifest created"
        );
        Ok(manifest)
    }

    async fn load(&self, unit_id: &UnitId) -> ManifestResult<Manifest> {
        let dir = self.locate(unit_id).await?;
        Self::read_manifest(&dir, unit_id).await
    }

    async fn commit(&self, unit_id: &UnitId, mutation: ManifestMutation) -> ManifestResult<Manifest> {
        let lock = self.lock_for(unit_id);
        let _guard = lock.lock().await;

        let dir = self.locate(unit_id).await?;
        let mut manifest = Self::read_manifest(&dir, unit_id).await?;
        let event = mutation.transition.event;
        mutation.apply_to(&mut manifest)?;
        self.write_atomic(&dir, &manifest, false).await?;

        debug!(
            unit_id = %unit_id,
            event = %event,
            state = %manifest.state,
            cycle = manifest.cycle_count,
            history_len = manifest.history.len(),
            "Manifest committed"
        );
        Ok(manifest)
    }

    async fn unit_dir(&self, unit_id: &UnitId) -> ManifestResult<PathBuf> {
        self.locate(unit_id).await
    }

    async fn relocate(&self, unit_id: &UnitId, new_dir: &Path) -> ManifestResult<PathBuf> {
        let lock = self.lock_for(unit_id);
        let _guard = lock.lock().await;

        let current = self.locate(unit_id).await?;
        if current == new_dir {
            return Ok(current);
        }

        let manifest = Self::read_manifest(&current, unit_id).await?;
        if !manifest.state.is_terminal() {
            return Err(ManifestError::Relocation {
                unit_id: unit_id.to_string(),
                reason: format!("state {} is not terminal", manifest.state),
            });
        }
        if tokio::fs::try_exists(new_dir).await? {
            return Err(ManifestError::Relocation {
                unit_id: unit_id.to_string(),
                reason: format!("{} already exists", new_dir.display()),
            });
        }

        if let Some(parent) = new_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&current, new_dir).await?;
        self.locations.insert(unit_id.clone(), new_dir.to_path_buf());

        info!(
            unit_id = %unit_id,
            from = %current.display(),
            to = %new_dir.display(),
            "📦 Unit relocated"
        );
        Ok(new_dir.to_path_buf())
    }

    fn list_processing(&self) -> BoxStream<'_, ManifestResult<UnitId>> {
        let processing = self.processing_dir();
        stream::once(async move { read_unit_ids(&processing).await })
            .flat_map(|listing| match listing {
                Ok(ids) => stream::iter(ids.into_iter().map(Ok)).left_stream(),
                Err(err) => stream::iter(std::iter::once(Err(err))).right_stream(),
            })
            .boxed()
    }

    fn list_non_terminal(&self) -> BoxStream<'_, ManifestResult<UnitId>> {
        self.list_processing()
            .filter_map(move |listed| async move {
                let unit_id = match listed {
                    Ok(unit_id) => unit_id,
                    Err(err) => return Some(Err(err)),
                };
                match self.load(&unit_id).await {
                    Ok(manifest) if manifest.state.is_terminal() => None,
                    Ok(_) => Some(Ok(unit_id)),
                    Err(err) => Some(Err(err)),
                }
            })
            .boxed()
    }
}

/// Unit directories of an area that carry a manifest, sorted
async fn read_unit_ids(area: &Path) -> ManifestResult<Vec<UnitId>> {
    let mut entries = match tokio::fs::read_dir(area).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir()
            && tokio::fs::try_exists(entry.path().join(MANIFEST_FILE_NAME)).await?
        {
            ids.push(UnitId::new(entry.file_name().to_string_lossy().into_owned()));
        }
    }
    ids.sort();
    Ok(ids)
}
