//! # Crash Recovery
//!
//! Run before dispatch. Walks every unit in the processing area and brings
//! it back to a state the orchestrator can resume from:
//!
//! - terminal units left behind by a crash between commit and relocation
//!   are moved to their destination;
//! - stage attempts that were started but never committed are reset with
//!   a `Recover` event and re-queued;
//! - units whose files no longer match the recorded inventory are
//!   re-scanned and sent back to classification;
//! - units that need repair but have exhausted their cycle budget are
//!   quarantined instead of re-queued.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::constants::STAGING_DIR;
use crate::error::PipelineError;
use crate::manifest::{
    carry_forward, diff_inventory, scan_inventory_async, Manifest, ManifestMutation,
    ManifestStore, UnitId,
};
use crate::routing::{Destination, RouteOutcome};
use crate::state_machine::{QuarantineKind, Stage, UnitEvent, UnitStateMachine};

/// What recovery did to a single unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Nothing to repair
    Untouched,
    /// Interrupted attempt reset
    Requeued,
    /// Inventory re-scanned and reclassification scheduled
    Reconciled,
    /// Cycle budget exhausted while needing repair
    Quarantined(QuarantineKind),
    /// Terminal unit moved out of the processing area
    Relocated,
}

/// Per-action unit lists from one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub requeued: Vec<UnitId>,
    pub reconciled: Vec<UnitId>,
    pub quarantined: Vec<UnitId>,
    pub relocated: Vec<UnitId>,
    /// Units recovery could not repair, with the reason
    pub failed: Vec<(UnitId, String)>,
}

impl RecoveryReport {
    pub fn record(&mut self, unit_id: UnitId, action: RecoveryAction) {
        match action {
            RecoveryAction::Untouched => {}
            RecoveryAction::Requeued => self.requeued.push(unit_id),
            RecoveryAction::Reconciled => self.reconciled.push(unit_id),
            RecoveryAction::Quarantined(_) => self.quarantined.push(unit_id),
            RecoveryAction::Relocated => self.relocated.push(unit_id),
        }
    }

    pub fn repaired(&self) -> usize {
        self.requeued.len() + self.reconciled.len() + self.quarantined.len() + self.relocated.len()
    }
}

#[derive(Clone)]
pub struct RecoveryEngine {
    store: Arc<dyn ManifestStore>,
    machine: UnitStateMachine,
    destination_root: PathBuf,
}

impl RecoveryEngine {
    pub fn new(
        store: Arc<dyn ManifestStore>,
        machine: UnitStateMachine,
        destination_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            machine,
            destination_root: destination_root.into(),
        }
    }

    /// Repair every unit in the processing area
    ///
    /// A unit that cannot be repaired is reported and skipped; the pass
    /// itself only fails if the processing area cannot be listed at all.
    pub async fn recover(&self) -> Result<RecoveryReport, PipelineError> {
        let mut report = RecoveryReport::default();
        let mut units = self.store.list_processing();

        while let Some(listed) = units.next().await {
            let unit_id = listed?;
            match self.recover_unit(&unit_id).await {
                Ok(action) => report.record(unit_id, action),
                Err(err) => {
                    error!(unit_id = %unit_id, error = %err, "❌ Recovery failed for unit");
                    report.failed.push((unit_id, err.to_string()));
                }
            }
        }

        if report.repaired() > 0 || !report.failed.is_empty() {
            info!(
                requeued = report.requeued.len(),
                reconciled = report.reconciled.len(),
                quarantined = report.quarantined.len(),
                relocated = report.relocated.len(),
                failed = report.failed.len(),
                "🩹 Recovery pass complete"
            );
        }
        Ok(report)
    }

    async fn recover_unit(&self, unit_id: &UnitId) -> Result<RecoveryAction, PipelineError> {
        let manifest = self.store.load(unit_id).await?;
        if manifest.state.is_terminal() {
            self.place(&manifest).await?;
            return Ok(RecoveryAction::Relocated);
        }
        self.reconcile_unit(unit_id).await
    }

    /// Bring a non-terminal unit's manifest back in line with its directory
    pub async fn reconcile_unit(&self, unit_id: &UnitId) -> Result<RecoveryAction, PipelineError> {
        let unit_dir = self.store.unit_dir(unit_id).await?;
        let staging = unit_dir.join(STAGING_DIR);
        if tokio::fs::try_exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging).await?;
        }

        let manifest = self.store.load(unit_id).await?;
        if manifest.state.is_terminal() {
            return Ok(RecoveryAction::Untouched);
        }

        let interrupted = manifest.interrupted_stage();
        let scanned = scan_inventory_async(&unit_dir).await?;
        let diff = diff_inventory(&manifest.inventory, &scanned);

        if interrupted.is_none() && diff.is_empty() {
            return Ok(RecoveryAction::Untouched);
        }

        if manifest.cycle_count >= self.machine.max_cycles() {
            let kind = self.quarantine(&manifest).await?;
            return Ok(RecoveryAction::Quarantined(kind));
        }

        let transition = self.machine.apply(&manifest.snapshot(), &UnitEvent::Recover)?;
        if diff.is_empty() {
            self.store
                .commit(unit_id, ManifestMutation::new(transition))
                .await?;
            warn!(
                unit_id = %unit_id,
                stage = ?interrupted,
                "♻️ Interrupted stage reset"
            );
            return Ok(RecoveryAction::Requeued);
        }

        let stage = interrupted.unwrap_or(Stage::Classify);
        let inventory = carry_forward(&manifest.inventory, scanned, stage);
        self.store
            .commit(
                unit_id,
                ManifestMutation::new(transition)
                    .with_inventory(inventory)
                    .with_pending_outcome(RouteOutcome::RequiresReclassification),
            )
            .await?;
        warn!(
            unit_id = %unit_id,
            drift = %diff.describe(),
            "♻️ Inventory reconciled, unit will be reclassified"
        );
        Ok(RecoveryAction::Reconciled)
    }

    /// Force a unit out of the pipeline and place it
    async fn quarantine(&self, manifest: &Manifest) -> Result<QuarantineKind, PipelineError> {
        let kind = manifest
            .snapshot()
            .last_error
            .map(QuarantineKind::from)
            .unwrap_or(QuarantineKind::ConversionFailed);
        let transition = self
            .machine
            .apply(&manifest.snapshot(), &UnitEvent::Quarantine(kind))?;
        let destination = Destination::Quarantine(kind);

        let committed = self
            .store
            .commit(
                &manifest.unit_id,
                ManifestMutation::new(transition)
                    .with_destination(destination.relative_dir(manifest.unit_id.as_str(), None)),
            )
            .await?;
        warn!(
            unit_id = %manifest.unit_id,
            cycle = manifest.cycle_count,
            quarantine = %kind,
            "🔁 Cycle budget exhausted during recovery, quarantining"
        );
        self.place(&committed).await?;
        Ok(kind)
    }

    /// Move a terminal unit to the directory its manifest names
    pub async fn place(&self, manifest: &Manifest) -> Result<PathBuf, PipelineError> {
        let relative = match &manifest.destination {
            Some(relative) => relative.clone(),
            None => Destination::for_terminal_state(manifest.state, manifest.dominant_type.as_deref())
                .map(|destination| {
                    destination.relative_dir(manifest.unit_id.as_str(), manifest.dominant_type.as_deref())
                })
                .ok_or_else(|| PipelineError::ManifestInconsistency {
                    unit_id: manifest.unit_id.to_string(),
                    detail: format!("state {} has no destination", manifest.state),
                })?,
        };

        let target = self.destination_root.join(relative);
        Ok(self.store.relocate(&manifest.unit_id, &target).await?)
    }
}

impl std::fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("machine", &self.machine)
            .field("destination_root", &self.destination_root)
            .finish_non_exhaustive()
    }
}
