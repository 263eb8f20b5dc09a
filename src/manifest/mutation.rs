use chrono::Utc;

use super::errors::{ManifestError, ManifestResult};
use super::schema::{ErrorRecord, HistoryEntry, InventoryEntry, Manifest};
use crate::routing::RouteOutcome;
use crate::state_machine::Transition;

/// A described change to a manifest, applied as one atomic commit
///
/// Every mutation carries exactly one validated [`Transition`], so every
/// commit appends exactly one history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestMutation {
    pub transition: Transition,
    pub inventory: Option<Vec<InventoryEntry>>,
    pub error: Option<ErrorRecord>,
    pub pending_outcome: Option<RouteOutcome>,
    pub destination: Option<String>,
    /// `Some(None)` clears the dominant type
    pub dominant_type: Option<Option<String>>,
}

impl ManifestMutation {
    pub fn new(transition: Transition) -> Self {
        Self {
            transition,
            inventory: None,
            error: None,
            pending_outcome: None,
            destination: None,
            dominant_type: None,
        }
    }

    pub fn with_inventory(mut self, inventory: Vec<InventoryEntry>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn with_error(mut self, error: ErrorRecord) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_pending_outcome(mut self, outcome: RouteOutcome) -> Self {
        self.pending_outcome = Some(outcome);
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_dominant_type(mut self, dominant_type: Option<String>) -> Self {
        self.dominant_type = Some(dominant_type);
        self
    }

    /// Apply to an in-memory manifest, refusing stale transitions
    ///
    /// A pending outcome survives audit-only events and is consumed by the
    /// next state-changing commit unless the mutation sets a new one. Error
    /// records take the cycle of the commit that records them.
    pub fn apply_to(self, manifest: &mut Manifest) -> ManifestResult<()> {
        let transition = self.transition;
        if transition.from != manifest.state {
            return Err(ManifestError::ConcurrentModification {
                unit_id: manifest.unit_id.to_string(),
                expected: transition.from,
                actual: manifest.state,
            });
        }

        let now = Utc::now();
        manifest.state = transition.to;
        manifest.cycle_count = transition.cycle;
        manifest.updated_at = now;
        manifest.history.push(HistoryEntry {
            state: transition.to,
            timestamp: now,
            cycle: transition.cycle,
            event: transition.event,
        });

        if let Some(inventory) = self.inventory {
            manifest.inventory = inventory;
        }
        if let Some(mut error) = self.error {
            error.cycle = transition.cycle;
            manifest.errors.push(error);
        }
        if self.pending_outcome.is_some() || !transition.event.is_audit_only() {
            manifest.pending_outcome = self.pending_outcome;
        }
        if let Some(destination) = self.destination {
            manifest.destination = Some(destination);
        }
        if let Some(dominant_type) = self.dominant_type {
            manifest.dominant_type = dominant_type;
        }

        Ok(())
    }
}
