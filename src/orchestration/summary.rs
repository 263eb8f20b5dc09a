//! Batch run results

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::recovery::RecoveryReport;
use crate::manifest::UnitId;
use crate::state_machine::{QuarantineKind, UnitState};

/// How a single unit's run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Reached `Ready` or a quarantine bucket
    Terminal { state: UnitState },
    /// Left non-terminal by cancellation; resumes on the next run
    Deferred { state: Option<UnitState> },
    /// Stopped by a fatal error; left in place for inspection
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub unit_id: UnitId,
    pub outcome: UnitOutcome,
}

/// Totals for one batch run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    /// Correlates this summary with the run's log lines
    pub run_id: Uuid,
    /// Units that reached an outcome this run, including those recovery placed
    pub processed: usize,
    pub ready: usize,
    pub quarantined_by_kind: BTreeMap<QuarantineKind, usize>,
    pub deferred: usize,
    pub aborted: usize,
    pub units: Vec<UnitReport>,
    pub recovery: RecoveryReport,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl Summary {
    pub fn record(&mut self, unit_id: UnitId, outcome: UnitOutcome) {
        self.processed += 1;
        match &outcome {
            UnitOutcome::Terminal { state } => self.record_terminal(*state),
            UnitOutcome::Deferred { .. } => self.deferred += 1,
            UnitOutcome::Aborted { .. } => self.aborted += 1,
        }
        self.units.push(UnitReport { unit_id, outcome });
    }

    fn record_terminal(&mut self, state: UnitState) {
        match state {
            UnitState::Ready => self.ready += 1,
            UnitState::Quarantined(kind) => {
                *self.quarantined_by_kind.entry(kind).or_default() += 1;
            }
            _ => {}
        }
    }

    pub fn quarantined(&self) -> usize {
        self.quarantined_by_kind.values().sum()
    }

    pub fn quarantined_as(&self, kind: QuarantineKind) -> usize {
        self.quarantined_by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn outcome_of(&self, unit_id: &UnitId) -> Option<&UnitOutcome> {
        self.units
            .iter()
            .find(|report| &report.unit_id == unit_id)
            .map(|report| &report.outcome)
    }

    pub fn format_summary(&self) -> String {
        format!(
            "processed={}, ready={}, quarantined={}, deferred={}, aborted={}, elapsed={}ms",
            self.processed,
            self.ready,
            self.quarantined(),
            self.deferred,
            self.aborted,
            self.elapsed.as_millis()
        )
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
