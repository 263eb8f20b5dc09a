use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::{
    errors::{invalid_transition, StateMachineError, StateMachineResult},
    events::UnitEvent,
    states::{QuarantineKind, UnitState},
};
use crate::error::ErrorKind;

/// The slice of a unit's manifest the transition logic needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitSnapshot {
    pub state: UnitState,
    pub cycle_count: u32,
    /// Kind of the most recent error record, if any
    pub last_error: Option<ErrorKind>,
}

impl UnitSnapshot {
    pub fn new(state: UnitState, cycle_count: u32) -> Self {
        Self {
            state,
            cycle_count,
            last_error: None,
        }
    }

    pub fn with_last_error(mut self, kind: ErrorKind) -> Self {
        self.last_error = Some(kind);
        self
    }
}

/// A validated state change, ready to be committed to the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: UnitState,
    pub to: UnitState,
    pub event: UnitEvent,
    /// Cycle count after the transition
    pub cycle: u32,
    /// True when the cycle guard replaced the requested transition
    pub forced: bool,
}

impl Transition {
    pub fn is_reflexive(&self) -> bool {
        self.from == self.to
    }

    pub fn cycle_incremented(&self, previous_cycle: u32) -> bool {
        self.cycle > previous_cycle
    }
}

/// Pure transition logic for units
///
/// The table is the only authority on which (state, event) pairs are legal;
/// persistence is the manifest store's job.
#[derive(Debug, Clone, Copy)]
pub struct UnitStateMachine {
    max_cycles: u32,
}

impl UnitStateMachine {
    pub fn new(max_cycles: u32) -> StateMachineResult<Self> {
        if max_cycles == 0 {
            return Err(StateMachineError::InvalidCycleLimit);
        }
        Ok(Self { max_cycles })
    }

    pub fn max_cycles(&self) -> u32 {
        self.max_cycles
    }

    /// Look up the target state for an event, without the cycle guard
    pub fn determine_target_state(
        &self,
        current_state: UnitState,
        event: &UnitEvent,
    ) -> StateMachineResult<UnitState> {
        Self::table_target(current_state, event)
    }

    /// The transition table itself; independent of any cycle budget
    pub fn table_target(current_state: UnitState, event: &UnitEvent) -> StateMachineResult<UnitState> {
        use UnitState::*;

        let target = match (current_state, event) {
            // Classification, including the single back-edge
            (Input, UnitEvent::Classify) => Classified,
            (Classified, UnitEvent::Classify) => Classified,
            (Extracted | Converted | Normalized, UnitEvent::Classify) => Classified,

            // Stage completions and their idempotent re-application
            (Classified | Extracted, UnitEvent::Extract) => Extracted,
            (Classified | Converted, UnitEvent::Convert) => Converted,
            (Classified | Converted | Normalized, UnitEvent::Normalize) => Normalized,
            (Normalized | Ready, UnitEvent::Merge) => Ready,

            // Quarantine from anywhere live, audit re-entry for the same bucket
            (from, UnitEvent::Quarantine(kind)) if !from.is_terminal() => Quarantined(*kind),
            (Quarantined(current), UnitEvent::Quarantine(kind)) if current == *kind => {
                Quarantined(*kind)
            }

            // Audit-only events
            (from, UnitEvent::StageStarted(_) | UnitEvent::StageFailed(_) | UnitEvent::Recover)
                if !from.is_terminal() =>
            {
                from
            }

            (from_state, _) => return Err(invalid_transition(from_state, *event)),
        };

        Ok(target)
    }

    /// Apply an event to a unit, enforcing the cycle budget
    pub fn apply(
        &self,
        snapshot: &UnitSnapshot,
        event: &UnitEvent,
    ) -> StateMachineResult<Transition> {
        let target = match self.determine_target_state(snapshot.state, event) {
            Ok(target) => target,
            Err(err) => {
                error!(
                    state = %snapshot.state,
                    event = %event,
                    cycle = snapshot.cycle_count,
                    "❌ Rejected unit state transition"
                );
                return Err(err);
            }
        };

        let cycles_back = target == UnitState::Classified && snapshot.state.can_cycle_back();
        if !cycles_back {
            return Ok(Transition {
                from: snapshot.state,
                to: target,
                event: *event,
                cycle: snapshot.cycle_count,
                forced: false,
            });
        }

        if snapshot.cycle_count >= self.max_cycles {
            let kind = snapshot
                .last_error
                .map(QuarantineKind::from)
                .unwrap_or(QuarantineKind::ConversionFailed);
            warn!(
                state = %snapshot.state,
                cycle = snapshot.cycle_count,
                max_cycles = self.max_cycles,
                quarantine = %kind,
                "🔁 Cycle budget exhausted, forcing quarantine"
            );
            return Ok(Transition {
                from: snapshot.state,
                to: UnitState::Quarantined(kind),
                event: UnitEvent::Quarantine(kind),
                cycle: snapshot.cycle_count,
                forced: true,
            });
        }

        Ok(Transition {
            from: snapshot.state,
            to: UnitState::Classified,
            event: *event,
            cycle: snapshot.cycle_count + 1,
            forced: false,
        })
    }

    /// Check whether a (state, event) pair is in the table
    pub fn allows(state: UnitState, event: &UnitEvent) -> bool {
        Self::table_target(state, event).is_ok()
    }
}
