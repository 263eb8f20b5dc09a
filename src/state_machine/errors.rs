use thiserror::Error;

use super::events::UnitEvent;
use super::states::UnitState;

/// Error types for state machine operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on event {event}")]
    InvalidTransition { from: UnitState, event: UnitEvent },

    #[error("Cycle limit misconfigured: max_cycles must be at least 1")]
    InvalidCycleLimit,
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

pub(crate) fn invalid_transition(from: UnitState, event: UnitEvent) -> StateMachineError {
    StateMachineError::InvalidTransition { from, event }
}
