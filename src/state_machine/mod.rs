//! # Unit State Machine
//!
//! Pure transition logic for units moving through the pipeline. The transition
//! table, the single `Classified` back-edge and the cycle budget live here;
//! the manifest store persists whatever [`Transition`] this module produces.

pub mod errors;
pub mod events;
pub mod states;
pub mod unit_state_machine;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::{Stage, UnitEvent};
pub use states::{QuarantineKind, UnitState};
pub use unit_state_machine::{Transition, UnitSnapshot, UnitStateMachine};
