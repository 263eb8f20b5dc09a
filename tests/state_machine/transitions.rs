use proptest::prelude::*;
use unitflow::state_machine::{
    QuarantineKind, Stage, StateMachineError, UnitEvent, UnitSnapshot, UnitState,
    UnitStateMachine,
};

fn all_events() -> Vec<UnitEvent> {
    let mut events = vec![
        UnitEvent::Classify,
        UnitEvent::Extract,
        UnitEvent::Convert,
        UnitEvent::Normalize,
        UnitEvent::Merge,
        UnitEvent::Recover,
    ];
    events.extend(QuarantineKind::ALL.into_iter().map(UnitEvent::Quarantine));
    events.extend(Stage::ALL.into_iter().map(UnitEvent::StageStarted));
    events.extend(Stage::ALL.into_iter().map(UnitEvent::StageFailed));
    events
}

fn state_strategy() -> impl Strategy<Value = UnitState> {
    prop::sample::select(UnitState::all())
}

fn event_strategy() -> impl Strategy<Value = UnitEvent> {
    prop::sample::select(all_events())
}

#[test]
fn test_happy_path_to_ready() {
    let machine = UnitStateMachine::new(3).unwrap();
    let mut snapshot = UnitSnapshot::new(UnitState::Input, 0);

    for (event, expected) in [
        (UnitEvent::Classify, UnitState::Classified),
        (UnitEvent::Convert, UnitState::Converted),
        (UnitEvent::Normalize, UnitState::Normalized),
        (UnitEvent::Merge, UnitState::Ready),
    ] {
        let transition = machine.apply(&snapshot, &event).unwrap();
        assert_eq!(transition.to, expected);
        assert!(!transition.forced);
        snapshot = UnitSnapshot::new(transition.to, transition.cycle);
    }
    assert_eq!(snapshot.cycle_count, 0);
}

#[test]
fn test_back_edge_counts_cycles_until_forced() {
    let machine = UnitStateMachine::new(2).unwrap();
    let mut snapshot = UnitSnapshot::new(UnitState::Classified, 0);

    for expected_cycle in 1..=2 {
        let extracted = machine.apply(&snapshot, &UnitEvent::Extract).unwrap();
        snapshot = UnitSnapshot::new(extracted.to, extracted.cycle);
        let back = machine.apply(&snapshot, &UnitEvent::Classify).unwrap();
        assert_eq!(back.to, UnitState::Classified);
        assert_eq!(back.cycle, expected_cycle);
        snapshot = UnitSnapshot::new(back.to, back.cycle);
    }

    let extracted = machine.apply(&snapshot, &UnitEvent::Extract).unwrap();
    let forced = machine
        .apply(
            &UnitSnapshot::new(extracted.to, extracted.cycle),
            &UnitEvent::Classify,
        )
        .unwrap();
    assert!(forced.forced);
    assert_eq!(
        forced.to,
        UnitState::Quarantined(QuarantineKind::ConversionFailed)
    );
}

#[test]
fn test_zero_cycle_budget_is_rejected() {
    assert!(matches!(
        UnitStateMachine::new(0),
        Err(StateMachineError::InvalidCycleLimit)
    ));
}

proptest! {
    /// Property: apply succeeds exactly for pairs the table allows
    #[test]
    fn apply_agrees_with_table(state in state_strategy(), event in event_strategy(), cycle in 0u32..2) {
        let machine = UnitStateMachine::new(3).unwrap();
        let result = machine.apply(&UnitSnapshot::new(state, cycle), &event);

        if UnitStateMachine::allows(state, &event) {
            prop_assert!(result.is_ok());
        } else {
            let is_invalid_transition = matches!(result, Err(StateMachineError::InvalidTransition { .. }));
            prop_assert!(is_invalid_transition, "expected InvalidTransition for {} + {}", state, event);
        }
    }

    /// Property: terminal states never change
    #[test]
    fn terminal_states_are_absorbing(state in state_strategy(), event in event_strategy()) {
        prop_assume!(state.is_terminal());
        let machine = UnitStateMachine::new(3).unwrap();
        if let Ok(transition) = machine.apply(&UnitSnapshot::new(state, 0), &event) {
            prop_assert_eq!(transition.to, state);
        }
    }

    /// Property: the cycle counter moves by at most one and never passes the budget
    #[test]
    fn cycle_budget_is_never_exceeded(
        max_cycles in 1u32..5,
        cycle in 0u32..5,
        state in state_strategy(),
        event in event_strategy(),
    ) {
        prop_assume!(cycle <= max_cycles);
        let machine = UnitStateMachine::new(max_cycles).unwrap();
        if let Ok(transition) = machine.apply(&UnitSnapshot::new(state, cycle), &event) {
            prop_assert!(transition.cycle <= max_cycles);
            prop_assert!(transition.cycle == cycle || transition.cycle == cycle + 1);
            if transition.forced {
                prop_assert!(transition.to.is_quarantined());
            }
        }
    }

    /// Property: audit events are reflexive wherever they are accepted
    #[test]
    fn audit_events_never_move_units(state in state_strategy(), event in event_strategy()) {
        prop_assume!(event.is_audit_only());
        let machine = UnitStateMachine::new(3).unwrap();
        if let Ok(transition) = machine.apply(&UnitSnapshot::new(state, 1), &event) {
            prop_assert_eq!(transition.to, state);
            prop_assert_eq!(transition.cycle, 1);
        }
    }
}
