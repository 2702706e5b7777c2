//! Run state machine
//!
//! ```text
//! PENDING -> ACTIVE -> WAITING_ACK -> ESCALATED -> ACTIVE ...
//!                          |              |
//!                          v              v
//!                      RESOLVED       EXHAUSTED
//! ```
//!
//! Any live state may move to `RESOLVED` (acknowledge or close) or
//! `ABORTED`. Terminal states have no outgoing transitions.

use iris_core::{RunState, StateMachineError};

/// Validate a transition
///
/// With the `strict-debug` feature an illegal transition panics, which
/// surfaces engine bugs in test runs.
///
/// # Errors
/// `StateMachineError::IllegalTransition` when `to` is not reachable from `from`
pub fn validate_transition(from: RunState, to: RunState) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("illegal run transition attempted: {from} -> {to}");

        #[cfg(not(feature = "strict-debug"))]
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one transition
#[must_use]
pub fn allowed_transitions(from: RunState) -> &'static [RunState] {
    use RunState::{Aborted, Active, Escalated, Exhausted, Pending, Resolved, WaitingAck};
    match from {
        Pending => &[Active, Resolved, Aborted],
        Active => &[WaitingAck, Resolved, Aborted],
        WaitingAck => &[Escalated, Resolved, Aborted],
        Escalated => &[Active, Exhausted, Resolved, Aborted],
        Resolved | Exhausted | Aborted => &[],
    }
}

fn allowed(from: RunState, to: RunState) -> bool {
    allowed_transitions(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [RunState; 7] = [
        RunState::Pending,
        RunState::Active,
        RunState::WaitingAck,
        RunState::Escalated,
        RunState::Resolved,
        RunState::Exhausted,
        RunState::Aborted,
    ];

    #[test]
    fn happy_path_is_legal() {
        for (from, to) in [
            (RunState::Pending, RunState::Active),
            (RunState::Active, RunState::WaitingAck),
            (RunState::WaitingAck, RunState::Escalated),
            (RunState::Escalated, RunState::Active),
            (RunState::Escalated, RunState::Exhausted),
            (RunState::WaitingAck, RunState::Resolved),
        ] {
            assert!(validate_transition(from, to).is_ok(), "{from} -> {to}");
        }
    }

    #[test]
    fn cannot_skip_waiting() {
        assert!(validate_transition(RunState::Active, RunState::Escalated).is_err());
        assert!(validate_transition(RunState::Pending, RunState::WaitingAck).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(allowed_transitions(from).is_empty());
        }
    }

    fn state() -> impl Strategy<Value = RunState> {
        proptest::sample::select(ALL.to_vec())
    }

    proptest! {
        #[test]
        fn validation_matches_table(from in state(), to in state()) {
            let result = validate_transition(from, to);
            prop_assert_eq!(result.is_ok(), allowed_transitions(from).contains(&to));
        }

        #[test]
        fn every_live_state_can_abort(from in state()) {
            if !from.is_terminal() {
                prop_assert!(validate_transition(from, RunState::Aborted).is_ok());
                prop_assert!(validate_transition(from, RunState::Resolved).is_ok());
            }
        }
    }
}
