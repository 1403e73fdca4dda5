//! Property tests for the run state machine's structural invariants —
//! terminal-state stickiness and retry-count monotonicity hold for every
//! reachable state, not just the handful of unit-tested sequences.

use super::effect::Effect;
use super::event::Event;
use super::state::{RunFsmState, TerminalOutcome};
use super::transition::{transition, MAX_RETRY_ATTEMPTS};
use proptest::prelude::*;

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        Just(Event::Admitted {
            browser_id: "browser-x".to_string()
        }),
        Just(Event::AdmissionDenied),
        Just(Event::SlotReady),
        Just(Event::RunSucceeded {
            serializable_output: None,
            binary_output_uri: None,
            log: String::new()
        }),
        Just(Event::RunFailed {
            error_message: "boom".to_string(),
            log: String::new(),
            serializable_output: None,
            binary_output_uri: None,
        }),
        Just(Event::SlotFailed {
            reason: "timeout".to_string()
        }),
        Just(Event::AbortRequested),
        Just(Event::AbortCompleted),
        Just(Event::Recover),
    ]
}

fn arb_state() -> impl Strategy<Value = RunFsmState> {
    prop_oneof![
        (0u32..5).prop_map(|rc| RunFsmState::Queued { retry_count: rc }),
        (0u32..5).prop_map(|rc| RunFsmState::Running {
            browser_id: "browser-x".to_string(),
            retry_count: rc
        }),
        (0u32..5).prop_map(|rc| RunFsmState::Aborting {
            browser_id: "browser-x".to_string(),
            retry_count: rc
        }),
        (0u32..5).prop_map(|rc| RunFsmState::Terminal {
            outcome: TerminalOutcome::Success,
            retry_count: rc
        }),
    ]
}

proptest! {
    #[test]
    fn terminal_states_never_transition(state in arb_state(), event in arb_event()) {
        if state.is_terminal() {
            prop_assert!(transition(&state, event).is_err());
        }
    }

    #[test]
    fn retry_count_never_decreases(state in arb_state(), event in arb_event()) {
        if let Ok(result) = transition(&state, event) {
            prop_assert!(result.new_state.retry_count() >= state.retry_count());
        }
    }

    #[test]
    fn retry_count_stays_within_budget_plus_one(state in arb_state(), event in arb_event()) {
        if let Ok(result) = transition(&state, event) {
            prop_assert!(result.new_state.retry_count() <= MAX_RETRY_ATTEMPTS + 1);
        }
    }

    #[test]
    fn only_recover_increments_retry_count(state in arb_state(), event in arb_event()) {
        if let Ok(result) = transition(&state, event.clone()) {
            if !matches!(event, Event::Recover) {
                prop_assert_eq!(result.new_state.retry_count(), state.retry_count());
            }
        }
    }

    #[test]
    fn destroy_slot_only_follows_a_run_that_held_a_browser(state in arb_state(), event in arb_event()) {
        if let Ok(result) = transition(&state, event) {
            if result.effects.contains(&Effect::DestroySlot) {
                prop_assert!(state.browser_id().is_some());
            }
        }
    }
}
