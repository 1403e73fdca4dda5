//! The pure transition function. No I/O, no clock reads — every timestamp
//! or side effect the caller needs is expressed as an `Effect` for the
//! worker's executor to perform.

use super::effect::Effect;
use super::event::Event;
use super::state::{RunFsmState, TerminalOutcome};
use crate::db::RunStatus;
use thiserror::Error;

pub const MAX_RETRY_ATTEMPTS: u32 = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("run is already in a terminal state")]
    AlreadyTerminal,
    #[error("event not valid in the current state")]
    InvalidEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    pub new_state: RunFsmState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    fn new(new_state: RunFsmState, effects: Vec<Effect>) -> Self {
        Self { new_state, effects }
    }
}

pub fn transition(
    state: &RunFsmState,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    if state.is_terminal() {
        // Orphan recovery never revisits a terminal run, and every other
        // event arriving after a terminal write is a stale retry — both
        // are no-ops, never an upgrade back to a working state.
        return Err(TransitionError::AlreadyTerminal);
    }

    match (state, event) {
        (RunFsmState::Queued { retry_count }, Event::Admitted { browser_id }) => {
            Ok(TransitionResult::new(
                RunFsmState::Running {
                    browser_id: browser_id.clone(),
                    retry_count: *retry_count,
                },
                vec![
                    Effect::PersistBrowserId(browser_id.clone()),
                    Effect::PersistStatus(RunStatus::Running),
                    Effect::EnqueueExecute { browser_id },
                ],
            ))
        }

        (RunFsmState::Queued { retry_count }, Event::AdmissionDenied) => {
            Ok(TransitionResult::new(
                RunFsmState::Queued {
                    retry_count: *retry_count,
                },
                vec![Effect::persist_queued(), Effect::NotifyRunScheduled],
            ))
        }

        (RunFsmState::Queued { .. }, Event::AbortRequested) => Ok(TransitionResult::new(
            RunFsmState::Terminal {
                outcome: TerminalOutcome::Aborted,
                retry_count: state.retry_count(),
            },
            vec![
                Effect::PersistTerminal {
                    status: RunStatus::Aborted,
                    serializable_output: None,
                    binary_output_uri: None,
                    log: Some("Run aborted while queued".to_string()),
                    error_message: None,
                },
                Effect::NotifyRunAborted,
            ],
        )),

        (RunFsmState::Running { browser_id, retry_count }, Event::SlotReady) => {
            Ok(TransitionResult::new(
                RunFsmState::Running {
                    browser_id: browser_id.clone(),
                    retry_count: *retry_count,
                },
                vec![Effect::NotifyRunStarted],
            ))
        }

        (RunFsmState::Running { retry_count, .. }, Event::RunSucceeded {
            serializable_output,
            binary_output_uri,
            log,
        }) => Ok(TransitionResult::new(
            RunFsmState::Terminal {
                outcome: TerminalOutcome::Success,
                retry_count: *retry_count,
            },
            vec![
                Effect::PersistTerminal {
                    status: RunStatus::Success,
                    serializable_output,
                    binary_output_uri,
                    log: Some(log),
                    error_message: None,
                },
                Effect::DestroySlot,
                Effect::EnqueueIntegrationPushes,
                Effect::NotifyRunCompleted,
            ],
        )),

        (
            RunFsmState::Running { retry_count, .. },
            Event::RunFailed {
                error_message,
                log,
                serializable_output,
                binary_output_uri,
            },
        ) => {
            let has_partial_data = serializable_output.is_some() || binary_output_uri.is_some();
            let mut effects = vec![
                Effect::PersistTerminal {
                    status: RunStatus::Failed,
                    serializable_output,
                    binary_output_uri,
                    log: Some(log),
                    error_message: Some(error_message),
                },
                Effect::DestroySlot,
            ];
            // PartialFailure (§7): partial output still gets pushed
            // downstream even though the run itself ends `failed`.
            if has_partial_data {
                effects.push(Effect::EnqueueIntegrationPushes);
            }
            effects.push(Effect::NotifyRunCompleted);
            Ok(TransitionResult::new(
                RunFsmState::Terminal {
                    outcome: TerminalOutcome::Failed,
                    retry_count: *retry_count,
                },
                effects,
            ))
        }

        (RunFsmState::Running { retry_count, .. }, Event::SlotFailed { reason }) => {
            Ok(TransitionResult::new(
                RunFsmState::Terminal {
                    outcome: TerminalOutcome::Failed,
                    retry_count: *retry_count,
                },
                vec![
                    Effect::PersistTerminal {
                        status: RunStatus::Failed,
                        serializable_output: None,
                        binary_output_uri: None,
                        log: None,
                        error_message: Some(reason),
                    },
                    Effect::DestroySlot,
                    Effect::NotifyRunCompleted,
                ],
            ))
        }

        (RunFsmState::Running { browser_id, retry_count }, Event::AbortRequested) => {
            Ok(TransitionResult::new(
                RunFsmState::Aborting {
                    browser_id: browser_id.clone(),
                    retry_count: *retry_count,
                },
                vec![Effect::PersistStatus(RunStatus::Aborting), Effect::EnqueueAbort],
            ))
        }

        (RunFsmState::Aborting { retry_count, .. }, Event::AbortCompleted) => {
            Ok(TransitionResult::new(
                RunFsmState::Terminal {
                    outcome: TerminalOutcome::Aborted,
                    retry_count: *retry_count,
                },
                vec![
                    Effect::PersistTerminal {
                        status: RunStatus::Aborted,
                        serializable_output: None,
                        binary_output_uri: None,
                        log: Some("Run aborted by user".to_string()),
                        error_message: None,
                    },
                    Effect::DestroySlot,
                    Effect::EnqueueIntegrationPushes,
                    Effect::NotifyRunAborted,
                ],
            ))
        }

        // Orphan recovery: only this arm increments retryCount, per the
        // Open Question resolution in DESIGN.md.
        (RunFsmState::Running { retry_count, .. }, Event::Recover)
        | (RunFsmState::Queued { retry_count }, Event::Recover) => {
            let next_retry = retry_count + 1;
            if next_retry <= MAX_RETRY_ATTEMPTS {
                Ok(TransitionResult::new(
                    RunFsmState::Queued {
                        retry_count: next_retry,
                    },
                    vec![
                        Effect::IncrementRetryCount,
                        Effect::PersistStatus(RunStatus::Queued),
                        Effect::NotifyRunRecovered,
                    ],
                ))
            } else {
                Ok(TransitionResult::new(
                    RunFsmState::Terminal {
                        outcome: TerminalOutcome::Failed,
                        retry_count: next_retry,
                    },
                    vec![
                        Effect::IncrementRetryCount,
                        Effect::PersistTerminal {
                            status: RunStatus::Failed,
                            serializable_output: None,
                            binary_output_uri: None,
                            log: None,
                            error_message: Some("Max retries exceeded".to_string()),
                        },
                        Effect::NotifyRunRecovered,
                    ],
                ))
            }
        }

        _ => Err(TransitionError::InvalidEvent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_moves_queued_to_running_and_enqueues_execute() {
        let state = RunFsmState::queued();
        let result = transition(
            &state,
            Event::Admitted {
                browser_id: "browser-1".to_string(),
            },
        )
        .unwrap();
        assert!(matches!(result.new_state, RunFsmState::Running { .. }));
        assert!(result
            .effects
            .contains(&Effect::EnqueueExecute { browser_id: "browser-1".to_string() }));
    }

    #[test]
    fn abort_while_queued_skips_browser_entirely() {
        let state = RunFsmState::queued();
        let result = transition(&state, Event::AbortRequested).unwrap();
        assert!(matches!(
            result.new_state,
            RunFsmState::Terminal {
                outcome: TerminalOutcome::Aborted,
                ..
            }
        ));
        assert!(!result.effects.contains(&Effect::DestroySlot));
    }

    #[test]
    fn terminal_state_rejects_every_event() {
        let state = RunFsmState::Terminal {
            outcome: TerminalOutcome::Success,
            retry_count: 0,
        };
        let result = transition(&state, Event::AbortRequested);
        assert_eq!(result.unwrap_err(), TransitionError::AlreadyTerminal);
    }

    #[test]
    fn recovery_increments_retry_and_requeues_under_budget() {
        let state = RunFsmState::Running {
            browser_id: "browser-1".to_string(),
            retry_count: 0,
        };
        let result = transition(&state, Event::Recover).unwrap();
        assert_eq!(result.new_state.retry_count(), 1);
        assert!(matches!(result.new_state, RunFsmState::Queued { .. }));
    }

    #[test]
    fn recovery_fails_run_once_retry_budget_exhausted() {
        let state = RunFsmState::Running {
            browser_id: "browser-1".to_string(),
            retry_count: MAX_RETRY_ATTEMPTS,
        };
        let result = transition(&state, Event::Recover).unwrap();
        assert!(matches!(
            result.new_state,
            RunFsmState::Terminal {
                outcome: TerminalOutcome::Failed,
                ..
            }
        ));
    }
}
