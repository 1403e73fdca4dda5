//! The Run state machine's in-memory state shape — the same information
//! `db::RunStatus` persists, but carrying the data each state needs
//! (`browserId`, retry budget) so `transition` never has to consult the
//! record store to decide what happens next.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TerminalOutcome {
    Success,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RunFsmState {
    /// Admitted but no slot reserved yet, or reservation denied and waiting
    /// for `ProcessQueuedRuns` to free one up.
    Queued { retry_count: u32 },
    /// Slot reserved; `browserId` may still be `initializing`.
    Running {
        browser_id: String,
        retry_count: u32,
    },
    /// Abort requested while running; waiting on the driver to unwind.
    Aborting {
        browser_id: String,
        retry_count: u32,
    },
    Terminal {
        outcome: TerminalOutcome,
        retry_count: u32,
    },
}

impl RunFsmState {
    pub fn queued() -> Self {
        RunFsmState::Queued { retry_count: 0 }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            RunFsmState::Queued { retry_count }
            | RunFsmState::Running { retry_count, .. }
            | RunFsmState::Aborting { retry_count, .. }
            | RunFsmState::Terminal { retry_count, .. } => *retry_count,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunFsmState::Terminal { .. })
    }

    pub fn browser_id(&self) -> Option<&str> {
        match self {
            RunFsmState::Running { browser_id, .. } | RunFsmState::Aborting { browser_id, .. } => {
                Some(browser_id)
            }
            _ => None,
        }
    }
}
