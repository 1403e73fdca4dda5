//! Side-effecting instructions the pure `transition` function emits; the
//! worker's executor (see `worker::executor`) is the only place these are
//! actually performed.

use crate::db::RunStatus;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PersistStatus(RunStatus),
    PersistBrowserId(String),
    PersistTerminal {
        status: RunStatus,
        serializable_output: Option<Value>,
        binary_output_uri: Option<String>,
        log: Option<String>,
        error_message: Option<String>,
    },
    IncrementRetryCount,
    EnqueueExecute {
        browser_id: String,
    },
    EnqueueAbort,
    DestroySlot,
    EnqueueIntegrationPushes,
    NotifyRunScheduled,
    NotifyRunStarted,
    NotifyRunCompleted,
    NotifyRunAborted,
    NotifyRunRecovered,
}

impl Effect {
    pub fn persist_queued() -> Self {
        Effect::PersistStatus(RunStatus::Queued)
    }
}
