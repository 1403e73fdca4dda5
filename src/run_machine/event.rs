//! External and internally-generated triggers consumed by `transition`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    /// A browser slot was reserved for this run (or admission denied and we
    /// stay `queued`, per `HasAvailableSlots`/`ReserveSlot`).
    Admitted { browser_id: String },
    AdmissionDenied,
    /// The reserved slot reached `ready` and the interpreter started.
    SlotReady,
    /// The reserved slot failed to initialize (launch timeout or driver
    /// error) before the interpreter could start.
    SlotFailed { reason: String },
    RunSucceeded {
        serializable_output: Option<Value>,
        binary_output_uri: Option<String>,
        log: String,
    },
    /// Carries whatever output the interpreter had already accumulated
    /// before the step that failed — §4.4 step 7's "if partial data
    /// exists, trigger integration pushes before finalizing".
    RunFailed {
        error_message: String,
        log: String,
        serializable_output: Option<Value>,
        binary_output_uri: Option<String>,
    },
    AbortRequested,
    AbortCompleted,
    /// Orphan recovery found this run `running` with no matching slot at
    /// startup — the only path that increments `retryCount`.
    Recover,
}
