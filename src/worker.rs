//! Execution worker — the piece that actually drives `run_machine`
//! transitions against the live ports (pool, queue, interpreter, record
//! store) and applies the effects each transition returns.
//!
//! Generalizes the teacher's `RuntimeManager`: one registered consumer per
//! discovered queue, a discovery loop that notices new per-user queues as
//! they're enqueued into, and a recovery pass that runs once at startup.

mod executor;
mod recovery;
mod registry;

pub use executor::{IntegrationSink, RunNotifier, RunWorker, WorkerError};
pub use recovery::recover_orphaned_runs;
pub use registry::QueueRegistry;

#[cfg(test)]
mod testing;
