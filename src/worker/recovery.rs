//! Orphan recovery — the startup pass that reconciles `runs` rows still
//! marked `running` against a browser pool that, after a restart, has no
//! memory of any of them.

use super::executor::{run_to_fsm_state, RunWorker, WorkerError};
use crate::run_machine::{transition, Event};

/// Feeds `Event::Recover` through every run the record store still thinks
/// is `running`. Each either requeues (under the retry budget) or is
/// marked `failed` with "Max retries exceeded" — never silently dropped.
pub async fn recover_orphaned_runs(worker: &RunWorker) -> Result<usize, WorkerError> {
    let mut recovered = 0;
    for run in worker.db().list_running_runs()? {
        let slot_alive = match &run.browser_id {
            Some(browser_id) => worker.pool().get_slot(browser_id).await.is_some(),
            None => false,
        };
        if slot_alive {
            continue;
        }

        let state = run_to_fsm_state(&run);
        let Ok(result) = transition(&state, Event::Recover) else {
            continue;
        };
        tracing::warn!(run_id = %run.id, "recovering orphaned run");
        worker
            .apply_effects_for_recovery(&run.id, &run.user_id, run.browser_id.clone(), result.effects)
            .await?;
        recovered += 1;
    }
    Ok(recovered)
}
