//! Applies `run_machine` transitions against the live ports. One `RunWorker`
//! instance is shared (cheaply cloned) across the admission path, every
//! per-user queue consumer, and the startup recovery pass.

use crate::browser_driver::DriverError;
use crate::browser_pool::{BrowserPool, PoolError, SlotPurpose};
use crate::db::{Database, DbError, Run, RunStatus};
use crate::interpreter::{InterpretError, WorkflowInterpreter};
use crate::object_store;
use crate::queue::{abort_run_queue, execute_run_queue, Job, JobQueue, QueueError};
use crate::run_machine::{
    transition, Effect, Event, RunFsmState, TerminalOutcome, TransitionError,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("interpreter error: {0}")]
    Interpret(#[from] InterpretError),
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::ObjectStoreError),
    #[error("invalid run transition: {0}")]
    Transition(#[from] TransitionError),
    #[error("malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// User-facing run lifecycle notifications, pushed out over the
/// `/queued-run` namespace. Implemented for real by `ws::notify_ns`.
#[async_trait]
pub trait RunNotifier: Send + Sync {
    async fn run_scheduled(&self, run_id: &str);
    async fn run_started(&self, run_id: &str);
    async fn run_completed(&self, run_id: &str);
    async fn run_aborted(&self, run_id: &str);
    async fn run_recovered(&self, run_id: &str);
}

/// Fan-out to whatever downstream pipelines (record store, spreadsheet) the
/// robot is wired to. Implemented for real by `integrations::Dispatcher`.
#[async_trait]
pub trait IntegrationSink: Send + Sync {
    async fn enqueue_pushes(&self, run_id: &str);
}

#[derive(Deserialize)]
struct ExecutePayload {
    run_id: String,
    browser_id: String,
}

#[derive(Deserialize)]
struct AbortPayload {
    run_id: String,
}

/// Result of `request_abort`: whether the run was still queued (cancelled
/// inline) or running (teardown is in flight on the abort queue).
#[derive(Debug, Clone, Copy)]
pub struct AbortOutcome {
    pub is_queued: bool,
}

/// The run_id/user_id/browser_id an in-flight batch of effects needs —
/// carried alongside the `Vec<Effect>` so `apply_effects` never has to
/// re-fetch the row mid-transition.
struct EffectContext {
    run_id: String,
    user_id: String,
    browser_id: Option<String>,
}

#[derive(Clone)]
pub struct RunWorker {
    db: Database,
    pool: Arc<dyn BrowserPool>,
    queue: Arc<dyn JobQueue>,
    interpreter: Arc<dyn WorkflowInterpreter>,
    notifier: Arc<dyn RunNotifier>,
    integrations: Arc<dyn IntegrationSink>,
    abort_grace_period: Duration,
    browser_init_timeout: Duration,
    browser_pool_wait_timeout: Duration,
}

impl RunWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        pool: Arc<dyn BrowserPool>,
        queue: Arc<dyn JobQueue>,
        interpreter: Arc<dyn WorkflowInterpreter>,
        notifier: Arc<dyn RunNotifier>,
        integrations: Arc<dyn IntegrationSink>,
        abort_grace_period: Duration,
        browser_init_timeout: Duration,
        browser_pool_wait_timeout: Duration,
    ) -> Self {
        Self {
            db,
            pool,
            queue,
            interpreter,
            notifier,
            integrations,
            abort_grace_period,
            browser_init_timeout,
            browser_pool_wait_timeout,
        }
    }

    /// `StartRun`: create the row, try to admit it immediately, and either
    /// enqueue its execution or leave it queued for `ProcessQueuedRuns`.
    pub async fn start_run(
        &self,
        user_id: &str,
        robot_id: &str,
        origin: crate::db::RunOrigin,
    ) -> Result<String, WorkerError> {
        let run_id = crate::clock::Ids::run_id();
        let now = Utc::now();

        // Reserve before the row is written so a denied admission can carry
        // its placeholder browserId (spec §4.4 / scenario 2) from the very
        // first insert, rather than leaving the column null until a later
        // retry actually reserves a real slot.
        let (reservation, initial_browser_id) =
            match self.pool.reserve_slot(user_id, SlotPurpose::Run).await {
                Some(browser_id) => (Event::Admitted { browser_id: browser_id.clone() }, None),
                None => {
                    let placeholder = crate::clock::Ids::browser_id();
                    (Event::AdmissionDenied, Some(placeholder))
                }
            };

        let run = Run {
            id: run_id.clone(),
            robot_id: robot_id.to_string(),
            user_id: user_id.to_string(),
            status: RunStatus::Queued,
            browser_id: initial_browser_id,
            retry_count: 0,
            serializable_output: None,
            binary_output_uri: None,
            log: None,
            error_message: None,
            origin,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };
        self.db.create_run(&run)?;

        let result = transition(&RunFsmState::queued(), reservation)?;
        let browser_id = result.new_state.browser_id().map(str::to_string);
        let ctx = EffectContext {
            run_id: run_id.clone(),
            user_id: user_id.to_string(),
            browser_id: browser_id.clone(),
        };
        if let Err(e) = self.apply_effects(&ctx, result.effects).await {
            if let Some(browser_id) = browser_id {
                self.fail_admitted_run(&run_id, &browser_id, &e).await;
            }
            return Err(e);
        }
        Ok(run_id)
    }

    /// Drives `Event::SlotFailed` through the FSM and acks the job — shared
    /// by the bounded-launch and bounded-ready-wait failure paths in
    /// `execute_run`.
    async fn fail_running_slot(
        &self,
        run_id: &str,
        user_id: &str,
        browser_id: &str,
        running: &RunFsmState,
        reason: String,
        job_id: &str,
    ) -> Result<(), WorkerError> {
        let result = transition(running, Event::SlotFailed { reason })?;
        let ctx = EffectContext {
            run_id: run_id.to_string(),
            user_id: user_id.to_string(),
            browser_id: Some(browser_id.to_string()),
        };
        self.apply_effects(&ctx, result.effects).await?;
        self.queue.ack(job_id).await?;
        Ok(())
    }

    /// A slot was reserved and the run marked `running`, but a later effect
    /// in the same batch (typically `EnqueueExecute`) failed — per spec
    /// §4.4 step 2, the reservation must not be left dangling and the run
    /// must not be left phantom-`running`.
    async fn fail_admitted_run(&self, run_id: &str, browser_id: &str, error: &WorkerError) {
        self.pool.fail_slot(browser_id).await;
        if let Err(db_err) = self.db.finish_run(
            run_id,
            RunStatus::Failed,
            None,
            None,
            None,
            Some(&error.to_string()),
        ) {
            tracing::error!(
                run_id,
                browser_id,
                error = %db_err,
                "failed to persist compensating failure after admission error"
            );
        }
    }

    /// Re-attempt admission for a run that's sitting `queued` — called by
    /// the periodic `ProcessQueuedRuns` sweep once capacity may have freed.
    pub async fn retry_admission(&self, run_id: &str) -> Result<(), WorkerError> {
        let run = self.db.get_run(run_id)?;
        if run.status != RunStatus::Queued {
            return Ok(());
        }
        let event = match self.pool.reserve_slot(&run.user_id, SlotPurpose::Run).await {
            Some(browser_id) => Event::Admitted { browser_id },
            None => Event::AdmissionDenied,
        };
        let result = transition(&RunFsmState::Queued { retry_count: run.retry_count }, event)?;
        let browser_id = result.new_state.browser_id().map(str::to_string);
        let ctx = EffectContext {
            run_id: run_id.to_string(),
            user_id: run.user_id,
            browser_id: browser_id.clone(),
        };
        if let Err(e) = self.apply_effects(&ctx, result.effects).await {
            if let Some(browser_id) = browser_id {
                self.fail_admitted_run(run_id, &browser_id, &e).await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Consumes one `execute-run-user-*` job: upgrades the reserved slot to
    /// a live browser, runs the interpreter, and persists the outcome.
    pub async fn execute_run(&self, job: &Job) -> Result<(), WorkerError> {
        let payload: ExecutePayload = serde_json::from_value(job.payload.clone())?;
        let run = self.db.get_run(&payload.run_id)?;
        let robot = self.db.get_robot(&run.robot_id)?;

        let running = RunFsmState::Running {
            browser_id: payload.browser_id.clone(),
            retry_count: run.retry_count,
        };

        // §4.4 step 2: bound the launch itself, then separately bound the
        // wait for the slot to actually report `ready` — each by its own
        // configured timeout, rather than trusting `upgrade_slot` to return
        // promptly.
        let upgrade_outcome = tokio::time::timeout(
            self.browser_init_timeout,
            self.pool.upgrade_slot(&payload.browser_id),
        )
        .await;
        let upgrade_failure = match upgrade_outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("timed out waiting for browser to launch".to_string()),
        };
        if let Some(reason) = upgrade_failure {
            return self
                .fail_running_slot(&payload.run_id, &run.user_id, &payload.browser_id, &running, reason, &job.id)
                .await;
        }

        if let Err(e) = self
            .pool
            .wait_ready(&payload.browser_id, self.browser_pool_wait_timeout)
            .await
        {
            return self
                .fail_running_slot(
                    &payload.run_id,
                    &run.user_id,
                    &payload.browser_id,
                    &running,
                    e.to_string(),
                    &job.id,
                )
                .await;
        }

        let ready_result = transition(&running, Event::SlotReady)?;
        let ctx = EffectContext {
            run_id: payload.run_id.clone(),
            user_id: run.user_id.clone(),
            browser_id: Some(payload.browser_id.clone()),
        };
        self.apply_effects(&ctx, ready_result.effects).await?;

        let outcome = self
            .interpreter
            .interpret(&payload.run_id, &payload.browser_id, &robot.workflow)
            .await;
        let event = match outcome {
            crate::interpreter::InterpretOutcome::Success(output) => Event::RunSucceeded {
                serializable_output: output.serializable_output,
                binary_output_uri: output.binary_output_uri,
                log: output.log,
            },
            crate::interpreter::InterpretOutcome::Failed { error, partial } => Event::RunFailed {
                error_message: error.to_string(),
                log: partial.log,
                serializable_output: partial.serializable_output,
                binary_output_uri: partial.binary_output_uri,
            },
        };
        let result = transition(&running, event)?;
        let ctx = EffectContext {
            run_id: payload.run_id.clone(),
            user_id: run.user_id,
            browser_id: Some(payload.browser_id),
        };
        self.apply_effects(&ctx, result.effects).await?;
        self.queue.ack(&job.id).await?;
        Ok(())
    }

    /// `AbortRun(userId, runId)`: the REST-facing entry point. A queued run
    /// is cancelled in place (no browser was ever touched); a running one is
    /// just enqueued onto `abort-run-user-<userId>` and torn down by
    /// `abort_run` once that job is claimed.
    pub async fn request_abort(&self, user_id: &str, run_id: &str) -> Result<AbortOutcome, WorkerError> {
        let run = self.db.get_run(run_id)?;
        if run.user_id != user_id {
            return Err(WorkerError::Db(DbError::RunNotFound(run_id.to_string())));
        }

        match run.status {
            RunStatus::Queued => {
                let state = run_to_fsm_state(&run);
                let result = transition(&state, Event::AbortRequested)?;
                let ctx = EffectContext {
                    run_id: run_id.to_string(),
                    user_id: user_id.to_string(),
                    browser_id: run.browser_id.clone(),
                };
                self.apply_effects(&ctx, result.effects).await?;
                Ok(AbortOutcome { is_queued: true })
            }
            RunStatus::Running => {
                self.queue
                    .send(
                        &abort_run_queue(user_id),
                        serde_json::json!({ "run_id": run_id }),
                    )
                    .await?;
                Ok(AbortOutcome { is_queued: false })
            }
            RunStatus::Aborting => Err(WorkerError::Transition(TransitionError::InvalidEvent)),
            RunStatus::Success | RunStatus::Failed | RunStatus::Aborted => {
                Err(WorkerError::Transition(TransitionError::AlreadyTerminal))
            }
        }
    }

    /// Consumes one `abort-run-user-*` job. A queued run is cancelled
    /// outright; a running one is moved to `aborting` and torn down inline
    /// (there's no separate async unwind stage to wait on once the slot is
    /// ours to destroy).
    pub async fn abort_run(&self, job: &Job) -> Result<(), WorkerError> {
        let payload: AbortPayload = serde_json::from_value(job.payload.clone())?;
        let run = self.db.get_run(&payload.run_id)?;
        let state = run_to_fsm_state(&run);

        let result = match transition(&state, Event::AbortRequested) {
            Ok(r) => r,
            Err(TransitionError::AlreadyTerminal) => {
                self.queue.ack(&job.id).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let ctx = EffectContext {
            run_id: payload.run_id.clone(),
            user_id: run.user_id.clone(),
            browser_id: result
                .new_state
                .browser_id()
                .map(str::to_string)
                .or_else(|| run.browser_id.clone()),
        };
        self.apply_effects(&ctx, result.effects).await?;

        if let RunFsmState::Aborting { browser_id, .. } = &result.new_state {
            // Give the interpreter a moment to unwind before the slot is
            // torn out from under it.
            tokio::time::sleep(self.abort_grace_period).await;
            self.pool.destroy_slot(browser_id).await;
            let completed = transition(&result.new_state, Event::AbortCompleted)?;
            let ctx = EffectContext {
                run_id: payload.run_id.clone(),
                user_id: run.user_id,
                browser_id: Some(browser_id.clone()),
            };
            self.apply_effects(&ctx, completed.effects).await?;
        }

        self.queue.ack(&job.id).await?;
        Ok(())
    }

    pub(super) async fn apply_effects(
        &self,
        ctx: &EffectContext,
        effects: Vec<Effect>,
    ) -> Result<(), WorkerError> {
        for effect in effects {
            match effect {
                Effect::PersistStatus(status) => {
                    self.db.update_run_status(&ctx.run_id, status)?;
                }
                Effect::PersistBrowserId(browser_id) => {
                    self.db.set_run_browser(&ctx.run_id, &browser_id)?;
                }
                Effect::PersistTerminal {
                    status,
                    serializable_output,
                    binary_output_uri,
                    log,
                    error_message,
                } => {
                    self.db.finish_run(
                        &ctx.run_id,
                        status,
                        serializable_output.as_ref(),
                        binary_output_uri.as_deref(),
                        log.as_deref(),
                        error_message.as_deref(),
                    )?;
                }
                Effect::IncrementRetryCount => {
                    self.db.increment_retry_count(&ctx.run_id)?;
                }
                Effect::EnqueueExecute { browser_id } => {
                    self.queue
                        .send(
                            &execute_run_queue(&ctx.user_id),
                            serde_json::json!({ "run_id": ctx.run_id, "browser_id": browser_id }),
                        )
                        .await?;
                }
                Effect::EnqueueAbort => {
                    // `abort_run` drives `AbortRequested` and the teardown
                    // that follows it in the same call, so there is no
                    // second hop to enqueue here. Kept as a distinct effect
                    // to mirror the transition table 1:1.
                    let _ = abort_run_queue(&ctx.user_id);
                }
                Effect::DestroySlot => {
                    if let Some(browser_id) = &ctx.browser_id {
                        self.pool.destroy_slot(browser_id).await;
                    }
                }
                Effect::EnqueueIntegrationPushes => {
                    self.integrations.enqueue_pushes(&ctx.run_id).await;
                }
                Effect::NotifyRunScheduled => self.notifier.run_scheduled(&ctx.run_id).await,
                Effect::NotifyRunStarted => self.notifier.run_started(&ctx.run_id).await,
                Effect::NotifyRunCompleted => self.notifier.run_completed(&ctx.run_id).await,
                Effect::NotifyRunAborted => self.notifier.run_aborted(&ctx.run_id).await,
                Effect::NotifyRunRecovered => self.notifier.run_recovered(&ctx.run_id).await,
            }
        }
        Ok(())
    }

    /// Entry point for `recovery::recover_orphaned_runs`, which builds its
    /// `EffectContext` from a `Run` row rather than an in-flight job.
    pub(super) async fn apply_effects_for_recovery(
        &self,
        run_id: &str,
        user_id: &str,
        browser_id: Option<String>,
        effects: Vec<Effect>,
    ) -> Result<(), WorkerError> {
        let ctx = EffectContext {
            run_id: run_id.to_string(),
            user_id: user_id.to_string(),
            browser_id,
        };
        self.apply_effects(&ctx, effects).await
    }

    pub(super) fn db(&self) -> &Database {
        &self.db
    }

    pub(super) fn pool(&self) -> &Arc<dyn BrowserPool> {
        &self.pool
    }
}

pub(super) fn run_to_fsm_state(run: &Run) -> RunFsmState {
    match run.status {
        RunStatus::Queued => RunFsmState::Queued {
            retry_count: run.retry_count,
        },
        RunStatus::Running => RunFsmState::Running {
            browser_id: run.browser_id.clone().unwrap_or_default(),
            retry_count: run.retry_count,
        },
        RunStatus::Aborting => RunFsmState::Aborting {
            browser_id: run.browser_id.clone().unwrap_or_default(),
            retry_count: run.retry_count,
        },
        RunStatus::Success => RunFsmState::Terminal {
            outcome: TerminalOutcome::Success,
            retry_count: run.retry_count,
        },
        RunStatus::Failed => RunFsmState::Terminal {
            outcome: TerminalOutcome::Failed,
            retry_count: run.retry_count,
        },
        RunStatus::Aborted => RunFsmState::Terminal {
            outcome: TerminalOutcome::Aborted,
            retry_count: run.retry_count,
        },
    }
}
