//! Integration dispatcher — fans a finished run's output out to whatever
//! downstream pipelines a robot is wired to (record store sync, spreadsheet
//! append). One in-memory task per `(run_id, pipeline)`, retried on a fixed
//! tick up to a bounded wall-clock budget, mirroring the teacher's
//! `RuntimeManager` style of owning a `Mutex<HashMap<...>>` of task state
//! behind a handle that's cheap to clone into spawned tasks.

use crate::db::Database;
use crate::worker::IntegrationSink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const PUSH_TICK: Duration = Duration::from_secs(5);
const MAX_TASK_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    RecordStore,
    Spreadsheet,
}

impl Pipeline {
    const ALL: [Pipeline; 2] = [Pipeline::RecordStore, Pipeline::Spreadsheet];

    fn label(self) -> &'static str {
        match self {
            Pipeline::RecordStore => "record_store",
            Pipeline::Spreadsheet => "spreadsheet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskState {
    pub pipeline: Pipeline,
    pub status: TaskStatus,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
}

/// One named-interface collaborator per pipeline: given a run's output,
/// attempt to push it and report whether the attempt succeeded. Real
/// implementations live outside this module's scope (REST calls to a
/// customer's record store, a spreadsheet API) — this port is enough for
/// the dispatcher to drive retries uniformly.
/// What a pipeline push carries about the run's output, beyond the run id
/// itself — resolves the spec's Open Question on `extractedItemsCount`:
/// this crate counts rows in `serializable_output` (the distilled schema's
/// single scrape-result array) rather than the original's two-path
/// schema-vs-schema+list split, and always sends `partial_data_extracted`
/// so a failed-with-partial-data push is distinguishable from a clean one.
#[derive(Debug, Clone, Copy)]
pub struct PushContext {
    pub extracted_items_count: usize,
    pub partial_data_extracted: bool,
}

#[async_trait]
pub trait PipelinePusher: Send + Sync {
    async fn push(&self, run_id: &str, pipeline: Pipeline, ctx: PushContext) -> Result<(), String>;
}

pub struct Dispatcher {
    db: Database,
    pusher: Arc<dyn PipelinePusher>,
    tasks: Arc<Mutex<HashMap<(String, &'static str), TaskState>>>,
}

impl Dispatcher {
    pub fn new(db: Database, pusher: Arc<dyn PipelinePusher>) -> Arc<Self> {
        Arc::new(Self {
            db,
            pusher,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn snapshot(&self, run_id: &str) -> Vec<TaskState> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|((id, _), _)| id == run_id)
            .map(|(_, state)| state.clone())
            .collect()
    }

    async fn drive_pipeline(
        db: Database,
        pusher: Arc<dyn PipelinePusher>,
        tasks: Arc<Mutex<HashMap<(String, &'static str), TaskState>>>,
        run_id: String,
        pipeline: Pipeline,
    ) {
        let key = (run_id.clone(), pipeline.label());
        {
            let mut tasks = tasks.lock().await;
            tasks.insert(
                key.clone(),
                TaskState {
                    pipeline,
                    status: TaskStatus::Pending,
                    attempts: 0,
                    started_at: Utc::now(),
                },
            );
        }

        // The robot row itself has already been deleted in some failure
        // scenarios (spec allows deleting a robot independently of its run
        // history); a missing robot is not worth retrying over.
        let Ok(run) = db.get_run(&run_id) else {
            let mut tasks = tasks.lock().await;
            if let Some(state) = tasks.get_mut(&key) {
                state.status = TaskStatus::Failed;
            }
            return;
        };
        let ctx = PushContext {
            extracted_items_count: run
                .serializable_output
                .as_ref()
                .and_then(|v| v.as_array())
                .map_or(0, Vec::len),
            partial_data_extracted: run.status == crate::db::RunStatus::Failed
                && run.serializable_output.is_some(),
        };

        let deadline = tokio::time::Instant::now() + MAX_TASK_DURATION;
        loop {
            let attempt_result = pusher.push(&run_id, pipeline, ctx).await;
            let mut guard = tasks.lock().await;
            let Some(state) = guard.get_mut(&key) else {
                return;
            };
            state.attempts += 1;
            match attempt_result {
                Ok(()) => {
                    state.status = TaskStatus::Succeeded;
                    return;
                }
                Err(reason) => {
                    tracing::warn!(run_id = %run_id, pipeline = pipeline.label(), attempt = state.attempts, %reason, "integration push failed");
                    if tokio::time::Instant::now() >= deadline {
                        state.status = TaskStatus::Failed;
                        return;
                    }
                }
            }
            drop(guard);
            tokio::time::sleep(PUSH_TICK).await;
        }
    }
}

#[async_trait]
impl IntegrationSink for Dispatcher {
    async fn enqueue_pushes(&self, run_id: &str) {
        for pipeline in Pipeline::ALL {
            let db = self.db.clone();
            let pusher = self.pusher.clone();
            let tasks = self.tasks.clone();
            let run_id = run_id.to_string();
            tokio::spawn(Dispatcher::drive_pipeline(db, pusher, tasks, run_id, pipeline));
        }
    }
}

/// Pushes a finished run's output to `{base_url}/{pipeline}/{run_id}` over
/// HTTP. With no `base_url` configured there are no downstream pipelines
/// wired up, so every push trivially succeeds.
pub struct HttpPipelinePusher {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpPipelinePusher {
    pub fn new(base_url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }
}

#[async_trait]
impl PipelinePusher for HttpPipelinePusher {
    async fn push(&self, run_id: &str, pipeline: Pipeline, ctx: PushContext) -> Result<(), String> {
        let Some(base_url) = &self.base_url else {
            tracing::debug!(run_id, pipeline = pipeline.label(), "no integration webhook configured, skipping push");
            return Ok(());
        };
        let url = format!("{base_url}/{}/{run_id}", pipeline.label());
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "run_id": run_id,
                "pipeline": pipeline.label(),
                "extracted_items_count": ctx.extracted_items_count,
                "partial_data_extracted": ctx.partial_data_extracted,
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("integration endpoint returned {}", response.status()))
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct FakePusher {
        pub fail_first_n: StdMutex<HashMap<&'static str, u32>>,
        pub calls: StdMutex<Vec<(String, &'static str)>>,
    }

    impl FakePusher {
        pub fn fail_first(&self, pipeline: Pipeline, n: u32) {
            self.fail_first_n.lock().unwrap().insert(pipeline.label(), n);
        }
    }

    #[async_trait]
    impl PipelinePusher for FakePusher {
        async fn push(&self, run_id: &str, pipeline: Pipeline, _ctx: PushContext) -> Result<(), String> {
            self.calls
                .lock()
                .unwrap()
                .push((run_id.to_string(), pipeline.label()));
            let mut remaining = self.fail_first_n.lock().unwrap();
            let entry = remaining.entry(pipeline.label()).or_insert(0);
            if *entry > 0 {
                *entry -= 1;
                return Err("forced failure".to_string());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakePusher;
    use super::*;
    use crate::db::{RecordingMeta, Robot, RunStatus, Workflow};

    fn sample_db_with_run(run_id: &str) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user("user-1", 2).unwrap();
        let now = Utc::now();
        db.create_robot(&Robot {
            id: "robot-1".to_string(),
            user_id: "user-1".to_string(),
            name: "flow".to_string(),
            recording_meta: RecordingMeta::default(),
            workflow: Workflow::default(),
            schedule: None,
            created_at: now,
            updated_at: now,
        })
        .unwrap();
        db.create_run(&crate::db::Run {
            id: run_id.to_string(),
            robot_id: "robot-1".to_string(),
            user_id: "user-1".to_string(),
            status: RunStatus::Success,
            browser_id: None,
            retry_count: 0,
            serializable_output: None,
            binary_output_uri: None,
            log: None,
            error_message: None,
            origin: crate::db::RunOrigin::RunByUserId,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        })
        .unwrap();
        db
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_within_budget() {
        let db = sample_db_with_run("run-1");
        let pusher = Arc::new(FakePusher::default());
        pusher.fail_first(Pipeline::RecordStore, 2);
        let dispatcher = Dispatcher::new(db, pusher.clone());

        Dispatcher::drive_pipeline(
            dispatcher.db.clone(),
            pusher.clone(),
            dispatcher.tasks.clone(),
            "run-1".to_string(),
            Pipeline::RecordStore,
        )
        .await;

        let snapshot = dispatcher.snapshot("run-1").await;
        let state = snapshot
            .iter()
            .find(|s| s.pipeline == Pipeline::RecordStore)
            .unwrap();
        assert_eq!(state.status, TaskStatus::Succeeded);
        assert_eq!(state.attempts, 3);
    }

    #[tokio::test]
    async fn missing_run_fails_immediately_without_calling_the_pusher() {
        let db = Database::open_in_memory().unwrap();
        let pusher = Arc::new(FakePusher::default());
        let dispatcher = Dispatcher::new(db, pusher.clone());

        Dispatcher::drive_pipeline(
            dispatcher.db.clone(),
            pusher.clone(),
            dispatcher.tasks.clone(),
            "missing-run".to_string(),
            Pipeline::Spreadsheet,
        )
        .await;

        assert!(pusher.calls.lock().unwrap().is_empty());
        let snapshot = dispatcher.snapshot("missing-run").await;
        assert_eq!(snapshot[0].status, TaskStatus::Failed);
    }
}
