use super::executor::{IntegrationSink, RunNotifier, RunWorker};
use crate::browser_pool::testing::FakeBrowserPool;
use crate::db::{Database, Robot, RunOrigin, RunStatus, Workflow};
use crate::interpreter::testing::FakeInterpreter;
use crate::queue::testing::FakeJobQueue;
use crate::queue::{abort_run_queue, execute_run_queue};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<(&'static str, String)>>,
}

#[async_trait]
impl RunNotifier for RecordingNotifier {
    async fn run_scheduled(&self, run_id: &str) {
        self.events.lock().unwrap().push(("scheduled", run_id.to_string()));
    }
    async fn run_started(&self, run_id: &str) {
        self.events.lock().unwrap().push(("started", run_id.to_string()));
    }
    async fn run_completed(&self, run_id: &str) {
        self.events.lock().unwrap().push(("completed", run_id.to_string()));
    }
    async fn run_aborted(&self, run_id: &str) {
        self.events.lock().unwrap().push(("aborted", run_id.to_string()));
    }
    async fn run_recovered(&self, run_id: &str) {
        self.events.lock().unwrap().push(("recovered", run_id.to_string()));
    }
}

#[derive(Default)]
struct RecordingIntegrationSink {
    pushes: Mutex<Vec<String>>,
}

#[async_trait]
impl IntegrationSink for RecordingIntegrationSink {
    async fn enqueue_pushes(&self, run_id: &str) {
        self.pushes.lock().unwrap().push(run_id.to_string());
    }
}

struct Harness {
    worker: RunWorker,
    db: Database,
    queue: Arc<FakeJobQueue>,
    notifier: Arc<RecordingNotifier>,
    integrations: Arc<RecordingIntegrationSink>,
    interpreter: Arc<FakeInterpreter>,
}

fn harness(max_slots_per_user: u32) -> Harness {
    let db = Database::open_in_memory().unwrap();
    db.upsert_user("user-1", max_slots_per_user).unwrap();
    db.create_robot(&Robot {
        id: "robot-1".to_string(),
        user_id: "user-1".to_string(),
        name: "checkout flow".to_string(),
        recording_meta: Default::default(),
        workflow: Workflow { steps: vec![] },
        schedule: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    })
    .unwrap();

    let pool = FakeBrowserPool::new(max_slots_per_user);
    let queue = FakeJobQueue::new();
    let interpreter = Arc::new(FakeInterpreter::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let integrations = Arc::new(RecordingIntegrationSink::default());

    let worker = RunWorker::new(
        db.clone(),
        pool,
        queue.clone(),
        interpreter.clone(),
        notifier.clone(),
        integrations.clone(),
        std::time::Duration::from_millis(0),
        std::time::Duration::from_secs(45),
        std::time::Duration::from_secs(60),
    );

    Harness {
        worker,
        db,
        queue,
        notifier,
        integrations,
        interpreter,
    }
}

#[tokio::test]
async fn start_run_admits_within_cap_and_enqueues_execution() {
    let h = harness(2);
    let run_id = h.worker.start_run("user-1", "robot-1", RunOrigin::RunByUserId).await.unwrap();

    let run = h.db.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.browser_id.is_some());
    assert_eq!(h.queue.pending_count(&execute_run_queue("user-1")), 1);
}

#[tokio::test]
async fn start_run_stays_queued_when_no_capacity() {
    let h = harness(1);
    let first = h.worker.start_run("user-1", "robot-1", RunOrigin::RunByUserId).await.unwrap();
    let second = h.worker.start_run("user-1", "robot-1", RunOrigin::RunByUserId).await.unwrap();

    let run = h.db.get_run(&second).unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    // Scenario 2: a denied admission still carries a browserId placeholder
    // in its response, even though no slot was reserved for it.
    let placeholder = run.browser_id.clone().unwrap();
    assert!(h
        .notifier
        .events
        .lock()
        .unwrap()
        .contains(&("scheduled", second)));

    // Once a slot frees up, retry_admission reserves a *new* browserId —
    // distinct from the placeholder the queued response handed back.
    h.worker.pool().destroy_slot(&h.db.get_run(&first).unwrap().browser_id.unwrap()).await;
    h.worker.retry_admission(&second).await.unwrap();
    let run = h.db.get_run(&second).unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_ne!(run.browser_id.unwrap(), placeholder);
}

#[tokio::test]
async fn execute_run_drives_interpreter_and_finishes_successfully() {
    let h = harness(2);
    let run_id = h.worker.start_run("user-1", "robot-1", RunOrigin::RunByUserId).await.unwrap();
    let job = h
        .queue
        .claim(&execute_run_queue("user-1"))
        .await
        .unwrap()
        .unwrap();

    h.worker.execute_run(&job).await.unwrap();

    let run = h.db.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(h.interpreter.calls.lock().unwrap().len(), 1);
    assert_eq!(h.integrations.pushes.lock().unwrap().len(), 1);
    assert!(h
        .notifier
        .events
        .lock()
        .unwrap()
        .contains(&("completed", run_id)));
}

#[tokio::test]
async fn execute_run_marks_failed_when_interpreter_errors() {
    let h = harness(2);
    h.interpreter.set_fail(true);
    let run_id = h.worker.start_run("user-1", "robot-1", RunOrigin::RunByUserId).await.unwrap();
    let job = h
        .queue
        .claim(&execute_run_queue("user-1"))
        .await
        .unwrap()
        .unwrap();

    h.worker.execute_run(&job).await.unwrap();

    let run = h.db.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    // No partial output was accumulated before the failure, so there's
    // nothing worth pushing downstream.
    assert!(h.integrations.pushes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn execute_run_still_pushes_integrations_on_partial_failure() {
    let h = harness(2);
    h.interpreter.set_fail(true);
    h.interpreter.set_fail_with_partial_data(true);
    let run_id = h.worker.start_run("user-1", "robot-1", RunOrigin::RunByUserId).await.unwrap();
    let job = h
        .queue
        .claim(&execute_run_queue("user-1"))
        .await
        .unwrap()
        .unwrap();

    h.worker.execute_run(&job).await.unwrap();

    let run = h.db.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.serializable_output.is_some());
    // §4.4 step 7: partial data still gets pushed downstream even though
    // the run itself ends `failed`.
    assert_eq!(h.integrations.pushes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn abort_while_queued_finishes_without_touching_the_pool() {
    let h = harness(1);
    let _occupier = h.worker.start_run("user-1", "robot-1", RunOrigin::RunByUserId).await.unwrap();
    let queued_run_id = h.worker.start_run("user-1", "robot-1", RunOrigin::RunByUserId).await.unwrap();

    h.queue
        .send(&abort_run_queue("user-1"), serde_json::json!({ "run_id": queued_run_id }))
        .await
        .unwrap();
    let job = h.queue.claim(&abort_run_queue("user-1")).await.unwrap().unwrap();
    h.worker.abort_run(&job).await.unwrap();

    let run = h.db.get_run(&queued_run_id).unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
}

#[tokio::test]
async fn abort_while_running_destroys_the_slot() {
    let h = harness(2);
    let run_id = h.worker.start_run("user-1", "robot-1", RunOrigin::RunByUserId).await.unwrap();

    h.queue
        .send(&abort_run_queue("user-1"), serde_json::json!({ "run_id": run_id }))
        .await
        .unwrap();
    let job = h.queue.claim(&abort_run_queue("user-1")).await.unwrap().unwrap();
    h.worker.abort_run(&job).await.unwrap();

    let run = h.db.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
}

#[tokio::test]
async fn orphan_recovery_requeues_runs_with_no_matching_slot() {
    let h = harness(2);
    let run_id = h.worker.start_run("user-1", "robot-1", RunOrigin::RunByUserId).await.unwrap();

    // Simulate a restart: the pool comes back empty even though the `runs`
    // row still says `running` with a browser_id that no longer exists.
    let browser_id = h.db.get_run(&run_id).unwrap().browser_id.unwrap();
    h.worker.pool().destroy_slot(&browser_id).await;

    let recovered = super::recovery::recover_orphaned_runs(&h.worker).await.unwrap();
    assert_eq!(recovered, 1);

    let run = h.db.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.retry_count, 1);
}
