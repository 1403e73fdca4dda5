//! Discovery loop that notices new per-user queues as they're enqueued
//! into, and registers one polling consumer task per queue — generalizing
//! the teacher's single static consumer into the spec's dynamic
//! `execute-run-user-<userId>` / `abort-run-user-<userId>` naming scheme.

use super::executor::RunWorker;
use crate::queue::{Job, JobQueue, LEGACY_DESTROY_BROWSER_QUEUE, LEGACY_EXECUTE_RUN_QUEUE};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct QueueRegistry {
    queue: Arc<dyn JobQueue>,
    worker: RunWorker,
    known: Mutex<HashSet<String>>,
    poll_interval: Duration,
}

impl QueueRegistry {
    pub fn new(queue: Arc<dyn JobQueue>, worker: RunWorker, poll_interval: Duration) -> Self {
        Self {
            queue,
            worker,
            known: Mutex::new(HashSet::new()),
            poll_interval,
        }
    }

    /// Registers no-op consumers for the legacy global queue names kept for
    /// backward compatibility — they only ever log-and-ack.
    pub fn spawn_legacy_consumers(&self) {
        self.spawn_consumer(LEGACY_EXECUTE_RUN_QUEUE.to_string(), ConsumerKind::LegacyNoop);
        self.spawn_consumer(LEGACY_DESTROY_BROWSER_QUEUE.to_string(), ConsumerKind::LegacyNoop);
    }

    /// One discovery tick: lists every queue the job store has ever seen a
    /// job on, and spawns a consumer for any not already registered.
    pub async fn discover_once(&self) -> Vec<String> {
        let queues = match self.queue.list_queues().await {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!(error = %e, "queue discovery failed");
                return Vec::new();
            }
        };

        let mut known = self.known.lock().await;
        let mut newly_registered = Vec::new();
        for name in queues {
            if known.contains(&name) {
                continue;
            }
            let Some(kind) = ConsumerKind::classify(&name) else {
                continue;
            };
            known.insert(name.clone());
            self.spawn_consumer(name.clone(), kind);
            newly_registered.push(name);
        }
        newly_registered
    }

    /// Runs `discover_once` on a fixed tick, forever. Intended to be
    /// spawned once at process startup.
    pub async fn run_discovery_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            let found = self.discover_once().await;
            for name in found {
                tracing::info!(queue = %name, "registered new queue consumer");
            }
        }
    }

    fn spawn_consumer(&self, queue_name: String, kind: ConsumerKind) {
        let queue = self.queue.clone();
        let worker = self.worker.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                match queue.claim(&queue_name).await {
                    Ok(Some(job)) => {
                        if let Err(e) = dispatch(&worker, &queue, &kind, &job).await {
                            tracing::warn!(queue = %queue_name, job_id = %job.id, error = %e, "job processing failed");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(queue = %queue_name, error = %e, "claim failed"),
                }
            }
        });
    }
}

enum ConsumerKind {
    Execute,
    Abort,
    LegacyNoop,
}

impl ConsumerKind {
    fn classify(queue_name: &str) -> Option<Self> {
        if queue_name.starts_with("execute-run-user-") {
            Some(ConsumerKind::Execute)
        } else if queue_name.starts_with("abort-run-user-") {
            Some(ConsumerKind::Abort)
        } else if queue_name == LEGACY_EXECUTE_RUN_QUEUE || queue_name == LEGACY_DESTROY_BROWSER_QUEUE {
            Some(ConsumerKind::LegacyNoop)
        } else {
            None
        }
    }
}

async fn dispatch(
    worker: &RunWorker,
    queue: &Arc<dyn JobQueue>,
    kind: &ConsumerKind,
    job: &Job,
) -> Result<(), super::executor::WorkerError> {
    match kind {
        ConsumerKind::Execute => worker.execute_run(job).await,
        ConsumerKind::Abort => worker.abort_run(job).await,
        ConsumerKind::LegacyNoop => {
            tracing::debug!(job_id = %job.id, "acking job on retired legacy queue");
            queue.ack(&job.id).await.map_err(Into::into)
        }
    }
}
