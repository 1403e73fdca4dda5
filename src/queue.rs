//! Durable job queue — named FIFO queues backed by the same `rusqlite`
//! connection as the record store, with at-least-once delivery semantics.
//!
//! Mirrors the teacher's `Database` handle shape (cheap `Clone`, a
//! `Mutex<Connection>` underneath) rather than reaching for an external
//! broker: the spec's contract (named queues, FIFO per queue, job-state
//! query, 23h retention) is small enough that a SQL table satisfies it
//! without adding an unattested dependency to the stack.

use crate::db::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    JobNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => JobState::Active,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            _ => JobState::Created,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Names follow the spec's convention so log lines and admin tooling read
/// the same as the spec's own vocabulary.
pub fn execute_run_queue(user_id: &str) -> String {
    format!("execute-run-user-{user_id}")
}

pub fn abort_run_queue(user_id: &str) -> String {
    format!("abort-run-user-{user_id}")
}

pub fn schedule_queue(robot_id: &str) -> String {
    format!("schedule-{robot_id}")
}

pub const LEGACY_EXECUTE_RUN_QUEUE: &str = "execute-run";
pub const LEGACY_DESTROY_BROWSER_QUEUE: &str = "destroy-browser";

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(&self, queue: &str, payload: serde_json::Value) -> Result<String, QueueError>;

    /// Claim the oldest `created` job on `queue`, marking it `active`.
    async fn claim(&self, queue: &str) -> Result<Option<Job>, QueueError>;

    async fn ack(&self, job_id: &str) -> Result<(), QueueError>;

    async fn fail(&self, job_id: &str) -> Result<(), QueueError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    /// Every distinct queue name with at least one job ever sent —
    /// backs the worker registry's discovery loop.
    async fn list_queues(&self) -> Result<Vec<String>, QueueError>;
}

pub struct SqliteJobQueue {
    db: Database,
    /// §4.2: "at least `BROWSER_INIT_TIMEOUT + workflow-run-expected-duration`"
    /// — how long a claimed job stays invisible to `claim()` before it's
    /// treated as abandoned and becomes reclaimable again.
    visibility_timeout: Duration,
}

impl SqliteJobQueue {
    pub fn new(db: Database, visibility_timeout: Duration) -> Arc<Self> {
        Arc::new(Self { db, visibility_timeout })
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn send(&self, queue: &str, payload: serde_json::Value) -> Result<String, QueueError> {
        let conn = self.db.conn.lock().unwrap();
        let id = crate::clock::Ids::job_id();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO queue_jobs (id, queue_name, payload, status, created_at, available_at)
             VALUES (?1, ?2, ?3, 'created', ?4, ?4)",
            params![id, queue, serde_json::to_string(&payload)?, now.to_rfc3339()],
        )?;
        tracing::info!(queue, job_id = %id, "enqueued job");
        Ok(id)
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let conn = self.db.conn.lock().unwrap();
        let now = Utc::now();
        // `created` jobs are claimable as soon as they're visible; `active`
        // jobs are claimable too once their visibility window has lapsed —
        // the consumer that claimed them never acked or failed, so treat it
        // as dead rather than stranding the job forever.
        let found: Option<(String, String)> = conn
            .query_row(
                "SELECT id, payload FROM queue_jobs
                 WHERE queue_name = ?1 AND status IN ('created', 'active') AND available_at <= ?2
                 ORDER BY created_at ASC LIMIT 1",
                params![queue, now.to_rfc3339()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        let Some((id, payload_str)) = found else {
            return Ok(None);
        };

        let visible_again_at = now
            + chrono::Duration::from_std(self.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        conn.execute(
            "UPDATE queue_jobs SET status = 'active', available_at = ?1 WHERE id = ?2",
            params![visible_again_at.to_rfc3339(), id],
        )?;

        Ok(Some(Job {
            id: id.clone(),
            queue: queue.to_string(),
            payload: serde_json::from_str(&payload_str)?,
            state: JobState::Active,
            enqueued_at: now,
            claimed_at: Some(now),
        }))
    }

    async fn ack(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.db.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE queue_jobs SET status = 'completed' WHERE id = ?1",
            params![job_id],
        )?;
        if updated == 0 {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn fail(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.db.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE queue_jobs SET status = 'failed' WHERE id = ?1",
            params![job_id],
        )?;
        if updated == 0 {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let conn = self.db.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, queue_name, payload, status, created_at FROM queue_jobs WHERE id = ?1",
            params![job_id],
            |row| {
                let payload_str: String = row.get(2)?;
                let status: String = row.get(3)?;
                let created_at: String = row.get(4)?;
                Ok((payload_str, status, created_at, row.get::<_, String>(1)?))
            },
        )
        .map(|(payload_str, status, created_at, queue)| {
            Some(Job {
                id: job_id.to_string(),
                queue,
                payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
                state: JobState::parse(&status),
                enqueued_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                claimed_at: None,
            })
        })
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(QueueError::from(crate::db::DbError::from(other))),
        })
    }

    async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT queue_name FROM queue_jobs")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeJobQueue {
        queues: Mutex<std::collections::HashMap<String, VecDeque<Job>>>,
        next_id: Mutex<u64>,
    }

    impl FakeJobQueue {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn pending_count(&self, queue: &str) -> usize {
            self.queues
                .lock()
                .unwrap()
                .get(queue)
                .map(|q| q.iter().filter(|j| j.state == JobState::Created).count())
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl JobQueue for FakeJobQueue {
        async fn send(&self, queue: &str, payload: serde_json::Value) -> Result<String, QueueError> {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            let id = format!("fake-job-{next_id}");
            self.queues
                .lock()
                .unwrap()
                .entry(queue.to_string())
                .or_default()
                .push_back(Job {
                    id: id.clone(),
                    queue: queue.to_string(),
                    payload,
                    state: JobState::Created,
                    enqueued_at: Utc::now(),
                    claimed_at: None,
                });
            Ok(id)
        }

        async fn claim(&self, queue: &str) -> Result<Option<Job>, QueueError> {
            let mut queues = self.queues.lock().unwrap();
            let Some(q) = queues.get_mut(queue) else {
                return Ok(None);
            };
            let job = q.iter_mut().find(|j| j.state == JobState::Created);
            if let Some(job) = job {
                job.state = JobState::Active;
                job.claimed_at = Some(Utc::now());
                return Ok(Some(job.clone()));
            }
            Ok(None)
        }

        async fn ack(&self, job_id: &str) -> Result<(), QueueError> {
            let mut queues = self.queues.lock().unwrap();
            for q in queues.values_mut() {
                if let Some(job) = q.iter_mut().find(|j| j.id == job_id) {
                    job.state = JobState::Completed;
                    return Ok(());
                }
            }
            Err(QueueError::JobNotFound(job_id.to_string()))
        }

        async fn fail(&self, job_id: &str) -> Result<(), QueueError> {
            let mut queues = self.queues.lock().unwrap();
            for q in queues.values_mut() {
                if let Some(job) = q.iter_mut().find(|j| j.id == job_id) {
                    job.state = JobState::Failed;
                    return Ok(());
                }
            }
            Err(QueueError::JobNotFound(job_id.to_string()))
        }

        async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
            let queues = self.queues.lock().unwrap();
            Ok(queues
                .values()
                .flat_map(|q| q.iter())
                .find(|j| j.id == job_id)
                .cloned())
        }

        async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
            Ok(self.queues.lock().unwrap().keys().cloned().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_per_queue() {
        let q = SqliteJobQueue::new(Database::open_in_memory().unwrap(), Duration::from_secs(90));
        let j1 = q.send("execute-run-user-u1", serde_json::json!({"n": 1})).await.unwrap();
        let j2 = q.send("execute-run-user-u1", serde_json::json!({"n": 2})).await.unwrap();

        let claimed1 = q.claim("execute-run-user-u1").await.unwrap().unwrap();
        assert_eq!(claimed1.id, j1);
        q.ack(&claimed1.id).await.unwrap();

        let claimed2 = q.claim("execute-run-user-u1").await.unwrap().unwrap();
        assert_eq!(claimed2.id, j2);
    }

    #[tokio::test]
    async fn queue_naming_matches_convention() {
        assert_eq!(execute_run_queue("u1"), "execute-run-user-u1");
        assert_eq!(abort_run_queue("u1"), "abort-run-user-u1");
        assert_eq!(schedule_queue("r1"), "schedule-r1");
    }

    #[tokio::test]
    async fn claimed_job_is_not_reclaimable_before_visibility_timeout_elapses() {
        let q = SqliteJobQueue::new(Database::open_in_memory().unwrap(), Duration::from_secs(90));
        q.send("execute-run-user-u1", serde_json::json!({"n": 1})).await.unwrap();
        let claimed = q.claim("execute-run-user-u1").await.unwrap().unwrap();

        // Consumer never acks or fails it; the job is still within its
        // visibility window, so a second claim must see nothing.
        assert!(q.claim("execute-run-user-u1").await.unwrap().is_none());

        // Force the stored `available_at` back into the past to simulate
        // the visibility timeout having elapsed.
        {
            let conn = q.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE queue_jobs SET available_at = ?1 WHERE id = ?2",
                params![(Utc::now() - chrono::Duration::seconds(1)).to_rfc3339(), claimed.id],
            )
            .unwrap();
        }

        let reclaimed = q.claim("execute-run-user-u1").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
    }

    #[tokio::test]
    async fn list_queues_discovers_user_queues() {
        let q = SqliteJobQueue::new(Database::open_in_memory().unwrap(), Duration::from_secs(90));
        q.send(&execute_run_queue("u1"), serde_json::json!({})).await.unwrap();
        q.send(&abort_run_queue("u2"), serde_json::json!({})).await.unwrap();

        let mut queues = q.list_queues().await.unwrap();
        queues.sort();
        assert_eq!(queues, vec!["abort-run-user-u2", "execute-run-user-u1"]);
    }
}
