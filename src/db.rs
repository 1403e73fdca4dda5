//! Record store gateway.
//!
//! Typed CRUD over the `users`, `sessions`, `robots` and `runs` tables,
//! behind a single synchronous connection shared via `Arc<Mutex<_>>`. Other
//! modules (the durable job queue, the scheduler) open their own tables
//! through the same handle rather than keeping a second connection alive.

mod schema;

pub use schema::*;
use schema::{parse_datetime, parse_run_origin, parse_run_status};

use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("robot not found: {0}")]
    RobotNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;

#[derive(Clone)]
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Users ====================

    pub fn upsert_user(&self, id: &str, slot_limit: u32) -> DbResult<User> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO users (id, slot_limit, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET slot_limit = excluded.slot_limit",
            params![id, slot_limit, now.to_rfc3339()],
        )?;
        drop(conn);
        self.get_user(id)
    }

    pub fn get_user(&self, id: &str) -> DbResult<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, slot_limit, created_at FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    slot_limit: row.get(1)?,
                    created_at: parse_datetime(&row.get::<_, String>(2)?),
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::UserNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    // ==================== Sessions ====================

    pub fn create_session(&self, session: &Session) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, user_id, issued_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.id,
                session.user_id,
                session.issued_at.to_rfc3339(),
                session.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> DbResult<Session> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, issued_at, expires_at FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(Session {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    issued_at: parse_datetime(&row.get::<_, String>(2)?),
                    expires_at: parse_datetime(&row.get::<_, String>(3)?),
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    // ==================== Robots ====================

    pub fn create_robot(&self, robot: &Robot) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO robots (id, user_id, name, recording_meta, workflow, schedule, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                robot.id,
                robot.user_id,
                robot.name,
                serde_json::to_string(&robot.recording_meta)?,
                serde_json::to_string(&robot.workflow)?,
                robot.schedule.as_ref().map(serde_json::to_string).transpose()?,
                robot.created_at.to_rfc3339(),
                robot.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_robot(&self, id: &str) -> DbResult<Robot> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, name, recording_meta, workflow, schedule, created_at, updated_at
             FROM robots WHERE id = ?1",
            params![id],
            row_to_robot,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::RobotNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    pub fn list_robots_for_user(&self, user_id: &str) -> DbResult<Vec<Robot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, recording_meta, workflow, schedule, created_at, updated_at
             FROM robots WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_robot)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Every distinct user id that owns at least one robot — backs the
    /// queued-run retry sweep, which has no cross-user "all queued" query
    /// to work from.
    pub fn list_user_ids_with_robots(&self) -> DbResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM robots")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn list_scheduled_robots(&self) -> DbResult<Vec<Robot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, recording_meta, workflow, schedule, created_at, updated_at
             FROM robots WHERE schedule IS NOT NULL",
        )?;
        let rows = stmt.query_map([], row_to_robot)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn delete_robot(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM robots WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::RobotNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Persists (or clears) the structured schedule form on a robot. The
    /// cron-evaluator's own bookkeeping (`cron_expr`, `next_run_at`) lives
    /// in the `schedules` table owned by `scheduler`, not here.
    pub fn update_robot_schedule(&self, id: &str, schedule: Option<&ScheduleSpec>) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let updated = conn.execute(
            "UPDATE robots SET schedule = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                schedule.map(serde_json::to_string).transpose()?,
                now.to_rfc3339(),
                id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::RobotNotFound(id.to_string()));
        }
        Ok(())
    }

    // ==================== Runs ====================

    pub fn create_run(&self, run: &Run) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs (id, robot_id, user_id, status, browser_id, retry_count,
                                serializable_output, binary_output_uri, log, error_message,
                                origin, created_at, updated_at, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                run.id,
                run.robot_id,
                run.user_id,
                run.status.to_string(),
                run.browser_id,
                run.retry_count,
                run.serializable_output
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                run.binary_output_uri,
                run.log,
                run.error_message,
                run.origin.to_string(),
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> DbResult<Run> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, robot_id, user_id, status, browser_id, retry_count,
                    serializable_output, binary_output_uri, log, error_message,
                    origin, created_at, updated_at, started_at, finished_at
             FROM runs WHERE id = ?1",
            params![id],
            row_to_run,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::RunNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    pub fn list_runs_for_user_with_status(
        &self,
        user_id: &str,
        status: RunStatus,
    ) -> DbResult<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, robot_id, user_id, status, browser_id, retry_count,
                    serializable_output, binary_output_uri, log, error_message,
                    origin, created_at, updated_at, started_at, finished_at
             FROM runs WHERE user_id = ?1 AND status = ?2 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![user_id, status.to_string()], row_to_run)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn list_runs_for_robot(&self, robot_id: &str) -> DbResult<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, robot_id, user_id, status, browser_id, retry_count,
                    serializable_output, binary_output_uri, log, error_message,
                    origin, created_at, updated_at, started_at, finished_at
             FROM runs WHERE robot_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![robot_id], row_to_run)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Every run still claiming to be `running` — consulted at startup by
    /// orphan recovery, since a crash always leaves these rows behind.
    pub fn list_running_runs(&self) -> DbResult<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, robot_id, user_id, status, browser_id, retry_count,
                    serializable_output, binary_output_uri, log, error_message,
                    origin, created_at, updated_at, started_at, finished_at
             FROM runs WHERE status = 'running'",
        )?;
        let rows = stmt.query_map([], row_to_run)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Transition a run to a new status, but only if it isn't already in a
    /// terminal state — terminal statuses are sticky, so a late writer
    /// racing a faster terminal transition is silently ignored rather than
    /// erroring.
    pub fn update_run_status(&self, id: &str, status: RunStatus) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let updated = conn.execute(
            "UPDATE runs SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status NOT IN ('success', 'failed', 'aborted')",
            params![status.to_string(), now.to_rfc3339(), id],
        )?;
        if updated == 0 {
            // Either missing entirely, or already terminal.
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM runs WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(DbError::RunNotFound(id.to_string()));
            }
            return Ok(false);
        }
        Ok(true)
    }

    pub fn set_run_browser(&self, id: &str, browser_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let updated = conn.execute(
            "UPDATE runs SET browser_id = ?1, started_at = COALESCE(started_at, ?2), updated_at = ?2 WHERE id = ?3",
            params![browser_id, now.to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(DbError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn increment_retry_count(&self, id: &str) -> DbResult<u32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE runs SET retry_count = retry_count + 1 WHERE id = ?1",
            params![id],
        )?;
        conn.query_row(
            "SELECT retry_count FROM runs WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::RunNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    pub fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        serializable_output: Option<&serde_json::Value>,
        binary_output_uri: Option<&str>,
        log: Option<&str>,
        error_message: Option<&str>,
    ) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let updated = conn.execute(
            "UPDATE runs SET status = ?1, serializable_output = ?2, binary_output_uri = ?3,
                              log = ?4, error_message = ?5, finished_at = ?6, updated_at = ?6
             WHERE id = ?7 AND status NOT IN ('success', 'failed', 'aborted')",
            params![
                status.to_string(),
                serializable_output.map(serde_json::to_string).transpose()?,
                binary_output_uri,
                log,
                error_message,
                now.to_rfc3339(),
                id,
            ],
        )?;
        Ok(updated > 0)
    }
}

fn row_to_robot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Robot> {
    let recording_meta: String = row.get(3)?;
    let workflow: String = row.get(4)?;
    let schedule: Option<String> = row.get(5)?;
    Ok(Robot {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        recording_meta: serde_json::from_str(&recording_meta).unwrap_or_default(),
        workflow: serde_json::from_str(&workflow).unwrap_or_default(),
        schedule: schedule.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        updated_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(3)?;
    let serializable_output: Option<String> = row.get(6)?;
    let origin: String = row.get(10)?;
    let started_at: Option<String> = row.get(13)?;
    let finished_at: Option<String> = row.get(14)?;
    Ok(Run {
        id: row.get(0)?,
        robot_id: row.get(1)?,
        user_id: row.get(2)?,
        status: parse_run_status(&status),
        browser_id: row.get(4)?,
        retry_count: row.get(5)?,
        serializable_output: serializable_output.and_then(|s| serde_json::from_str(&s).ok()),
        binary_output_uri: row.get(7)?,
        log: row.get(8)?,
        error_message: row.get(9)?,
        origin: parse_run_origin(&origin),
        created_at: parse_datetime(&row.get::<_, String>(11)?),
        updated_at: parse_datetime(&row.get::<_, String>(12)?),
        started_at: started_at.map(|s| parse_datetime(&s)),
        finished_at: finished_at.map(|s| parse_datetime(&s)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_robot(id: &str, user_id: &str) -> Robot {
        let now = Utc::now();
        Robot {
            id: id.to_string(),
            user_id: user_id.to_string(),
            name: "checkout flow".to_string(),
            recording_meta: RecordingMeta::default(),
            workflow: Workflow::default(),
            schedule: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_run(id: &str, robot_id: &str, user_id: &str) -> Run {
        let now = Utc::now();
        Run {
            id: id.to_string(),
            robot_id: robot_id.to_string(),
            user_id: user_id.to_string(),
            status: RunStatus::Queued,
            browser_id: None,
            retry_count: 0,
            serializable_output: None,
            binary_output_uri: None,
            log: None,
            error_message: None,
            origin: RunOrigin::RunByUserId,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn create_and_get_robot() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user("user-1", 2).unwrap();
        let robot = sample_robot("robot-1", "user-1");
        db.create_robot(&robot).unwrap();

        let fetched = db.get_robot("robot-1").unwrap();
        assert_eq!(fetched.name, "checkout flow");
    }

    #[test]
    fn terminal_run_status_is_sticky() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user("user-1", 2).unwrap();
        db.create_robot(&sample_robot("robot-1", "user-1")).unwrap();
        let run = sample_run("run-1", "robot-1", "user-1");
        db.create_run(&run).unwrap();

        assert!(db.update_run_status("run-1", RunStatus::Running).unwrap());
        assert!(db
            .finish_run("run-1", RunStatus::Success, None, None, None, None)
            .unwrap());

        // A late "running" write must not resurrect a terminal run.
        let applied = db.update_run_status("run-1", RunStatus::Running).unwrap();
        assert!(!applied);
        assert_eq!(db.get_run("run-1").unwrap().status, RunStatus::Success);
    }

    #[test]
    fn missing_run_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_run("nope"),
            Err(DbError::RunNotFound(_))
        ));
    }
}
