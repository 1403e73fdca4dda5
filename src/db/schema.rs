//! Row types and SQL schema for the record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    slot_limit INTEGER NOT NULL DEFAULT 2,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    issued_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

CREATE TABLE IF NOT EXISTS robots (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    name TEXT NOT NULL,
    recording_meta TEXT NOT NULL,
    workflow TEXT NOT NULL,
    schedule TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_robots_user ON robots(user_id);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    robot_id TEXT NOT NULL REFERENCES robots(id),
    user_id TEXT NOT NULL REFERENCES users(id),
    status TEXT NOT NULL,
    browser_id TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    serializable_output TEXT,
    binary_output_uri TEXT,
    log TEXT,
    error_message TEXT,
    origin TEXT NOT NULL DEFAULT 'run_by_user_id',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_robot ON runs(robot_id);
CREATE INDEX IF NOT EXISTS idx_runs_user_status ON runs(user_id, status);

CREATE TABLE IF NOT EXISTS queue_jobs (
    id TEXT PRIMARY KEY,
    queue_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    available_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_jobs_queue_status ON queue_jobs(queue_name, status, available_at);

CREATE TABLE IF NOT EXISTS schedules (
    robot_id TEXT PRIMARY KEY REFERENCES robots(id),
    cron_expr TEXT NOT NULL,
    timezone TEXT NOT NULL,
    next_run_at TEXT
);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub slot_limit: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Free-form metadata describing how a recording was captured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RecordingMeta {
    pub name: String,
    pub description: Option<String>,
    pub url: Option<String>,
}

/// One `{where, what}` pair in a recorded workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    #[serde(rename = "where")]
    pub location: serde_json::Value,
    #[serde(rename = "what")]
    pub actions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Workflow {
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunEveryUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleSpec {
    pub run_every: u32,
    pub run_every_unit: RunEveryUnit,
    pub start_from: Option<String>,
    pub day_of_month: Option<u32>,
    pub at_time_start: String,
    pub at_time_end: Option<String>,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Robot {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub recording_meta: RecordingMeta,
    pub workflow: Workflow,
    pub schedule: Option<ScheduleSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Aborting,
    Aborted,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Aborted | RunStatus::Success | RunStatus::Failed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Aborting => "aborting",
            RunStatus::Aborted => "aborted",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Who/what requested a run — carried through so an operator can tell a
/// user-initiated run apart from a schedule fire or a raw API call without
/// guessing from the queue it landed on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOrigin {
    RunByUserId,
    RunByScheduleId,
    RunByApi,
}

impl RunOrigin {
    fn as_str(self) -> &'static str {
        match self {
            RunOrigin::RunByUserId => "run_by_user_id",
            RunOrigin::RunByScheduleId => "run_by_schedule_id",
            RunOrigin::RunByApi => "run_by_api",
        }
    }
}

impl fmt::Display for RunOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(super) fn parse_run_origin(s: &str) -> RunOrigin {
    match s {
        "run_by_schedule_id" => RunOrigin::RunByScheduleId,
        "run_by_api" => RunOrigin::RunByApi,
        _ => RunOrigin::RunByUserId,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub robot_id: String,
    pub user_id: String,
    pub status: RunStatus,
    pub browser_id: Option<String>,
    pub retry_count: u32,
    pub serializable_output: Option<serde_json::Value>,
    pub binary_output_uri: Option<String>,
    pub log: Option<String>,
    pub error_message: Option<String>,
    pub origin: RunOrigin,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub(super) fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "queued" => RunStatus::Queued,
        "running" => RunStatus::Running,
        "aborting" => RunStatus::Aborting,
        "aborted" => RunStatus::Aborted,
        "success" => RunStatus::Success,
        _ => RunStatus::Failed,
    }
}

pub(super) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
