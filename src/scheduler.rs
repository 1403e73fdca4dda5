//! Scheduler — builds cron expressions from a robot's structured
//! `ScheduleSpec`, computes timezone-aware next-run times, and produces
//! queued runs when the clock advances past `nextRunAt`.

use crate::db::{Database, Robot, RunEveryUnit, ScheduleSpec};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("database error: {0}")]
    Db(#[from] crate::db::DbError),
}

const WEEKDAYS: [&str; 7] = [
    "SUNDAY", "MONDAY", "TUESDAY", "WEDNESDAY", "THURSDAY", "FRIDAY", "SATURDAY",
];

fn weekday_index(name: &str) -> Option<u32> {
    WEEKDAYS
        .iter()
        .position(|w| w.eq_ignore_ascii_case(name))
        .map(|i| i as u32)
}

fn parse_at_time(at_time: &str) -> Result<(u32, u32), SchedulerError> {
    let (h, m) = at_time
        .split_once(':')
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("bad atTimeStart: {at_time}")))?;
    let hour: u32 = h
        .parse()
        .map_err(|_| SchedulerError::InvalidSchedule(format!("bad hour in {at_time}")))?;
    let minute: u32 = m
        .parse()
        .map_err(|_| SchedulerError::InvalidSchedule(format!("bad minute in {at_time}")))?;
    Ok((hour, minute))
}

/// Builds the 5-field cron expression per the spec's structured-form rules
/// (§6). This is the canonical string that gets stored and returned to
/// callers — matching, e.g., the WEEKLY scenario's expected `30 9 * * 1`.
pub fn build_cron_expr(spec: &ScheduleSpec) -> Result<String, SchedulerError> {
    let (hour, minute) = parse_at_time(&spec.at_time_start)?;
    let n = spec.run_every;

    let expr = match spec.run_every_unit {
        RunEveryUnit::Minutes => format!("*/{n} * * * *"),
        RunEveryUnit::Hours => format!("{minute} */{n} * * *"),
        RunEveryUnit::Days => format!("{minute} {hour} */{n} * *"),
        RunEveryUnit::Weeks => {
            let day_index = spec
                .start_from
                .as_deref()
                .and_then(weekday_index)
                .unwrap_or(0);
            format!("{minute} {hour} * * {day_index}")
        }
        RunEveryUnit::Months => {
            let dom = spec.day_of_month.unwrap_or(1);
            let mut e = format!("{minute} {hour} {dom} */{n} *");
            if let Some(start_from) = spec.start_from.as_deref() {
                if !start_from.eq_ignore_ascii_case("SUNDAY") {
                    if let Some(day_index) = weekday_index(start_from) {
                        e = format!("{minute} {hour} {dom} */{n} {day_index}");
                    }
                }
            }
            e
        }
    };
    // Validate eagerly so a malformed spec is rejected at creation time, not
    // at the next tick. The `cron` crate requires a leading seconds field
    // the spec's canonical form omits, so validate the six-field version
    // but keep storing/returning the five-field one.
    CronSchedule::from_str(&six_field(&expr))
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{expr}: {e}")))?;
    Ok(expr)
}

/// Prepends the seconds field the `cron` crate's parser requires but the
/// spec's canonical 5-field expressions omit.
fn six_field(expr: &str) -> String {
    format!("0 {expr}")
}

pub fn resolve_timezone(tz_name: &str) -> Result<Tz, SchedulerError> {
    Tz::from_str(tz_name).map_err(|_| SchedulerError::UnknownTimezone(tz_name.to_string()))
}

/// Next fire time strictly after `after`, evaluated in `tz` then converted
/// back to UTC — this is what makes the spec's DST-crossing scenario
/// ("Europe/Prague") correct: the cron fields are interpreted as local
/// wall-clock time in `tz`, not as UTC offsets.
pub fn next_run_after(
    cron_expr: &str,
    tz: Tz,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    let schedule = CronSchedule::from_str(&six_field(cron_expr))
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
    let after_local = after.with_timezone(&tz);
    Ok(schedule
        .after(&after_local)
        .next()
        .map(|dt| dt.with_timezone(&Utc)))
}

/// Ticks every registered schedule once: any robot whose `nextRunAt` has
/// passed gets a queued run (via the caller-supplied `admit` callback) and
/// its schedule's `nextRunAt` is advanced.
pub struct Scheduler {
    db: Database,
}

impl Scheduler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Registers (or re-registers) the cron entry for a robot, matching
    /// spec's `ScheduleWorkflow`. Returns the computed cron expression.
    pub fn schedule_workflow(
        &self,
        robot: &Robot,
        spec: &ScheduleSpec,
    ) -> Result<String, SchedulerError> {
        let cron_expr = build_cron_expr(spec)?;
        let tz = resolve_timezone(&spec.timezone)?;
        let next = next_run_after(&cron_expr, tz, Utc::now())?;

        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedules (robot_id, cron_expr, timezone, next_run_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(robot_id) DO UPDATE SET cron_expr = excluded.cron_expr,
                                                  timezone = excluded.timezone,
                                                  next_run_at = excluded.next_run_at",
            rusqlite::params![
                robot.id,
                cron_expr,
                spec.timezone,
                next.map(|d| d.to_rfc3339()),
            ],
        )
        .map_err(crate::db::DbError::from)?;
        Ok(cron_expr)
    }

    pub fn cancel_scheduled_workflow(&self, robot_id: &str) -> Result<(), SchedulerError> {
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM schedules WHERE robot_id = ?1",
            rusqlite::params![robot_id],
        )
        .map_err(crate::db::DbError::from)?;
        Ok(())
    }

    /// Every `(robot_id, cron_expr, timezone, next_run_at)` whose
    /// `next_run_at` is due as of `now`. Advances `next_run_at` for each one
    /// returned, so a single tick never fires the same robot twice.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>, SchedulerError> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT robot_id, cron_expr, timezone, next_run_at FROM schedules WHERE next_run_at IS NOT NULL")
            .map_err(crate::db::DbError::from)?;
        let rows: Vec<(String, String, String, Option<String>)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(crate::db::DbError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(crate::db::DbError::from)?;
        drop(stmt);

        let mut due = Vec::new();
        for (robot_id, cron_expr, tz_name, next_run_at) in rows {
            let Some(next_run_at) = next_run_at else {
                continue;
            };
            let Ok(scheduled_at) = DateTime::parse_from_rfc3339(&next_run_at) else {
                continue;
            };
            let scheduled_at = scheduled_at.with_timezone(&Utc);
            if scheduled_at > now {
                continue;
            }
            let Ok(tz) = resolve_timezone(&tz_name) else {
                continue;
            };
            let following = next_run_after(&cron_expr, tz, scheduled_at)?;
            conn.execute(
                "UPDATE schedules SET next_run_at = ?1 WHERE robot_id = ?2",
                rusqlite::params![following.map(|d| d.to_rfc3339()), robot_id],
            )
            .map_err(crate::db::DbError::from)?;
            due.push((robot_id, scheduled_at));
        }
        Ok(due)
    }
}
