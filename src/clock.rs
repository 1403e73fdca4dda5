//! Clock and ID generation, pulled behind a trait so retry/timeout logic
//! and cron computation stay deterministically testable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn monotonic_instant(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_instant(&self) -> Instant {
        Instant::now()
    }
}

#[async_trait]
impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now_utc(&self) -> DateTime<Utc> {
        (**self).now_utc()
    }

    fn monotonic_instant(&self) -> Instant {
        (**self).monotonic_instant()
    }
}

pub struct Ids;

impl Ids {
    pub fn run_id() -> String {
        format!("run-{}", Uuid::new_v4())
    }

    pub fn browser_id() -> String {
        format!("browser-{}", Uuid::new_v4())
    }

    pub fn job_id() -> String {
        format!("job-{}", Uuid::new_v4())
    }

    pub fn robot_id() -> String {
        format!("robot-{}", Uuid::new_v4())
    }
}

#[cfg(test)]
pub mod testing {
    use super::Clock;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use std::time::Instant;

    /// A clock that only advances when told to, for deterministic tests of
    /// retry scheduling and cron "next run" computation.
    pub struct FakeClock {
        now: Mutex<DateTime<Utc>>,
        started: Instant,
    }

    impl FakeClock {
        pub fn new(now: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(now),
                started: Instant::now(),
            }
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut now = self.now.lock().unwrap();
            *now += delta;
        }
    }

    impl Clock for FakeClock {
        fn now_utc(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        fn monotonic_instant(&self) -> Instant {
            self.started
        }
    }
}
