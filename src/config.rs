//! Process configuration, loaded once from the environment at startup.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub port: u16,
    pub jwt_secret: String,
    pub public_url: Option<String>,
    pub session_secret: Option<String>,
    pub backend_url: Option<String>,
    pub node_env: String,

    /// Maximum concurrent `BrowserSlot`s per user (spec's `N`).
    pub max_slots_per_user: u32,
    pub browser_init_timeout: Duration,
    pub browser_pool_wait_timeout: Duration,
    pub browser_destroy_timeout: Duration,
    /// Upper bound on how long a single workflow run is expected to take.
    /// Used only to size the job queue's claim visibility timeout (§4.2):
    /// `browser_init_timeout + workflow_run_expected_duration`.
    pub workflow_run_expected_duration: Duration,
    pub pool_gc_interval: Duration,
    pub queue_discovery_interval: Duration,
    pub queued_run_poll_interval: Duration,
    pub abort_grace_period: Duration,
    pub namespace_settle_delay: Duration,
    pub object_store_root: String,

    /// Base URL the integration dispatcher posts finished-run pushes to.
    /// Unset means no downstream pipelines are wired up; pushes no-op.
    pub integration_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("DB_NAME")
                .unwrap_or_else(|_| "robotium.sqlite3".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            jwt_secret: std::env::var("JWT_SECRET")
                .unwrap_or_else(|_| "dev-insecure-secret".to_string()),
            public_url: std::env::var("PUBLIC_URL").ok(),
            session_secret: std::env::var("SESSION_SECRET").ok(),
            backend_url: std::env::var("BACKEND_URL").ok(),
            node_env: std::env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string()),

            max_slots_per_user: std::env::var("MAX_SLOTS_PER_USER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            browser_init_timeout: Duration::from_secs(45),
            browser_pool_wait_timeout: Duration::from_secs(60),
            browser_destroy_timeout: Duration::from_secs(30),
            workflow_run_expected_duration: Duration::from_secs(300),
            pool_gc_interval: Duration::from_secs(60),
            queue_discovery_interval: Duration::from_secs(10),
            queued_run_poll_interval: Duration::from_secs(5),
            abort_grace_period: Duration::from_millis(500),
            namespace_settle_delay: Duration::from_millis(100),
            object_store_root: std::env::var("OBJECT_STORE_ROOT")
                .unwrap_or_else(|_| "/tmp/robotium-objects".to_string()),
            integration_webhook_url: std::env::var("INTEGRATION_WEBHOOK_URL").ok(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.node_env == "production"
    }

    /// §4.2: the minimum a claimed job must stay invisible before it's
    /// reclaimable, so a crashed consumer doesn't strand it forever.
    pub fn job_visibility_timeout(&self) -> Duration {
        self.browser_init_timeout + self.workflow_run_expected_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_env() {
        // from_env reads whatever happens to be in the test process's
        // environment; assert only the fields that don't depend on it.
        let cfg = Config::from_env();
        assert_eq!(cfg.max_slots_per_user, cfg.max_slots_per_user.max(1));
        assert_eq!(cfg.browser_init_timeout, Duration::from_secs(45));
        assert_eq!(cfg.browser_pool_wait_timeout, Duration::from_secs(60));
    }
}
