//! HTTP + WebSocket surface. `AppState` bundles every port adapter the
//! handlers need; `create_router` wires the REST routes and the two WS
//! namespace families behind one `axum::Router`, mirroring the teacher's
//! `api.rs` (`AppState` + `create_router`) generalized to this crate's port
//! set.

mod handlers;
mod types;
mod ws;

pub use handlers::create_router;
pub use ws::{NotificationRegistry, SessionRegistry, WsNotifier};

use crate::auth::AuthVerifier;
use crate::browser_driver::BrowserDriver;
use crate::browser_pool::BrowserPool;
use crate::config::Config;
use crate::db::Database;
use crate::scheduler::Scheduler;
use crate::worker::RunWorker;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub pool: Arc<dyn BrowserPool>,
    pub driver: Arc<dyn BrowserDriver>,
    pub worker: RunWorker,
    pub auth: Arc<dyn AuthVerifier>,
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub notifications: Arc<NotificationRegistry>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        pool: Arc<dyn BrowserPool>,
        driver: Arc<dyn BrowserDriver>,
        worker: RunWorker,
        auth: Arc<dyn AuthVerifier>,
        scheduler: Arc<Scheduler>,
        config: Arc<Config>,
        sessions: Arc<SessionRegistry>,
        notifications: Arc<NotificationRegistry>,
    ) -> Self {
        Self {
            db,
            pool,
            driver,
            worker,
            auth,
            scheduler,
            config,
            sessions,
            notifications,
        }
    }
}
