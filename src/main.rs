//! robotium - control plane for a pool of remote headless-browser sessions.
//!
//! Wires every port to its production adapter, recovers orphaned runs left
//! over from a crash, spawns the background loops (queue discovery, pool
//! GC, queued-run admission retries, the cron scheduler), and serves the
//! HTTP + WebSocket surface.

mod api;
mod auth;
mod browser_driver;
mod browser_pool;
mod clock;
mod config;
mod db;
mod integrations;
mod interpreter;
mod object_store;
mod queue;
mod run_machine;
mod scheduler;
mod worker;

use api::{create_router, AppState};
use auth::JwtVerifier;
use browser_driver::ChromiumoxideDriver;
use browser_pool::ProductionBrowserPool;
use config::Config;
use db::Database;
use integrations::{Dispatcher, HttpPipelinePusher};
use interpreter::ReferenceInterpreter;
use object_store::LocalObjectStore;
use queue::SqliteJobQueue;
use scheduler::Scheduler;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker::{recover_orphaned_runs, QueueRegistry, RunWorker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "robotium=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(Config::from_env());

    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    tracing::info!(path = %config.db_path, "opening record store");
    let db = Database::open(&config.db_path)?;

    let driver = Arc::new(ChromiumoxideDriver::default());
    let pool = ProductionBrowserPool::new(driver.clone(), db.clone(), config.max_slots_per_user);
    let queue = SqliteJobQueue::new(db.clone(), config.job_visibility_timeout());
    let auth = Arc::new(JwtVerifier::new(&config.jwt_secret));
    let object_store = Arc::new(LocalObjectStore::new(PathBuf::from(&config.object_store_root)));
    let interpreter = Arc::new(ReferenceInterpreter::new(driver.clone(), object_store));
    let scheduler = Arc::new(Scheduler::new(db.clone()));
    let pusher = HttpPipelinePusher::new(config.integration_webhook_url.clone());
    let dispatcher = Dispatcher::new(db.clone(), pusher);

    let sessions = api::SessionRegistry::new(config.namespace_settle_delay);
    let notifications = api::NotificationRegistry::new();
    let notifier = api::WsNotifier::new(db.clone(), notifications.clone());

    let worker = RunWorker::new(
        db.clone(),
        pool.clone(),
        queue.clone(),
        interpreter,
        notifier,
        dispatcher,
        config.abort_grace_period,
        config.browser_init_timeout,
        config.browser_pool_wait_timeout,
    );

    match recover_orphaned_runs(&worker).await {
        Ok(count) if count > 0 => tracing::warn!(count, "recovered orphaned runs from previous crash"),
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "orphan recovery failed"),
    }

    let registry = Arc::new(QueueRegistry::new(
        queue.clone(),
        worker.clone(),
        config.queue_discovery_interval,
    ));
    registry.spawn_legacy_consumers();
    tokio::spawn(registry.clone().run_discovery_loop());

    spawn_pool_gc(pool.clone(), config.pool_gc_interval, config.browser_destroy_timeout);
    spawn_queued_run_retry(db.clone(), worker.clone(), config.queued_run_poll_interval);
    spawn_scheduler_tick(db.clone(), scheduler.clone(), worker.clone(), config.queued_run_poll_interval);

    let state = AppState::new(
        db,
        pool.clone(),
        driver,
        worker,
        auth,
        scheduler,
        config.clone(),
        sessions,
        notifications,
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state).layer(cors).layer(compression);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "robotium listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(pool))
        .await?;

    Ok(())
}

/// Evicts slots stuck in `reserved`/`initializing`/`failed` past
/// `browser_destroy_timeout` — covers authoring sessions a client abandoned
/// without calling `record/stop`.
fn spawn_pool_gc(
    pool: Arc<dyn browser_pool::BrowserPool>,
    interval: std::time::Duration,
    stale_threshold: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            pool.cleanup_stale(stale_threshold).await;
        }
    });
}

/// Re-attempts admission for every run still sitting `queued`, on a fixed
/// tick — the counterpart to the immediate admission attempt `start_run`
/// makes, for runs that lost the race for a slot.
fn spawn_queued_run_retry(db: Database, worker: RunWorker, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = retry_all_queued(&db, &worker).await {
                tracing::warn!(error = %e, "queued-run retry sweep failed");
            }
        }
    });
}

async fn retry_all_queued(db: &Database, worker: &RunWorker) -> Result<(), worker::WorkerError> {
    for user_id in db.list_user_ids_with_robots()? {
        for run in db.list_runs_for_user_with_status(&user_id, db::RunStatus::Queued)? {
            worker.retry_admission(&run.id).await?;
        }
    }
    Ok(())
}

/// Ticks the cron scheduler: any robot whose schedule is due gets a new
/// queued run, admitted through the same `start_run` path the REST
/// endpoint uses.
fn spawn_scheduler_tick(
    db: Database,
    scheduler: Arc<Scheduler>,
    worker: RunWorker,
    interval: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let due = match scheduler.due_schedules(chrono::Utc::now()) {
                Ok(due) => due,
                Err(e) => {
                    tracing::warn!(error = %e, "scheduler tick failed");
                    continue;
                }
            };
            for (robot_id, _scheduled_at) in due {
                let robot = match db.get_robot(&robot_id) {
                    Ok(robot) => robot,
                    Err(e) => {
                        tracing::warn!(robot_id, error = %e, "scheduled robot missing, skipping fire");
                        continue;
                    }
                };
                if let Err(e) = worker
                    .start_run(&robot.user_id, &robot_id, db::RunOrigin::RunByScheduleId)
                    .await
                {
                    tracing::warn!(robot_id, error = %e, "failed to start scheduled run");
                }
            }
        }
    });
}

async fn shutdown_signal(pool: Arc<dyn browser_pool::BrowserPool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutting down, tearing down browser slots");
    pool.shutdown_all().await;
}
