//! HTTP request handlers and the error-to-response mapping every handler
//! in this module (and `ws.rs`) shares.

use super::types::{
    AbortResponse, ErrorResponse, InterpretStatusResponse, RecordActiveResponse,
    RecordActiveTabsResponse, RecordActiveUrlResponse, RecordStartResponse, ScheduleRequest,
    StartRunRequest, StartRunResponse, SuccessResponse,
};
use super::AppState;
use crate::auth::{AuthError, AuthenticatedUser};
use crate::browser_pool::{PoolError, SlotPurpose};
use crate::db::{DbError, RunOrigin};
use crate::run_machine::TransitionError;
use crate::scheduler::SchedulerError;
use crate::worker::WorkerError;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use std::time::Duration;

/// Budget for `POST /record/start` to observe the slot reach `ready`
/// before returning `pending: true` and leaving the launch running in the
/// background — matches the `RecordStartResponse::pending` doc comment.
const RECORD_READY_BUDGET: Duration = Duration::from_secs(15);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/record/start", post(record_start))
        .route("/record/stop/:browser_id", post(record_stop))
        .route("/record/active", get(record_active))
        .route("/record/active/url", get(record_active_url))
        .route("/record/active/tabs", get(record_active_tabs))
        .route("/record/interpret", post(record_interpret))
        .route("/record/interpret/stop", post(record_interpret_stop))
        .route("/storage/runs/:robot_id", put(start_run))
        .route("/storage/runs/abort/:run_id", post(abort_run))
        .route(
            "/storage/schedule/:robot_id",
            put(set_schedule).get(get_schedule).delete(clear_schedule),
        )
        .route("/storage/recordings", get(list_recordings))
        .route("/storage/recordings/:id", get(get_recording).delete(delete_recording))
        .route("/storage/recordings/:id/runs", get(list_recording_runs))
        .route("/ws/queued-run", get(super::ws::queued_run_ws))
        .route("/ws/:browser_id", get(super::ws::session_ws))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser, AppError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    state.auth.verify(header).await.map_err(AppError::from)
}

fn require_owner(actual_user_id: &str, user: &AuthenticatedUser) -> Result<(), AppError> {
    if actual_user_id != user.user_id {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

// ============================================================
// Recording session (spec §4.2 — authoring-time browser control)
// ============================================================

async fn record_start(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RecordStartResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let browser_id = state
        .pool
        .reserve_slot(&user.user_id, SlotPurpose::Recording)
        .await
        .ok_or(AppError::AdmissionDenied)?;

    let pool = state.pool.clone();
    let upgrade_id = browser_id.clone();
    tokio::spawn(async move {
        if let Err(e) = pool.upgrade_slot(&upgrade_id).await {
            tracing::warn!(browser_id = %upgrade_id, error = %e, "recording slot failed to launch");
        }
    });

    let pending = state
        .pool
        .wait_ready(&browser_id, RECORD_READY_BUDGET)
        .await
        .is_err();

    Ok(Json(RecordStartResponse { browser_id, pending }))
}

async fn record_stop(
    State(state): State<AppState>,
    Path(browser_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let slot = state.pool.get_slot(&browser_id).await.ok_or(AppError::ResourceMissing)?;
    require_owner(&slot.user_id, &user)?;
    state.pool.destroy_slot(&browser_id).await;
    Ok(Json(SuccessResponse { success: true }))
}

async fn record_active(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RecordActiveResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let browser_id = state
        .pool
        .get_active_for_user_by_purpose(&user.user_id, SlotPurpose::Recording)
        .await;
    Ok(Json(RecordActiveResponse { browser_id }))
}

async fn record_active_url(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RecordActiveUrlResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    state
        .pool
        .get_active_for_user_by_purpose(&user.user_id, SlotPurpose::Recording)
        .await
        .ok_or(AppError::ResourceMissing)?;
    // The driver port exposes no current-page introspection; see
    // RecordActiveUrlResponse's doc comment.
    Ok(Json(RecordActiveUrlResponse { url: None }))
}

async fn record_active_tabs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RecordActiveTabsResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    state
        .pool
        .get_active_for_user_by_purpose(&user.user_id, SlotPurpose::Recording)
        .await
        .ok_or(AppError::ResourceMissing)?;
    Ok(Json(RecordActiveTabsResponse { tabs: Vec::new() }))
}

async fn record_interpret(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<InterpretStatusResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    state
        .pool
        .get_active_for_user_by_purpose(&user.user_id, SlotPurpose::Recording)
        .await
        .ok_or(AppError::ResourceMissing)?;
    Ok(Json(InterpretStatusResponse { status: "started".to_string() }))
}

async fn record_interpret_stop(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<InterpretStatusResponse>, AppError> {
    authenticate(&state, &headers).await?;
    Ok(Json(InterpretStatusResponse { status: "stopped".to_string() }))
}

// ============================================================
// Run admission and abort (spec §4.4)
// ============================================================

async fn start_run(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    headers: HeaderMap,
    Json(_req): Json<StartRunRequest>,
) -> Result<Json<StartRunResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let robot = state.db.get_robot(&robot_id).map_err(AppError::from)?;
    require_owner(&robot.user_id, &user)?;

    let run_id = state
        .worker
        .start_run(&user.user_id, &robot_id, RunOrigin::RunByApi)
        .await
        .map_err(AppError::from)?;
    let run = state.db.get_run(&run_id).map_err(AppError::from)?;

    Ok(Json(StartRunResponse {
        browser_id: run.browser_id,
        run_id: run.id,
        robot_meta_id: robot_id,
        queued: run.status == crate::db::RunStatus::Queued,
    }))
}

async fn abort_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AbortResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let outcome = state
        .worker
        .request_abort(&user.user_id, &run_id)
        .await
        .map_err(AppError::from)?;
    Ok(Json(AbortResponse {
        success: true,
        is_queued: outcome.is_queued,
    }))
}

// ============================================================
// Schedule CRUD (spec §4.3)
// ============================================================

async fn set_schedule(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    headers: HeaderMap,
    Json(spec): Json<ScheduleRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let robot = state.db.get_robot(&robot_id).map_err(AppError::from)?;
    require_owner(&robot.user_id, &user)?;

    state.scheduler.schedule_workflow(&robot, &spec).map_err(AppError::from)?;
    state
        .db
        .update_robot_schedule(&robot_id, Some(&spec))
        .map_err(AppError::from)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Option<ScheduleRequest>>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let robot = state.db.get_robot(&robot_id).map_err(AppError::from)?;
    require_owner(&robot.user_id, &user)?;
    Ok(Json(robot.schedule))
}

async fn clear_schedule(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let robot = state.db.get_robot(&robot_id).map_err(AppError::from)?;
    require_owner(&robot.user_id, &user)?;

    state.scheduler.cancel_scheduled_workflow(&robot_id).map_err(AppError::from)?;
    state.db.update_robot_schedule(&robot_id, None).map_err(AppError::from)?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Recordings enumeration (spec §4.1 — robots-as-recordings)
// ============================================================

async fn list_recordings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::db::Robot>>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let robots = state.db.list_robots_for_user(&user.user_id).map_err(AppError::from)?;
    Ok(Json(robots))
}

async fn get_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<crate::db::Robot>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let robot = state.db.get_robot(&id).map_err(AppError::from)?;
    require_owner(&robot.user_id, &user)?;
    Ok(Json(robot))
}

async fn delete_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let robot = state.db.get_robot(&id).map_err(AppError::from)?;
    require_owner(&robot.user_id, &user)?;
    state.db.delete_robot(&id).map_err(AppError::from)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn list_recording_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::db::Run>>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let robot = state.db.get_robot(&id).map_err(AppError::from)?;
    require_owner(&robot.user_id, &user)?;
    let runs = state.db.list_runs_for_robot(&id).map_err(AppError::from)?;
    Ok(Json(runs))
}

// ============================================================
// Error handling
// ============================================================

/// Mirrors the spec's error taxonomy (§7): every module's own error enum
/// converts into one of these cases rather than leaking its internal
/// variants across the HTTP boundary.
pub enum AppError {
    AdmissionDenied,
    ResourceMissing,
    Unauthorized,
    Forbidden,
    Timeout,
    DriverError(String),
    QueueError(String),
    Validation(String),
    Conflict(String),
    Internal(String),
}

pub fn app_error_response(err: AppError) -> Response {
    let (status, code, message) = match err {
        AppError::AdmissionDenied => (
            StatusCode::CONFLICT,
            "admission_denied",
            "No browser slot available for this user".to_string(),
        ),
        AppError::ResourceMissing => (
            StatusCode::NOT_FOUND,
            "resource_missing",
            "Resource not found".to_string(),
        ),
        AppError::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid credentials".to_string(),
        ),
        AppError::Forbidden => (
            StatusCode::FORBIDDEN,
            "forbidden",
            "Not allowed to access this resource".to_string(),
        ),
        AppError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            "timeout",
            "Operation timed out".to_string(),
        ),
        AppError::DriverError(msg) => (StatusCode::BAD_GATEWAY, "driver_error", msg),
        AppError::QueueError(msg) => (StatusCode::SERVICE_UNAVAILABLE, "queue_error", msg),
        AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation", msg),
        AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
        AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
    };
    (status, Json(ErrorResponse::new(message, code))).into_response()
}

impl From<AuthError> for AppError {
    fn from(_: AuthError) -> Self {
        AppError::Unauthorized
    }
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::RobotNotFound(_)
            | DbError::RunNotFound(_)
            | DbError::UserNotFound(_)
            | DbError::SessionNotFound(_) => AppError::ResourceMissing,
            DbError::Sqlite(_) | DbError::Serde(_) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<PoolError> for AppError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::SlotNotFound(_) => AppError::ResourceMissing,
            PoolError::ReadyTimeout => AppError::Timeout,
            PoolError::Driver(e) => AppError::DriverError(e.to_string()),
        }
    }
}

impl From<SchedulerError> for AppError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidSchedule(msg) | SchedulerError::UnknownTimezone(msg) => {
                AppError::Validation(msg)
            }
            SchedulerError::Db(e) => e.into(),
        }
    }
}

impl From<WorkerError> for AppError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Db(e) => e.into(),
            WorkerError::Queue(e) => AppError::QueueError(e.to_string()),
            WorkerError::Pool(e) => e.into(),
            WorkerError::Driver(e) => AppError::DriverError(e.to_string()),
            WorkerError::Interpret(e) => AppError::Internal(e.to_string()),
            WorkerError::ObjectStore(e) => AppError::Internal(e.to_string()),
            WorkerError::Transition(TransitionError::AlreadyTerminal) => {
                AppError::Conflict("run has already finished".to_string())
            }
            WorkerError::Transition(TransitionError::InvalidEvent) => {
                AppError::Conflict("run is not in a state that accepts this action".to_string())
            }
            WorkerError::Payload(e) => AppError::Validation(e.to_string()),
        }
    }
}
