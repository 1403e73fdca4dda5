//! REST request and response bodies.
//!
//! Where a response is just a stored row, the handler returns the
//! `db` type directly (it already derives `Serialize`) rather than
//! wrapping it in a redundant DTO.

use crate::db::ScheduleSpec;
use serde::{Deserialize, Serialize};

/// Body for `PUT /storage/runs/:robotId`. `settings` is accepted for
/// parity with the spec's "interpreter settings" payload but the
/// reference interpreter port doesn't thread per-run settings through
/// yet, so it's stored nowhere — see DESIGN.md.
#[derive(Debug, Default, Deserialize)]
pub struct StartRunRequest {
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub browser_id: Option<String>,
    pub run_id: String,
    pub robot_meta_id: String,
    pub queued: bool,
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub success: bool,
    pub is_queued: bool,
}

#[derive(Debug, Serialize)]
pub struct RecordStartResponse {
    pub browser_id: String,
    /// True if the slot hadn't reached `ready` within the 15s budget —
    /// the caller polls `/record/active` rather than getting a job id,
    /// since there's no separate job-tracking surface for recording
    /// sessions in this port set.
    pub pending: bool,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct RecordActiveResponse {
    pub browser_id: Option<String>,
}

/// The driver port doesn't expose current-page introspection (out of
/// scope per spec §1 — "the headless browser driver and DOM interaction
/// recording"); these fields are always empty placeholders.
#[derive(Debug, Serialize)]
pub struct RecordActiveUrlResponse {
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecordActiveTabsResponse {
    pub tabs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct InterpretStatusResponse {
    pub status: String,
}

pub type ScheduleRequest = ScheduleSpec;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>, code: &'static str) -> Self {
        Self {
            error: message.into(),
            code: code.to_string(),
        }
    }
}
