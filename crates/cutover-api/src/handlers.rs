//! REST API handlers.
//!
//! Each handler reads or writes through the state crate and returns the
//! `{success, data, error}` JSON envelope.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info};
use uuid::Uuid;

use cutover_core::*;
use cutover_state::StateError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map a state error onto an HTTP status.
pub(crate) fn state_error(e: &StateError) -> Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::AlreadyExists(_)
        | StateError::ActiveDeployment { .. }
        | StateError::AlreadyFinished(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

pub(crate) fn parse_deployment_id(id: &str) -> Result<DeploymentId, Response> {
    Uuid::parse_str(id).map_err(|_| {
        error_response(
            &format!("invalid deployment id: {id}"),
            StatusCode::BAD_REQUEST,
        )
    })
}

// ── Deployments ────────────────────────────────────────────────

/// POST /api/v1/deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    Json(req): Json<NewDeployment>,
) -> Response {
    if req.app_id.is_empty() || req.old_release_id.is_empty() || req.new_release_id.is_empty() {
        return error_response(
            "app_id, old_release_id and new_release_id are required",
            StatusCode::BAD_REQUEST,
        );
    }
    if req.old_release_id == req.new_release_id {
        return error_response(
            "old and new release must differ",
            StatusCode::BAD_REQUEST,
        );
    }

    match state.repo.add(&req) {
        Ok(deployment) => (StatusCode::CREATED, ApiResponse::ok(deployment)).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = match parse_deployment_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.repo.get(&id) {
        Ok(deployment) => ApiResponse::ok(deployment).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Formations ─────────────────────────────────────────────────

/// Formation overwrite body.
#[derive(serde::Deserialize)]
pub struct FormationRequest {
    #[serde(default)]
    pub processes: BTreeMap<String, u32>,
}

/// GET /api/v1/apps/{app}/releases/{release}/formation
pub async fn get_formation(
    State(state): State<ApiState>,
    Path((app, release)): Path<(String, String)>,
) -> Response {
    match state.store.get_formation(&app, &release) {
        Ok(formation) => ApiResponse::ok(formation).into_response(),
        Err(e) => state_error(&e),
    }
}

/// PUT /api/v1/apps/{app}/releases/{release}/formation
///
/// 409 while an unfinished deployment of the app moves this release.
pub async fn put_formation(
    State(state): State<ApiState>,
    Path((app, release)): Path<(String, String)>,
    Json(req): Json<FormationRequest>,
) -> Response {
    let formation = Formation::new(&app, &release, req.processes);
    match state.store.put_formation_unless_deploying(&formation) {
        Ok(stored) => {
            info!(%app, %release, processes = ?stored.processes, "formation updated");
            ApiResponse::ok(stored).into_response()
        }
        Err(e) => state_error(&e),
    }
}

// ── Job events ─────────────────────────────────────────────────

/// Job event report from the scheduler. The app comes from the path.
#[derive(serde::Deserialize)]
pub struct JobEventReport {
    pub release_id: ReleaseId,
    pub job_id: String,
    pub process_type: String,
    pub state: JobState,
}

/// POST /api/v1/apps/{app}/job-events
pub async fn report_job_event(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(report): Json<JobEventReport>,
) -> Response {
    let event = JobEvent {
        app_id: app,
        release_id: report.release_id,
        job_id: report.job_id,
        process_type: report.process_type,
        state: report.state,
    };
    debug!(
        app = %event.app_id,
        job = %event.job_id,
        state = %event.state,
        "job event reported"
    );
    let subscribers = state.bus.publish(event);
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(serde_json::json!({ "subscribers": subscribers })),
    )
        .into_response()
}
