//! Request handlers and the error → status-code mapping.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use capstan_core::{Build, Capsule, Change, Error};

use crate::ApiState;

/// Response wrapper shared by every endpoint.
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

/// HTTP status for an engine error kind.
fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::AlreadyExists(_)
        | Error::FailedPrecondition(_)
        | Error::StaleVersion(_)
        | Error::Aborted(_) => StatusCode::CONFLICT,
        Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> axum::response::Response {
    (
        status_code(err),
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
        }),
    )
        .into_response()
}

// ── Capsules ───────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct CreateCapsuleRequest {
    pub project_id: Uuid,
    pub name: String,
}

/// POST /api/v1/capsules
pub async fn create_capsule(
    State(state): State<ApiState>,
    Json(req): Json<CreateCapsuleRequest>,
) -> impl IntoResponse {
    let capsule = Capsule {
        id: Uuid::new_v4(),
        project_id: req.project_id,
        name: req.name,
        current_rollout: 0,
    };
    match state.store.create_capsule(&capsule) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(capsule)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// GET /api/v1/capsules
pub async fn list_capsules(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_capsules() {
        Ok(capsules) => ApiResponse::ok(capsules).into_response(),
        Err(err) => error_response(&err),
    }
}

/// GET /api/v1/capsules/{capsule_id}
pub async fn get_capsule(
    State(state): State<ApiState>,
    Path(capsule_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.get_capsule(capsule_id) {
        Ok(capsule) => ApiResponse::ok(capsule).into_response(),
        Err(err) => error_response(&err),
    }
}

// ── Builds ─────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct RegisterBuildRequest {
    pub build_id: String,
    pub image: String,
}

/// POST /api/v1/capsules/{capsule_id}/builds
pub async fn register_build(
    State(state): State<ApiState>,
    Path(capsule_id): Path<Uuid>,
    Json(req): Json<RegisterBuildRequest>,
) -> impl IntoResponse {
    // Builds hang off a capsule; reject registrations for unknown ones.
    if let Err(err) = state.store.get_capsule(capsule_id) {
        return error_response(&err);
    }

    let build = Build {
        id: req.build_id,
        image: req.image,
        created_at: Utc::now(),
    };
    match state.store.create_build(capsule_id, &build) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(build)).into_response(),
        Err(err) => error_response(&err),
    }
}

// ── Rollouts ───────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct NewRolloutRequest {
    pub changes: Vec<Change>,
}

#[derive(serde::Serialize)]
pub struct NewRolloutResponse {
    pub rollout_id: u64,
}

/// POST /api/v1/capsules/{capsule_id}/rollouts
pub async fn new_rollout(
    State(state): State<ApiState>,
    Path(capsule_id): Path<Uuid>,
    Json(req): Json<NewRolloutRequest>,
) -> impl IntoResponse {
    match state.service.new_rollout(capsule_id, req.changes).await {
        Ok(rollout_id) => (
            StatusCode::CREATED,
            ApiResponse::ok(NewRolloutResponse { rollout_id }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// GET /api/v1/capsules/{capsule_id}/rollouts/{rollout_id}
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path((capsule_id, rollout_id)): Path<(Uuid, u64)>,
) -> impl IntoResponse {
    match state.service.get_rollout(capsule_id, rollout_id).await {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(err) => error_response(&err),
    }
}

/// POST /api/v1/capsules/{capsule_id}/rollouts/{rollout_id}/abort
pub async fn abort_rollout(
    State(state): State<ApiState>,
    Path((capsule_id, rollout_id)): Path<(Uuid, u64)>,
) -> impl IntoResponse {
    match state.service.abort_rollout(capsule_id, rollout_id).await {
        Ok(()) => ApiResponse::ok(()).into_response(),
        Err(err) => error_response(&err),
    }
}

/// GET /api/v1/capsules/{capsule_id}/rollouts/{rollout_id}/events
pub async fn list_events(
    State(state): State<ApiState>,
    Path((capsule_id, rollout_id)): Path<(Uuid, u64)>,
) -> impl IntoResponse {
    match state.service.list_events(capsule_id, rollout_id).await {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(err) => error_response(&err),
    }
}
