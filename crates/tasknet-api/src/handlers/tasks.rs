//! /tasks and /offers handlers.
//!
//! `POST /tasks` creates a task this node owns and returns its signed
//! header. `POST /offers` takes such a header (from any node) and has this
//! node offer to compute it.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use tasknet_core::task::TaskHeader;
use tasknet_core::Signed;
use tasknet_services::tasks::{TaskError, TaskSpec, TaskView};

use super::ApiState;

// ── /tasks (GET) ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct TasksResponse {
    pub tasks: Vec<TaskView>,
}

pub async fn handle_tasks(State(state): State<ApiState>) -> Json<TasksResponse> {
    Json(TasksResponse {
        tasks: state.board.list(),
    })
}

pub async fn handle_task_inspect(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, (StatusCode, String)> {
    state
        .board
        .get(&id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown task {id}")))
}

// ── /tasks (POST) ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct TaskCreateResponse {
    pub task_id: String,
    pub header: Signed<TaskHeader>,
}

pub async fn handle_task_create(
    State(state): State<ApiState>,
    Json(spec): Json<TaskSpec>,
) -> Result<Json<TaskCreateResponse>, (StatusCode, String)> {
    if spec.max_price > state.config.max_price {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("max_price exceeds the node limit of {}", state.config.max_price),
        ));
    }
    let header = state
        .board
        .create(spec, &state.keypair, state.owner_info())
        .map_err(|e| match e {
            TaskError::Invalid(_) => (StatusCode::BAD_REQUEST, e.to_string()),
            TaskError::Sign(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        })?;

    Ok(Json(TaskCreateResponse {
        task_id: header.body.task_id.clone(),
        header,
    }))
}

// ── /offers (POST) ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct OfferResponse {
    pub task_id: String,
    pub owner: String,
}

pub async fn handle_offer(
    State(state): State<ApiState>,
    Json(header): Json<Signed<TaskHeader>>,
) -> Result<(StatusCode, Json<OfferResponse>), (StatusCode, String)> {
    let owner = header.body.task_owner.key;
    if !header.verify(&owner) {
        return Err((
            StatusCode::BAD_REQUEST,
            "header is not signed by its owner".to_string(),
        ));
    }
    if owner == state.keypair.public {
        return Err((StatusCode::BAD_REQUEST, "cannot offer for our own task".to_string()));
    }
    if !header.body.task_owner.is_reachable() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "task owner advertises no address".to_string(),
        ));
    }

    let resp = OfferResponse {
        task_id: header.body.task_id.clone(),
        owner: hex::encode(owner),
    };
    state
        .offers
        .send(header)
        .map_err(|_| (StatusCode::SERVICE_UNAVAILABLE, "session initiator stopped".to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(resp)))
}
