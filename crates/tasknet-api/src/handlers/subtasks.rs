//! /subtasks handlers: the ledger and each subtask's message trail.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use tasknet_services::history::HistoryRecord;
use tasknet_services::ledger::LedgerEntry;

use super::ApiState;

// ── /subtasks (GET) ───────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SubtasksResponse {
    pub subtasks: Vec<LedgerEntry>,
}

pub async fn handle_subtasks(State(state): State<ApiState>) -> Json<SubtasksResponse> {
    Json(SubtasksResponse {
        subtasks: state.stores.ledger.list(),
    })
}

// ── /subtasks/{id} (GET) ──────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SubtaskInspectResponse {
    pub entry: LedgerEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_key_id: Option<String>,
    pub history: Vec<HistoryRecord>,
}

pub async fn handle_subtask_inspect(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SubtaskInspectResponse>, (StatusCode, String)> {
    let entry = state
        .stores
        .ledger
        .get(&id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown subtask {id}")))?;

    Ok(Json(SubtaskInspectResponse {
        owner_key_id: state.stores.directory.subtask_owner(&id).map(hex::encode),
        history: state.stores.history.for_subtask(&id),
        entry,
    }))
}
