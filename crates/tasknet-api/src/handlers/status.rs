//! /status, /sessions, /escalations handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use tasknet_services::escalation::EscalationView;
use tasknet_services::session::SessionInfo;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_name: String,
    pub key_id: String,
    pub concent_enabled: bool,
    pub sessions: usize,
    pub verified_sessions: usize,
    pub tasks: usize,
    pub subtasks: SubtaskCounts,
    pub history_records: usize,
    pub escalations_pending: usize,
}

#[derive(Serialize)]
pub struct SubtaskCounts {
    pub accepted: usize,
    pub rejected: usize,
    pub open: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let (accepted, rejected, open) = state.stores.ledger.counts();
    let escalations_pending = state
        .stores
        .escalation
        .list()
        .iter()
        .filter(|e| e.state == tasknet_services::escalation::SubmissionState::Pending)
        .count();

    Json(StatusResponse {
        node_name: state.config.node_name.clone(),
        key_id: state.keypair.key_id(),
        concent_enabled: state.config.concent_enabled,
        sessions: state.stores.directory.sessions().len(),
        verified_sessions: state.stores.directory.verified_sessions(),
        tasks: state.board.len(),
        subtasks: SubtaskCounts {
            accepted,
            rejected,
            open,
        },
        history_records: state.stores.history.len(),
        escalations_pending,
    })
}

// ── /sessions ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.stores.directory.sessions(),
    })
}

// ── /escalations ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EscalationsResponse {
    pub enabled: bool,
    pub escalations: Vec<EscalationView>,
}

pub async fn handle_escalations(State(state): State<ApiState>) -> Json<EscalationsResponse> {
    Json(EscalationsResponse {
        enabled: state.stores.escalation.is_enabled(),
        escalations: state.stores.escalation.list(),
    })
}
