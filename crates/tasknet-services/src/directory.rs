//! Session directory: who owns which task, which subtask belongs to which
//! task, and which live session to route a subtask's events through.
//!
//! Shared by every session of a node. Authorization checks for incoming
//! accept/reject messages read the recorded owner from here, never from the
//! message itself.

use crate::session::{SessionHandle, SessionInfo, SessionState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tasknet_core::crypto::PublicKey;

#[derive(Clone, Default)]
pub struct SessionDirectory {
    /// subtask_id → task_id
    subtask_task: Arc<DashMap<String, String>>,
    /// task_id → owner public key
    task_owner: Arc<DashMap<String, PublicKey>>,
    /// task_id → offers sent and not yet answered (provider side)
    requests: Arc<DashMap<String, u32>>,
    /// subtask_id → live session
    routes: Arc<DashMap<String, SessionHandle>>,
    /// session id → summary for the status API
    sessions: Arc<DashMap<u64, SessionInfo>>,
    next_session: Arc<AtomicU64>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Task / subtask ownership ──────────────────────────────────────────────

    /// Record `owner` for `task_id` unless an owner is already recorded.
    /// Returns whether `owner` is the recorded owner afterwards.
    pub fn register_task_owner(&self, task_id: &str, owner: PublicKey) -> bool {
        *self.task_owner.entry(task_id.to_string()).or_insert(owner) == owner
    }

    /// Map `subtask_id` to `task_id` owned by `owner`. Existing mappings are
    /// never replaced; false if one disagrees.
    pub fn register_subtask(&self, subtask_id: &str, task_id: &str, owner: PublicKey) -> bool {
        if !self.register_task_owner(task_id, owner) {
            return false;
        }
        match self.subtask_task.entry(subtask_id.to_string()) {
            Entry::Occupied(known) => known.get() == task_id,
            Entry::Vacant(slot) => {
                slot.insert(task_id.to_string());
                true
            }
        }
    }

    pub fn task_for(&self, subtask_id: &str) -> Option<String> {
        self.subtask_task.get(subtask_id).map(|t| t.value().clone())
    }

    pub fn owner_of(&self, task_id: &str) -> Option<PublicKey> {
        self.task_owner.get(task_id).map(|o| *o.value())
    }

    pub fn subtask_owner(&self, subtask_id: &str) -> Option<PublicKey> {
        self.task_for(subtask_id)
            .and_then(|task_id| self.owner_of(&task_id))
    }

    /// True iff `sender` is the recorded owner of the subtask's task.
    pub fn is_authorized(&self, subtask_id: &str, sender: &PublicKey) -> bool {
        self.subtask_owner(subtask_id)
            .is_some_and(|owner| &owner == sender)
    }

    // ── Requests in flight ────────────────────────────────────────────────────

    pub fn add_request(&self, task_id: &str) {
        *self.requests.entry(task_id.to_string()).or_insert(0) += 1;
    }

    /// The owner refused or fulfilled an offer. Counts only when `sender`
    /// owns the task; returns whether the counter moved.
    pub fn cancel_request(&self, task_id: &str, sender: &PublicKey) -> bool {
        if self.owner_of(task_id).as_ref() != Some(sender) {
            return false;
        }
        match self.requests.get_mut(task_id) {
            Some(mut count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn requests_in_flight(&self, task_id: &str) -> u32 {
        self.requests.get(task_id).map(|c| *c.value()).unwrap_or(0)
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    pub fn bind_session(&self, subtask_id: &str, handle: SessionHandle) {
        self.routes.insert(subtask_id.to_string(), handle);
    }

    /// Live session for a subtask. Stale handles are dropped on lookup.
    pub fn session_for(&self, subtask_id: &str) -> Option<SessionHandle> {
        let handle = self.routes.get(subtask_id).map(|h| h.value().clone())?;
        if handle.is_alive() {
            Some(handle)
        } else {
            self.routes.remove(subtask_id);
            None
        }
    }

    // ── Session summaries ─────────────────────────────────────────────────────

    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn update_session(&self, info: SessionInfo) {
        self.sessions.insert(info.id, info);
    }

    /// Forget a closed session and every route through it.
    pub fn remove_session(&self, session_id: u64) {
        self.sessions.remove(&session_id);
        self.routes.retain(|_, handle| handle.id() != session_id);
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self.sessions.iter().map(|s| s.value().clone()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn verified_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state == SessionState::Verified)
            .count()
    }
}
