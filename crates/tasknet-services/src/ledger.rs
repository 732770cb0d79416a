//! Subtask ledger: the authoritative outcome record for every subtask.
//!
//! States move forward only:
//!
//! ```text
//!   Assigned → Reported → Verifying ─┬→ Accepted ─┐
//!                  │          │      └→ Rejected ─┼→ Closed
//!                  └──────────┴→ Escalated ───────┘
//! ```
//!
//! `finalize` records the single terminal outcome. It succeeds exactly once
//! per subtask; every later attempt gets `LedgerError::AlreadyFinal`, which
//! is what makes replayed reports and acknowledgements harmless.

use crate::history::Actor;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tasknet_core::task::now_secs;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskState {
    Assigned,
    Reported,
    Verifying,
    Accepted,
    Rejected,
    Escalated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Accepted,
    Rejected,
}

impl SubtaskState {
    fn can_advance_to(self, next: SubtaskState) -> bool {
        use SubtaskState::*;
        matches!(
            (self, next),
            (Assigned, Reported)
                | (Reported, Verifying)
                | (Reported, Escalated)
                | (Verifying, Escalated)
                | (Escalated, Verifying)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub subtask_id: String,
    pub task_id: String,
    /// Hex key of the other party.
    pub peer_key_id: String,
    /// Our role for this subtask.
    pub role: Actor,
    pub state: SubtaskState,
    pub outcome: Option<Outcome>,
    pub updated_at: u64,
}

impl LedgerEntry {
    /// Past `Assigned`: a report was seen or the entry is finished.
    pub fn is_reported(&self) -> bool {
        self.state != SubtaskState::Assigned
    }

    pub fn is_final(&self) -> bool {
        self.outcome.is_some() || self.state == SubtaskState::Closed
    }
}

#[derive(Clone, Default)]
pub struct SubtaskLedger {
    entries: Arc<DashMap<String, LedgerEntry>>,
}

impl SubtaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an `Assigned` entry. Returns false if the subtask is already
    /// known; the existing entry is left untouched.
    pub fn assign(&self, subtask_id: &str, task_id: &str, peer_key_id: &str, role: Actor) -> bool {
        let mut created = false;
        self.entries
            .entry(subtask_id.to_string())
            .or_insert_with(|| {
                created = true;
                LedgerEntry {
                    subtask_id: subtask_id.to_string(),
                    task_id: task_id.to_string(),
                    peer_key_id: peer_key_id.to_string(),
                    role,
                    state: SubtaskState::Assigned,
                    outcome: None,
                    updated_at: now_secs(),
                }
            });
        if created {
            tracing::debug!(subtask = subtask_id, task = task_id, ?role, "subtask assigned");
        }
        created
    }

    /// Move a non-final entry to `next`.
    pub fn advance(&self, subtask_id: &str, next: SubtaskState) -> Result<SubtaskState, LedgerError> {
        let mut entry = self
            .entries
            .get_mut(subtask_id)
            .ok_or_else(|| LedgerError::Unknown(subtask_id.to_string()))?;
        if entry.is_final() {
            return Err(LedgerError::AlreadyFinal {
                subtask_id: subtask_id.to_string(),
                state: entry.state,
            });
        }
        let prev = entry.state;
        if prev == next {
            return Ok(prev);
        }
        if !prev.can_advance_to(next) {
            return Err(LedgerError::InvalidTransition { from: prev, to: next });
        }
        entry.state = next;
        entry.updated_at = now_secs();
        tracing::debug!(subtask = subtask_id, from = ?prev, to = ?next, "subtask state");
        Ok(prev)
    }

    /// Record the terminal outcome. Succeeds exactly once per subtask.
    pub fn finalize(&self, subtask_id: &str, outcome: Outcome) -> Result<(), LedgerError> {
        let mut entry = self
            .entries
            .get_mut(subtask_id)
            .ok_or_else(|| LedgerError::Unknown(subtask_id.to_string()))?;
        if entry.is_final() {
            return Err(LedgerError::AlreadyFinal {
                subtask_id: subtask_id.to_string(),
                state: entry.state,
            });
        }
        entry.outcome = Some(outcome);
        entry.state = match outcome {
            Outcome::Accepted => SubtaskState::Accepted,
            Outcome::Rejected => SubtaskState::Rejected,
        };
        entry.updated_at = now_secs();
        tracing::info!(subtask = subtask_id, ?outcome, "subtask finalized");
        Ok(())
    }

    /// Close an entry, keeping any outcome. Idempotent.
    pub fn close(&self, subtask_id: &str) -> Result<(), LedgerError> {
        let mut entry = self
            .entries
            .get_mut(subtask_id)
            .ok_or_else(|| LedgerError::Unknown(subtask_id.to_string()))?;
        if entry.state != SubtaskState::Closed {
            entry.state = SubtaskState::Closed;
            entry.updated_at = now_secs();
        }
        Ok(())
    }

    pub fn get(&self, subtask_id: &str) -> Option<LedgerEntry> {
        self.entries.get(subtask_id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<LedgerEntry> {
        let mut out: Vec<LedgerEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.subtask_id.cmp(&b.subtask_id));
        out
    }

    /// (accepted, rejected, open)
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut accepted = 0;
        let mut rejected = 0;
        let mut open = 0;
        for entry in self.entries.iter() {
            match entry.outcome {
                Some(Outcome::Accepted) => accepted += 1,
                Some(Outcome::Rejected) => rejected += 1,
                None => open += 1,
            }
        }
        (accepted, rejected, open)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown subtask {0}")]
    Unknown(String),

    #[error("subtask {subtask_id} is already final ({state:?})")]
    AlreadyFinal {
        subtask_id: String,
        state: SubtaskState,
    },

    #[error("cannot move subtask from {from:?} to {to:?}")]
    InvalidTransition { from: SubtaskState, to: SubtaskState },
}
