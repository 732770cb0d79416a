//! Local arbiter outbox.
//!
//! The daemon has no arbiter service to talk to; fired submissions are
//! logged and, when history persistence is on, written to the database so
//! an operator can forward them.

use std::sync::Arc;

use tasknet_services::escalation::{Arbiter, Submission};

use crate::history_db::HistoryDb;

pub struct ArbiterOutbox {
    db: Option<Arc<HistoryDb>>,
}

impl ArbiterOutbox {
    pub fn new(db: Option<Arc<HistoryDb>>) -> Self {
        Self { db }
    }
}

impl Arbiter for ArbiterOutbox {
    fn submit(&self, submission: &Submission) {
        tracing::info!(
            id = submission.id,
            subtask = %submission.subtask_id,
            class = %submission.class,
            attempt = submission.attempt,
            "arbiter submission queued"
        );
        if let Some(db) = &self.db {
            if let Err(e) = db.record_submission(submission) {
                tracing::warn!(error = %e, id = submission.id, "failed to store arbiter submission");
            }
        }
    }
}
