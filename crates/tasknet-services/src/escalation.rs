//! Escalation to the arbiter ("concent").
//!
//! When a peer fails to answer a protocol step in time, the waiting side has
//! the arbiter force the issue. Each escalation is armed with a delay and
//! cancelled if the peer answers first.
//!
//! Submissions are keyed by `(subtask_id, message class)`. A key may hold
//! several pending submissions; each owns an atomic state that moves
//! `Pending → Fired` or `Pending → Cancelled` exactly once, so a cancel
//! racing the timer either wins entirely or loses entirely.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasknet_core::task::now_secs;
use tasknet_core::{Message, MessageKind};
use tokio::sync::Notify;

/// `ForceGetTaskResult` is sent at most this many times per subtask: once
/// delayed after the report, once immediately after a failed pull.
pub const MAX_FORCE_GET_ATTEMPTS: u32 = 2;

/// Receives submissions whose timers fired.
pub trait Arbiter: Send + Sync {
    fn submit(&self, submission: &Submission);
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: u64,
    pub subtask_id: String,
    pub class: MessageKind,
    /// 1-based count of submissions armed for this key.
    pub attempt: u32,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SubmissionState {
    Pending = 0,
    Fired = 1,
    Cancelled = 2,
}

impl SubmissionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Fired,
            2 => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

fn transition(state: &AtomicU8, to: SubmissionState) -> bool {
    state
        .compare_exchange(
            SubmissionState::Pending as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
}

/// Handle to one armed submission.
#[derive(Debug, Clone)]
pub struct EscalationHandle {
    pub id: u64,
    state: Arc<AtomicU8>,
    changed: Arc<Notify>,
}

impl EscalationHandle {
    pub fn state(&self) -> SubmissionState {
        SubmissionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Cancel this one submission. False if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = transition(&self.state, SubmissionState::Cancelled);
        if cancelled {
            self.changed.notify_waiters();
        }
        cancelled
    }
}

struct Entry {
    submission: Submission,
    state: Arc<AtomicU8>,
    delay: Duration,
    armed_at: u64,
}

/// Summary row for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationView {
    pub id: u64,
    pub subtask_id: String,
    pub class: MessageKind,
    pub attempt: u32,
    pub state: SubmissionState,
    pub delay_secs: u64,
    pub armed_at: u64,
}

type Key = (String, MessageKind);

#[derive(Clone)]
pub struct EscalationService {
    enabled: bool,
    arbiter: Arc<dyn Arbiter>,
    entries: Arc<DashMap<u64, Entry>>,
    by_key: Arc<DashMap<Key, Vec<u64>>>,
    next_id: Arc<AtomicU64>,
    /// Woken whenever a submission leaves `Pending`.
    changed: Arc<Notify>,
}

impl EscalationService {
    pub fn new(enabled: bool, arbiter: Arc<dyn Arbiter>) -> Self {
        Self {
            enabled,
            arbiter,
            entries: Arc::new(DashMap::new()),
            by_key: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Arm a submission of `message` for `subtask_id`. `None` or a zero delay
    /// submits immediately. Returns `None` when escalation is disabled.
    ///
    /// Must be called within a tokio runtime when a delay is given.
    pub fn submit(
        &self,
        subtask_id: &str,
        message: Message,
        delay: Option<Duration>,
    ) -> Option<EscalationHandle> {
        let class = message.kind();
        if !self.enabled {
            tracing::debug!(subtask = subtask_id, %class, "escalation disabled, not submitting");
            return None;
        }

        let key = (subtask_id.to_string(), class);
        let (attempt, pending) = self.key_stats(&key);
        let delay = delay.unwrap_or(Duration::ZERO);

        if class == MessageKind::ForceGetTaskResult {
            if delay.is_zero() && pending > 0 {
                // Both the delayed and the immediate submission stay armed and
                // the arbiter may see the same report twice.
                tracing::warn!(
                    subtask = subtask_id,
                    pending,
                    "immediate ForceGetTaskResult while a delayed one is pending, possible double submission"
                );
            }
            if attempt > MAX_FORCE_GET_ATTEMPTS {
                tracing::warn!(subtask = subtask_id, attempt, "ForceGetTaskResult attempts exceeded");
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(AtomicU8::new(SubmissionState::Pending as u8));
        let submission = Submission {
            id,
            subtask_id: subtask_id.to_string(),
            class,
            attempt,
            message,
        };

        self.entries.insert(
            id,
            Entry {
                submission: submission.clone(),
                state: state.clone(),
                delay,
                armed_at: now_secs(),
            },
        );
        self.by_key.entry(key).or_default().push(id);

        tracing::info!(subtask = subtask_id, %class, id, attempt, delay_secs = delay.as_secs(), "escalation armed");

        if delay.is_zero() {
            fire(&state, self.arbiter.as_ref(), &submission, &self.changed);
        } else {
            let arbiter = self.arbiter.clone();
            let changed = self.changed.clone();
            let timer_state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                fire(&timer_state, arbiter.as_ref(), &submission, &changed);
            });
        }

        Some(EscalationHandle {
            id,
            state,
            changed: self.changed.clone(),
        })
    }

    /// Cancel every pending submission for the key. Returns how many were
    /// cancelled; submissions that already fired are unaffected.
    pub fn cancel(&self, subtask_id: &str, class: MessageKind) -> usize {
        let key = (subtask_id.to_string(), class);
        let Some(ids) = self.by_key.get(&key).map(|ids| ids.value().clone()) else {
            return 0;
        };
        let cancelled = ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| e.state.clone()))
            .filter(|state| transition(state, SubmissionState::Cancelled))
            .count();
        if cancelled > 0 {
            tracing::debug!(subtask = subtask_id, %class, cancelled, "escalation cancelled");
            self.changed.notify_waiters();
        }
        cancelled
    }

    /// Resolves once nothing is pending for the key: every submission has
    /// fired or been cancelled. Immediate when nothing was ever armed.
    pub async fn settled(&self, subtask_id: &str, class: MessageKind) {
        loop {
            let changed = self.changed.notified();
            if self.pending(subtask_id, class) == 0 {
                return;
            }
            changed.await;
        }
    }

    /// Pending submissions for the key.
    pub fn pending(&self, subtask_id: &str, class: MessageKind) -> usize {
        self.key_stats(&(subtask_id.to_string(), class)).1
    }

    fn key_stats(&self, key: &Key) -> (u32, usize) {
        let Some(ids) = self.by_key.get(key) else {
            return (1, 0);
        };
        let pending = ids
            .iter()
            .filter(|&&id| {
                self.entries.get(&id).is_some_and(|e| {
                    SubmissionState::from_u8(e.state.load(Ordering::Acquire)) == SubmissionState::Pending
                })
            })
            .count();
        (ids.len() as u32 + 1, pending)
    }

    pub fn list(&self) -> Vec<EscalationView> {
        let mut out: Vec<EscalationView> = self
            .entries
            .iter()
            .map(|e| EscalationView {
                id: e.submission.id,
                subtask_id: e.submission.subtask_id.clone(),
                class: e.submission.class,
                attempt: e.submission.attempt,
                state: SubmissionState::from_u8(e.state.load(Ordering::Acquire)),
                delay_secs: e.delay.as_secs(),
                armed_at: e.armed_at,
            })
            .collect();
        out.sort_by_key(|v| v.id);
        out
    }
}

fn fire(state: &AtomicU8, arbiter: &dyn Arbiter, submission: &Submission, changed: &Notify) {
    if transition(state, SubmissionState::Fired) {
        tracing::info!(
            subtask = %submission.subtask_id,
            class = %submission.class,
            id = submission.id,
            "submitting to arbiter"
        );
        arbiter.submit(submission);
        changed.notify_waiters();
    }
}
