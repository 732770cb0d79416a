//! Message history: append-only record of task-related protocol messages.
//!
//! Derived messages embed earlier ones byte for byte (an `Ack` carries the
//! exact `ReportComputedTask`, which carries the exact `TaskToCompute`). The
//! session fetches those originals from here rather than rebuilding them.
//!
//! Records are keyed by (message class, peer node, task, subtask). Messages
//! without a task id (`Hello`, `Disconnect`) are not recorded.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tasknet_core::crypto::PublicKey;
use tasknet_core::task::now_secs;
use tasknet_core::{Message, MessageKind};
use thiserror::Error;

/// Which side of the protocol a node plays for one subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Requestor,
    Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Insertion order, monotonic per store.
    pub seq: u64,
    pub class: MessageKind,
    /// Hex key of the remote node.
    pub node_id: String,
    pub task_id: String,
    pub subtask_id: Option<String>,
    pub local_role: Actor,
    pub remote_role: Actor,
    pub direction: Direction,
    pub message: Message,
    pub recorded_at: u64,
}

/// Durable mirror of the in-memory history.
pub trait HistorySink: Send + Sync {
    fn persist(&self, record: &HistoryRecord) -> Result<(), HistoryError>;
}

type Key = (MessageKind, PublicKey, String, Option<String>);

#[derive(Clone, Default)]
pub struct MessageHistory {
    records: Arc<DashMap<Key, Vec<HistoryRecord>>>,
    seq: Arc<AtomicU64>,
    sink: Option<Arc<dyn HistorySink>>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn HistorySink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::default()
        }
    }

    /// Record `message` exchanged with `node_id`.
    ///
    /// Direction is derived from the sender: a message signed by `node_id`
    /// was received, anything else was sent by us. Sink failures are logged;
    /// the in-memory record is kept regardless.
    pub fn add(
        &self,
        message: &Message,
        node_id: &PublicKey,
        local_role: Actor,
        remote_role: Actor,
    ) -> Result<u64, HistoryError> {
        let task_id = message
            .task_id()
            .ok_or(HistoryError::Untracked(message.kind()))?
            .to_string();
        let subtask_id = message.subtask_id().map(str::to_string);
        let direction = if message.sender() == node_id {
            Direction::Received
        } else {
            Direction::Sent
        };

        let record = HistoryRecord {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            class: message.kind(),
            node_id: hex::encode(node_id),
            task_id,
            subtask_id,
            local_role,
            remote_role,
            direction,
            message: message.clone(),
            recorded_at: now_secs(),
        };

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(&record) {
                tracing::warn!(error = %e, class = %record.class, "failed to persist history record");
            }
        }

        let seq = record.seq;
        self.insert(*node_id, record);
        Ok(seq)
    }

    /// Re-insert a record loaded from the durable sink. Not persisted again.
    pub fn restore(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        let node = tasknet_core::crypto::parse_key_id(&record.node_id)
            .map_err(|_| HistoryError::BadNodeId(record.node_id.clone()))?;
        self.seq.fetch_max(record.seq + 1, Ordering::Relaxed);
        self.insert(node, record);
        Ok(())
    }

    fn insert(&self, node: PublicKey, record: HistoryRecord) {
        let key = (
            record.class,
            node,
            record.task_id.clone(),
            record.subtask_id.clone(),
        );
        self.records.entry(key).or_default().push(record);
    }

    /// Most recent message of `class` exchanged with `node_id` for the given
    /// task and subtask.
    pub fn get(
        &self,
        class: MessageKind,
        node_id: &PublicKey,
        task_id: &str,
        subtask_id: Option<&str>,
    ) -> Result<Message, HistoryError> {
        let key = (
            class,
            *node_id,
            task_id.to_string(),
            subtask_id.map(str::to_string),
        );
        self.records
            .get(&key)
            .and_then(|records| records.last().map(|r| r.message.clone()))
            .ok_or(HistoryError::NotFound {
                class,
                task_id: task_id.to_string(),
                subtask_id: subtask_id.map(str::to_string),
            })
    }

    /// All records for one subtask, oldest first.
    pub fn for_subtask(&self, subtask_id: &str) -> Vec<HistoryRecord> {
        let mut out: Vec<HistoryRecord> = self
            .records
            .iter()
            .filter(|entry| entry.key().3.as_deref() == Some(subtask_id))
            .flat_map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|r| r.seq);
        out
    }

    pub fn len(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("no {class} for task {task_id} subtask {subtask_id:?}")]
    NotFound {
        class: MessageKind,
        task_id: String,
        subtask_id: Option<String>,
    },

    #[error("{0} carries no task id and is not recorded")]
    Untracked(MessageKind),

    #[error("stored node id {0} is not a valid key")]
    BadNodeId(String),

    #[error("history sink: {0}")]
    Sink(String),
}
