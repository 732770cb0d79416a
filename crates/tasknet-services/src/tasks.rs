//! Task board: the tasks this node owns as a requestor, and the subtasks
//! it has handed out for them.
//!
//! The board issues subtask definitions against incoming offers and keeps
//! enough of each definition to check the results later. Headers are signed
//! once, at creation; every offer must carry that exact signed header back.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tasknet_core::crypto::{Keypair, PublicKey};
use tasknet_core::message::{ProtocolError, WantToComputeTask};
use tasknet_core::task::{generate_id, now_secs, ComputeTaskDef, DockerImage, NodeInfo, TaskHeader};
use tasknet_core::Signed;
use thiserror::Error;

/// What a caller asks for when creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub environment: String,
    #[serde(default)]
    pub docker_images: Vec<DockerImage>,
    pub subtasks_count: u32,
    /// Seconds a provider has per subtask.
    pub subtask_timeout: u64,
    /// Seconds from now until the task is void.
    pub timeout: u64,
    pub max_price: u64,
    #[serde(default)]
    pub resource_size: u64,
    #[serde(default)]
    pub extra_data: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskProgress {
    Computing,
    Finished,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedSubtask {
    pub definition: ComputeTaskDef,
    pub provider_key_id: String,
    #[serde(skip)]
    pub provider: PublicKey,
    pub progress: SubtaskProgress,
    pub issued_at: u64,
}

#[derive(Debug, Clone)]
struct LocalTask {
    header: Signed<TaskHeader>,
    spec: TaskSpec,
    subtasks: BTreeMap<String, IssuedSubtask>,
    created_at: u64,
}

impl LocalTask {
    /// Subtasks not yet handed out. Failed and cancelled ones are reissued.
    fn remaining(&self) -> u32 {
        let live = self
            .subtasks
            .values()
            .filter(|s| matches!(s.progress, SubtaskProgress::Computing | SubtaskProgress::Finished))
            .count() as u32;
        self.spec.subtasks_count.saturating_sub(live)
    }
}

/// Summary row for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub header: Signed<TaskHeader>,
    pub subtasks_count: u32,
    pub remaining: u32,
    pub subtasks: Vec<IssuedSubtask>,
    pub created_at: u64,
}

#[derive(Clone, Default)]
pub struct TaskBoard {
    tasks: Arc<DashMap<String, LocalTask>>,
    /// subtask_id → task_id
    index: Arc<DashMap<String, String>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and sign a new task owned by `owner`.
    pub fn create(&self, spec: TaskSpec, owner: &Keypair, owner_info: NodeInfo) -> Result<Signed<TaskHeader>, TaskError> {
        if spec.subtasks_count == 0 {
            return Err(TaskError::Invalid("subtasks_count must be positive"));
        }
        if spec.environment.is_empty() {
            return Err(TaskError::Invalid("environment is required"));
        }
        if spec.subtask_timeout == 0 || spec.timeout == 0 {
            return Err(TaskError::Invalid("timeouts must be positive"));
        }

        let header = Signed::sign(
            TaskHeader {
                task_id: generate_id(),
                task_owner: owner_info,
                environment: spec.environment.clone(),
                subtask_timeout: spec.subtask_timeout,
                deadline: now_secs() + spec.timeout,
                max_price: spec.max_price,
                subtasks_count: spec.subtasks_count,
                resource_size: spec.resource_size,
            },
            owner,
        )?;

        tracing::info!(
            task = %header.body.task_id,
            subtasks = spec.subtasks_count,
            environment = %spec.environment,
            "task created"
        );
        self.tasks.insert(
            header.body.task_id.clone(),
            LocalTask {
                header: header.clone(),
                spec,
                subtasks: BTreeMap::new(),
                created_at: now_secs(),
            },
        );
        Ok(header)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn header(&self, task_id: &str) -> Option<Signed<TaskHeader>> {
        self.tasks.get(task_id).map(|t| t.header.clone())
    }

    pub fn remaining(&self, task_id: &str) -> u32 {
        self.tasks.get(task_id).map(|t| t.remaining()).unwrap_or(0)
    }

    /// A subtask `node` is still computing for this task, if any.
    pub fn computing_for(&self, task_id: &str, node: &PublicKey) -> Option<String> {
        let task = self.tasks.get(task_id)?;
        task.subtasks
            .values()
            .find(|s| &s.provider == node && s.progress == SubtaskProgress::Computing)
            .map(|s| s.definition.subtask_id.clone())
    }

    /// Issue the next subtask of `task_id` to the offer's provider.
    pub fn issue(&self, task_id: &str, offer: &WantToComputeTask) -> Option<ComputeTaskDef> {
        let mut task = self.tasks.get_mut(task_id)?;
        if task.remaining() == 0 {
            return None;
        }
        let now = now_secs();
        if now >= task.header.body.deadline {
            tracing::debug!(task = task_id, "task past its deadline, nothing issued");
            return None;
        }

        let definition = ComputeTaskDef {
            task_id: task_id.to_string(),
            subtask_id: generate_id(),
            deadline: (now + task.spec.subtask_timeout).min(task.header.body.deadline),
            environment: task.spec.environment.clone(),
            docker_images: task.spec.docker_images.clone(),
            price: offer.price,
            performance: offer.perf_index,
            extra_data: task.spec.extra_data.clone(),
        };
        task.subtasks.insert(
            definition.subtask_id.clone(),
            IssuedSubtask {
                definition: definition.clone(),
                provider_key_id: hex::encode(offer.provider_public_key),
                provider: offer.provider_public_key,
                progress: SubtaskProgress::Computing,
                issued_at: now,
            },
        );
        self.index
            .insert(definition.subtask_id.clone(), task_id.to_string());
        Some(definition)
    }

    pub fn subtask(&self, subtask_id: &str) -> Option<IssuedSubtask> {
        let task_id = self.index.get(subtask_id)?.value().clone();
        let task = self.tasks.get(&task_id)?;
        task.subtasks.get(subtask_id).cloned()
    }

    pub fn provider_of(&self, subtask_id: &str) -> Option<PublicKey> {
        self.subtask(subtask_id).map(|s| s.provider)
    }

    /// Move a computing subtask to `progress`. Finished subtasks stay finished.
    pub fn mark(&self, subtask_id: &str, progress: SubtaskProgress) -> bool {
        let Some(task_id) = self.index.get(subtask_id).map(|t| t.value().clone()) else {
            return false;
        };
        let Some(mut task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        match task.subtasks.get_mut(subtask_id) {
            Some(s) if s.progress != SubtaskProgress::Finished => {
                s.progress = progress;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TaskView> {
        self.tasks.get(task_id).map(|t| view(&t))
    }

    pub fn list(&self) -> Vec<TaskView> {
        let mut out: Vec<TaskView> = self.tasks.iter().map(|t| view(&t)).collect();
        out.sort_by_key(|v| v.created_at);
        out
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn view(task: &LocalTask) -> TaskView {
    TaskView {
        task_id: task.header.body.task_id.clone(),
        header: task.header.clone(),
        subtasks_count: task.spec.subtasks_count,
        remaining: task.remaining(),
        subtasks: task.subtasks.values().cloned().collect(),
        created_at: task.created_at,
    }
}

/// Digest of the work a subtask describes. The local compute engine
/// publishes it as the result hash and the requestor checks it on
/// verification.
pub fn result_digest(definition: &ComputeTaskDef) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(definition.task_id.as_bytes());
    hasher.update(definition.subtask_id.as_bytes());
    for (key, value) in &definition.extra_data {
        hasher.update(key.as_bytes());
        hasher.update(value.to_string().as_bytes());
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task: {0}")]
    Invalid(&'static str),

    #[error(transparent)]
    Sign(#[from] ProtocolError),
}
