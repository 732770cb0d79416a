//! External collaborators a session talks to.
//!
//! Sessions never reach into global state. Everything outside the protocol
//! (task bookkeeping, pricing policy, resource transfer, computation,
//! payments) is injected through these traits. Long-running work (package
//! pulls, verification, node handshakes) returns a future; the session
//! spawns it and receives the outcome as an event, so every result has a
//! single completion point inside the session loop.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tasknet_core::crypto::PublicKey;
use tasknet_core::message::{CannotAssignReason, CannotComputeReason, ReportComputedTask, WantToComputeTask};
use tasknet_core::task::{ComputeTaskDef, DockerImage, ResourcesOptions, TaskHeader};
use tasknet_core::{Message, Signed};
use thiserror::Error;

/// Input package a requestor ships for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub package_hash: String,
    pub size: u64,
}

/// Where a provider put a finished subtask's results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPackage {
    pub package_hash: String,
    pub multihash: String,
    pub secret: String,
    pub size: u64,
}

/// A compute environment the local node can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub id: String,
    /// Images this environment may run. Empty means the environment does
    /// not use docker and accepts no images.
    pub docker_images: Vec<DockerImage>,
}

impl EnvironmentInfo {
    pub fn accepts_images(&self, images: &[DockerImage]) -> bool {
        images.iter().all(|image| self.docker_images.contains(image))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Done,
    Required,
    InProgress,
}

// ── Requestor-side ────────────────────────────────────────────────────────────

pub trait TaskManager: Send + Sync {
    fn is_my_task(&self, task_id: &str) -> bool;

    fn task_header(&self, task_id: &str) -> Option<Signed<TaskHeader>>;

    /// `Some(subtask_id)` when the node must first deliver results for a
    /// subtask it already holds.
    fn should_wait_for_node(&self, task_id: &str, node: &PublicKey) -> Option<String>;

    fn check_next_subtask(&self, task_id: &str, price: u64) -> bool;

    fn get_next_subtask(&self, task_id: &str, offer: &WantToComputeTask) -> Option<ComputeTaskDef>;

    fn package_info(&self, task_id: &str) -> Option<PackageInfo>;

    fn node_for_subtask(&self, subtask_id: &str) -> Option<PublicKey>;

    fn task_computation_failure(&self, subtask_id: &str, reason: &str);

    fn task_computation_cancelled(&self, subtask_id: &str, reason: CannotComputeReason);
}

pub trait AcceptancePolicy: Send + Sync {
    fn should_accept_provider(
        &self,
        node: &PublicKey,
        task_id: &str,
        offer: &WantToComputeTask,
    ) -> Result<(), CannotAssignReason>;
}

pub trait ResultPuller: Send + Sync {
    fn pull_package(&self, report: &Signed<ReportComputedTask>) -> BoxFuture<'static, Result<(), HookError>>;
}

pub trait ResultVerifier: Send + Sync {
    /// Resolves to true when the results are correct.
    fn verify_subtask(&self, subtask_id: &str) -> BoxFuture<'static, bool>;
}

pub trait Payments: Send + Sync {
    /// Commit to paying for an accepted subtask. Returns the payment timestamp.
    fn accept_result(&self, subtask_id: &str, provider: &PublicKey, price: u64) -> u64;

    fn reject_result(&self, subtask_id: &str, provider: &PublicKey);

    fn subtask_accepted(&self, subtask_id: &str, requestor: &PublicKey, price: u64, payment_ts: u64);

    fn subtask_rejected(&self, subtask_id: &str, requestor: &PublicKey);
}

pub trait NodeHandshakes: Send + Sync {
    fn status(&self, node: &PublicKey) -> HandshakeStatus;

    /// Resolves to true if the handshake succeeded.
    fn start(&self, node: &PublicKey) -> BoxFuture<'static, bool>;
}

// ── Provider-side ─────────────────────────────────────────────────────────────

pub trait Environments: Send + Sync {
    fn get_environment_by_id(&self, env_id: &str) -> Option<EnvironmentInfo>;
}

pub trait TaskComputer: Send + Sync {
    /// Start computing `ctd` in `env`. The environment is resolved by the
    /// session for this one assignment; computers keep no "current" one.
    fn task_given(&self, ctd: &ComputeTaskDef, env: &EnvironmentInfo);

    fn session_closed(&self);

    fn subtask_waiting(&self, task_id: &str, subtask_id: &str);
}

pub trait ResourceShare: Send + Sync {
    /// Transfer hints attached to outgoing `TaskToCompute`s.
    fn resources_options(&self) -> Option<ResourcesOptions>;

    /// Results shared for a computed subtask, if any.
    fn result_package(&self, subtask_id: &str) -> Option<ResultPackage>;
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// The session's half of a peer connection.
pub trait Connection: Send + Sync {
    fn send(&self, msg: Message) -> Result<(), ConnectionError>;

    fn close(&self);

    fn is_open(&self) -> bool;

    /// Remote address as seen by the transport, if known.
    fn peer_addr(&self) -> Option<String> {
        None
    }
}

/// Everything a session needs besides its connection.
#[derive(Clone)]
pub struct Collaborators {
    pub tasks: Arc<dyn TaskManager>,
    pub policy: Arc<dyn AcceptancePolicy>,
    pub puller: Arc<dyn ResultPuller>,
    pub verifier: Arc<dyn ResultVerifier>,
    pub payments: Arc<dyn Payments>,
    pub handshakes: Arc<dyn NodeHandshakes>,
    pub environments: Arc<dyn Environments>,
    pub computer: Arc<dyn TaskComputer>,
    pub resources: Arc<dyn ResourceShare>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("package pull failed: {0}")]
    PullFailed(String),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("failed to encode frame: {0}")]
    Encode(#[from] tasknet_core::message::ProtocolError),
}
