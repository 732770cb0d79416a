//! A node's own collaborators: task bookkeeping for tasks it owns, a
//! digest-based compute engine for subtasks it is given, and in-process
//! payment records.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{self, BoxFuture};

use tasknet_core::crypto::PublicKey;
use tasknet_core::message::{CannotAssignReason, CannotComputeReason, ReportComputedTask, WantToComputeTask};
use tasknet_core::task::{now_secs, ComputeTaskDef, ResourcesOptions, TaskHeader};
use tasknet_core::Signed;

use crate::directory::SessionDirectory;
use crate::hooks::*;
use crate::session::SessionEvent;
use crate::tasks::{result_digest, SubtaskProgress, TaskBoard};

/// Environment every node can run: no docker images, digest only.
pub const DEFAULT_ENVIRONMENT: &str = "DEFAULT";

pub struct LocalNode {
    board: TaskBoard,
    directory: SessionDirectory,
    environments: Vec<EnvironmentInfo>,
    compute_delay: Duration,
    /// subtask → package hash the provider reported (requestor side)
    reported: DashMap<String, String>,
    /// subtask → finished result (provider side)
    results: Arc<DashMap<String, ResultPackage>>,
    /// subtask → (price, payment_ts) for subtasks we were paid for
    earnings: DashMap<String, (u64, u64)>,
}

impl LocalNode {
    pub fn new(board: TaskBoard, directory: SessionDirectory, compute_delay: Duration) -> Self {
        Self {
            board,
            directory,
            environments: vec![EnvironmentInfo {
                id: DEFAULT_ENVIRONMENT.to_string(),
                docker_images: Vec::new(),
            }],
            compute_delay,
            reported: DashMap::new(),
            results: Arc::new(DashMap::new()),
            earnings: DashMap::new(),
        }
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            tasks: self.clone(),
            policy: self.clone(),
            puller: self.clone(),
            verifier: self.clone(),
            payments: self.clone(),
            handshakes: self.clone(),
            environments: self.clone(),
            computer: self.clone(),
            resources: self.clone(),
        }
    }

    fn earned(&self) -> u64 {
        self.earnings.iter().map(|e| e.value().0).sum()
    }
}

// ── Requestor side ────────────────────────────────────────────────────────────

impl TaskManager for LocalNode {
    fn is_my_task(&self, task_id: &str) -> bool {
        self.board.contains(task_id)
    }

    fn task_header(&self, task_id: &str) -> Option<Signed<TaskHeader>> {
        self.board.header(task_id)
    }

    fn should_wait_for_node(&self, task_id: &str, node: &PublicKey) -> Option<String> {
        self.board.computing_for(task_id, node)
    }

    fn check_next_subtask(&self, task_id: &str, price: u64) -> bool {
        let within_price = self
            .board
            .header(task_id)
            .is_some_and(|h| price <= h.body.max_price);
        within_price && self.board.remaining(task_id) > 0
    }

    fn get_next_subtask(&self, task_id: &str, offer: &WantToComputeTask) -> Option<ComputeTaskDef> {
        self.board.issue(task_id, offer)
    }

    fn package_info(&self, task_id: &str) -> Option<PackageInfo> {
        let header = self.board.header(task_id)?;
        Some(PackageInfo {
            package_hash: format!("blake3:{}", blake3::hash(header.body.task_id.as_bytes()).to_hex()),
            size: header.body.resource_size,
        })
    }

    fn node_for_subtask(&self, subtask_id: &str) -> Option<PublicKey> {
        self.board.provider_of(subtask_id)
    }

    fn task_computation_failure(&self, subtask_id: &str, reason: &str) {
        tracing::info!(subtask = subtask_id, reason, "subtask failed, will be reissued");
        self.board.mark(subtask_id, SubtaskProgress::Failed);
    }

    fn task_computation_cancelled(&self, subtask_id: &str, reason: CannotComputeReason) {
        tracing::info!(subtask = subtask_id, ?reason, "provider cancelled subtask");
        self.board.mark(subtask_id, SubtaskProgress::Cancelled);
    }
}

impl AcceptancePolicy for LocalNode {
    fn should_accept_provider(
        &self,
        _node: &PublicKey,
        task_id: &str,
        offer: &WantToComputeTask,
    ) -> Result<(), CannotAssignReason> {
        let header = self.board.header(task_id).ok_or(CannotAssignReason::NotMyTask)?;
        if now_secs() >= header.body.deadline {
            return Err(CannotAssignReason::TaskFinished);
        }
        if offer.max_resource_size < header.body.resource_size {
            return Err(CannotAssignReason::ResourcesTooBig);
        }
        Ok(())
    }
}

impl ResultPuller for LocalNode {
    fn pull_package(&self, report: &Signed<ReportComputedTask>) -> BoxFuture<'static, Result<(), HookError>> {
        let body = &report.body;
        if body.package_hash.is_empty() {
            return Box::pin(future::ready(Err::<(), _>(HookError::PullFailed(
                "report names no package".into(),
            ))));
        }
        self.reported
            .insert(body.subtask_id.clone(), body.package_hash.clone());
        Box::pin(future::ready(Ok(())))
    }
}

impl ResultVerifier for LocalNode {
    fn verify_subtask(&self, subtask_id: &str) -> BoxFuture<'static, bool> {
        let expected = self.board.subtask(subtask_id).map(|s| result_digest(&s.definition));
        let reported = self.reported.get(subtask_id).map(|r| r.value().clone());
        let ok = expected.is_some() && expected == reported;
        if !ok {
            tracing::info!(subtask = subtask_id, ?expected, ?reported, "result digest mismatch");
        }
        Box::pin(future::ready(ok))
    }
}

impl Payments for LocalNode {
    fn accept_result(&self, subtask_id: &str, provider: &PublicKey, price: u64) -> u64 {
        self.board.mark(subtask_id, SubtaskProgress::Finished);
        let payment_ts = now_secs();
        tracing::info!(subtask = subtask_id, provider = %hex::encode(provider), price, payment_ts, "payment committed");
        payment_ts
    }

    fn reject_result(&self, subtask_id: &str, provider: &PublicKey) {
        tracing::info!(subtask = subtask_id, provider = %hex::encode(provider), "result rejected, no payment");
        self.board.mark(subtask_id, SubtaskProgress::Failed);
    }

    fn subtask_accepted(&self, subtask_id: &str, requestor: &PublicKey, price: u64, payment_ts: u64) {
        self.earnings.insert(subtask_id.to_string(), (price, payment_ts));
        tracing::info!(
            subtask = subtask_id,
            requestor = %hex::encode(requestor),
            price,
            payment_ts,
            earned = self.earned(),
            "subtask accepted"
        );
    }

    fn subtask_rejected(&self, subtask_id: &str, requestor: &PublicKey) {
        tracing::info!(subtask = subtask_id, requestor = %hex::encode(requestor), "subtask rejected");
        self.results.remove(subtask_id);
    }
}

impl NodeHandshakes for LocalNode {
    fn status(&self, _node: &PublicKey) -> HandshakeStatus {
        HandshakeStatus::Done
    }

    fn start(&self, _node: &PublicKey) -> BoxFuture<'static, bool> {
        Box::pin(future::ready(true))
    }
}

// ── Provider side ─────────────────────────────────────────────────────────────

impl Environments for LocalNode {
    fn get_environment_by_id(&self, env_id: &str) -> Option<EnvironmentInfo> {
        self.environments.iter().find(|e| e.id == env_id).cloned()
    }
}

impl TaskComputer for LocalNode {
    fn task_given(&self, ctd: &ComputeTaskDef, env: &EnvironmentInfo) {
        tracing::info!(subtask = %ctd.subtask_id, env = %env.id, "computing subtask");
        let ctd = ctd.clone();
        let results = self.results.clone();
        let directory = self.directory.clone();
        let delay = self.compute_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let digest = result_digest(&ctd);
            results.insert(
                ctd.subtask_id.clone(),
                ResultPackage {
                    package_hash: digest,
                    multihash: String::new(),
                    secret: String::new(),
                    size: 0,
                },
            );
            match directory.session_for(&ctd.subtask_id) {
                Some(session) => {
                    session.send(SessionEvent::ResultReady {
                        subtask_id: ctd.subtask_id.clone(),
                    });
                }
                None => tracing::warn!(subtask = %ctd.subtask_id, "computed subtask has no live session"),
            }
        });
    }

    fn session_closed(&self) {
        tracing::debug!("session closed");
    }

    fn subtask_waiting(&self, task_id: &str, subtask_id: &str) {
        tracing::info!(task = task_id, subtask = subtask_id, "requestor waits for our results first");
        if self.results.contains_key(subtask_id) {
            if let Some(session) = self.directory.session_for(subtask_id) {
                session.send(SessionEvent::ResultReady {
                    subtask_id: subtask_id.to_string(),
                });
            }
        }
    }
}

impl ResourceShare for LocalNode {
    fn resources_options(&self) -> Option<ResourcesOptions> {
        None
    }

    fn result_package(&self, subtask_id: &str) -> Option<ResultPackage> {
        self.results.get(subtask_id).map(|r| r.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tasknet_core::crypto::Keypair;
    use tasknet_core::task::NodeInfo;
    use crate::session::SessionHandle;
    use crate::tasks::TaskSpec;

    fn spec() -> TaskSpec {
        TaskSpec {
            environment: DEFAULT_ENVIRONMENT.into(),
            docker_images: Vec::new(),
            subtasks_count: 1,
            subtask_timeout: 60,
            timeout: 600,
            max_price: 40,
            resource_size: 0,
            extra_data: BTreeMap::new(),
        }
    }

    fn offer(header: &Signed<TaskHeader>, provider: &Keypair, price: u64) -> WantToComputeTask {
        WantToComputeTask {
            task_header: header.clone(),
            perf_index: 10.0,
            price,
            max_resource_size: 0,
            max_memory_size: 0,
            node_name: "p".into(),
            provider_public_key: provider.public,
            concent_enabled: false,
        }
    }

    fn node() -> (Arc<LocalNode>, TaskBoard, SessionDirectory) {
        let board = TaskBoard::new();
        let directory = SessionDirectory::new();
        let node = Arc::new(LocalNode::new(board.clone(), directory.clone(), Duration::from_secs(2)));
        (node, board, directory)
    }

    #[test]
    fn price_above_task_limit_gets_no_subtask() {
        let (node, board, _) = node();
        let owner = Keypair::generate();
        let header = board.create(spec(), &owner, NodeInfo::new(owner.public, "r")).unwrap();
        assert!(node.check_next_subtask(&header.body.task_id, 40));
        assert!(!node.check_next_subtask(&header.body.task_id, 41));
    }

    #[tokio::test]
    async fn matching_digest_verifies() {
        let (node, board, _) = node();
        let owner = Keypair::generate();
        let provider = Keypair::generate();
        let header = board.create(spec(), &owner, NodeInfo::new(owner.public, "r")).unwrap();
        let ctd = node
            .get_next_subtask(&header.body.task_id, &offer(&header, &provider, 10))
            .unwrap();

        node.reported.insert(ctd.subtask_id.clone(), result_digest(&ctd));
        assert!(node.verify_subtask(&ctd.subtask_id).await);

        node.reported.insert(ctd.subtask_id.clone(), "blake3:00".into());
        assert!(!node.verify_subtask(&ctd.subtask_id).await);
        assert!(!node.verify_subtask("unknown").await);
    }

    #[tokio::test(start_paused = true)]
    async fn computed_subtask_is_reported_to_its_session() {
        let (node, board, directory) = node();
        let owner = Keypair::generate();
        let provider = Keypair::generate();
        let header = board.create(spec(), &owner, NodeInfo::new(owner.public, "r")).unwrap();
        let ctd = board
            .issue(&header.body.task_id, &offer(&header, &provider, 10))
            .unwrap();

        let (handle, mut rx) = SessionHandle::detached(9);
        directory.bind_session(&ctd.subtask_id, handle);
        let env = node.get_environment_by_id(DEFAULT_ENVIRONMENT).unwrap();
        node.task_given(&ctd, &env);
        assert!(node.result_package(&ctd.subtask_id).is_none());

        tokio::time::sleep(Duration::from_secs(3)).await;
        match rx.recv().await {
            Some(SessionEvent::ResultReady { subtask_id }) => assert_eq!(subtask_id, ctd.subtask_id),
            other => panic!("unexpected {other:?}"),
        }
        let package = node.result_package(&ctd.subtask_id).unwrap();
        assert_eq!(package.package_hash, result_digest(&ctd));
    }

    #[test]
    fn unknown_environment_is_absent() {
        let (node, _, _) = node();
        assert!(node.get_environment_by_id("DOCKER").is_none());
    }
}
