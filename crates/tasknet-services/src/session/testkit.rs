//! Fakes for driving sessions in unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tasknet_core::crypto::{Keypair, PublicKey};
use tasknet_core::message::{CannotAssignReason, CannotComputeReason, ReportComputedTask, WantToComputeTask};
use tasknet_core::task::{now_secs, ComputeTaskDef, DockerImage, NodeInfo, ResourcesOptions, TaskHeader};
use tasknet_core::{Message, MessageKind, Signed};

use super::{Session, SessionConfig, SessionContext, Stores};
use crate::directory::SessionDirectory;
use crate::escalation::{Arbiter, EscalationService, Submission};
use crate::history::MessageHistory;
use crate::hooks::*;
use crate::ledger::SubtaskLedger;

pub(crate) fn base_image() -> DockerImage {
    DockerImage::new("tasknet/base", "1.0")
}

pub(crate) fn difficult_key() -> Keypair {
    Keypair::generate_with_difficulty(4)
}

pub(crate) fn task_header(owner: &Keypair, task_id: &str) -> Signed<TaskHeader> {
    Signed::sign(
        TaskHeader {
            task_id: task_id.into(),
            task_owner: NodeInfo::new(owner.public, "requestor"),
            environment: "DOCKER".into(),
            subtask_timeout: 600,
            deadline: now_secs() + 3600,
            max_price: 100,
            subtasks_count: 4,
            resource_size: 1024,
        },
        owner,
    )
    .unwrap()
}

// ── Connection ────────────────────────────────────────────────────────────────

pub(crate) struct RecordingConnection {
    sent: Mutex<Vec<Message>>,
    outbox: Mutex<Vec<Message>>,
    open: AtomicBool,
    addr: Option<String>,
}

impl RecordingConnection {
    pub fn new(addr: Option<&str>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            outbox: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            addr: addr.map(str::to_string),
        }
    }

    /// Everything ever sent.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<MessageKind> {
        self.sent().iter().map(Message::kind).collect()
    }

    pub fn last(&self) -> Option<Message> {
        self.sent.lock().unwrap().last().cloned()
    }

    /// Sent since the last call.
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }
}

impl Connection for RecordingConnection {
    fn send(&self, msg: Message) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        self.sent.lock().unwrap().push(msg.clone());
        self.outbox.lock().unwrap().push(msg);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn peer_addr(&self) -> Option<String> {
        self.addr.clone()
    }
}

// ── Collaborators ─────────────────────────────────────────────────────────────

pub(crate) struct Knobs {
    pub handshake: HandshakeStatus,
    pub handshake_ok: bool,
    pub wait_for: Option<String>,
    pub subtasks_left: u32,
    /// Seconds from now until a new subtask's deadline.
    pub deadline_offset: i64,
    pub ctd_environment: String,
    pub package_size: u64,
    pub pull_ok: bool,
    pub verify_ok: bool,
    pub policy: Result<(), CannotAssignReason>,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            handshake: HandshakeStatus::Done,
            handshake_ok: true,
            wait_for: None,
            subtasks_left: 4,
            deadline_offset: 600,
            ctd_environment: "DOCKER".into(),
            package_size: 1024,
            pull_ok: true,
            verify_ok: true,
            policy: Ok(()),
        }
    }
}

/// One fake implementing every collaborator, logging each call.
#[derive(Default)]
pub(crate) struct FakeNode {
    knobs: Mutex<Knobs>,
    tasks: Mutex<HashMap<String, Signed<TaskHeader>>>,
    assigned: Mutex<HashMap<String, PublicKey>>,
    next_subtask: AtomicU32,
    calls: Mutex<Vec<String>>,
}

impl FakeNode {
    pub fn set(&self, f: impl FnOnce(&mut Knobs)) {
        f(&mut self.knobs.lock().unwrap());
    }

    pub fn add_task(&self, header: Signed<TaskHeader>) {
        self.tasks
            .lock()
            .unwrap()
            .insert(header.body.task_id.clone(), header);
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    /// Calls whose name starts with `prefix`.
    pub fn calls(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
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
}

impl TaskManager for FakeNode {
    fn is_my_task(&self, task_id: &str) -> bool {
        self.tasks.lock().unwrap().contains_key(task_id)
    }

    fn task_header(&self, task_id: &str) -> Option<Signed<TaskHeader>> {
        self.tasks.lock().unwrap().get(task_id).cloned()
    }

    fn should_wait_for_node(&self, _task_id: &str, _node: &PublicKey) -> Option<String> {
        self.knobs.lock().unwrap().wait_for.clone()
    }

    fn check_next_subtask(&self, _task_id: &str, _price: u64) -> bool {
        self.knobs.lock().unwrap().subtasks_left > 0
    }

    fn get_next_subtask(&self, task_id: &str, offer: &WantToComputeTask) -> Option<ComputeTaskDef> {
        let mut knobs = self.knobs.lock().unwrap();
        if knobs.subtasks_left == 0 {
            return None;
        }
        knobs.subtasks_left -= 1;
        let subtask_id = format!("{task_id}-{}", self.next_subtask.fetch_add(1, Ordering::Relaxed));
        self.assigned
            .lock()
            .unwrap()
            .insert(subtask_id.clone(), offer.provider_public_key);
        Some(ComputeTaskDef {
            task_id: task_id.into(),
            subtask_id,
            deadline: (now_secs() as i64 + knobs.deadline_offset) as u64,
            environment: knobs.ctd_environment.clone(),
            docker_images: vec![base_image()],
            price: offer.price,
            performance: offer.perf_index,
            extra_data: BTreeMap::new(),
        })
    }

    fn package_info(&self, _task_id: &str) -> Option<PackageInfo> {
        Some(PackageInfo {
            package_hash: "sha1:input".into(),
            size: self.knobs.lock().unwrap().package_size,
        })
    }

    fn node_for_subtask(&self, subtask_id: &str) -> Option<PublicKey> {
        self.assigned.lock().unwrap().get(subtask_id).copied()
    }

    fn task_computation_failure(&self, subtask_id: &str, reason: &str) {
        self.log(format!("failure:{subtask_id}:{reason}"));
    }

    fn task_computation_cancelled(&self, subtask_id: &str, reason: CannotComputeReason) {
        self.log(format!("cancelled:{subtask_id}:{reason:?}"));
    }
}

impl AcceptancePolicy for FakeNode {
    fn should_accept_provider(
        &self,
        _node: &PublicKey,
        _task_id: &str,
        _offer: &WantToComputeTask,
    ) -> Result<(), CannotAssignReason> {
        self.knobs.lock().unwrap().policy.clone()
    }
}

impl ResultPuller for FakeNode {
    fn pull_package(&self, report: &Signed<ReportComputedTask>) -> BoxFuture<'static, Result<(), HookError>> {
        self.log(format!("pull:{}", report.body.subtask_id));
        let ok = self.knobs.lock().unwrap().pull_ok;
        Box::pin(async move {
            if ok {
                Ok(())
            } else {
                Err(HookError::PullFailed("peer unreachable".into()))
            }
        })
    }
}

impl ResultVerifier for FakeNode {
    fn verify_subtask(&self, subtask_id: &str) -> BoxFuture<'static, bool> {
        self.log(format!("verify:{subtask_id}"));
        let ok = self.knobs.lock().unwrap().verify_ok;
        Box::pin(async move { ok })
    }
}

impl Payments for FakeNode {
    fn accept_result(&self, subtask_id: &str, _provider: &PublicKey, price: u64) -> u64 {
        self.log(format!("accept_result:{subtask_id}:{price}"));
        1_700_000_000
    }

    fn reject_result(&self, subtask_id: &str, _provider: &PublicKey) {
        self.log(format!("reject_result:{subtask_id}"));
    }

    fn subtask_accepted(&self, subtask_id: &str, _requestor: &PublicKey, price: u64, payment_ts: u64) {
        self.log(format!("subtask_accepted:{subtask_id}:{price}:{payment_ts}"));
    }

    fn subtask_rejected(&self, subtask_id: &str, _requestor: &PublicKey) {
        self.log(format!("subtask_rejected:{subtask_id}"));
    }
}

impl NodeHandshakes for FakeNode {
    fn status(&self, _node: &PublicKey) -> HandshakeStatus {
        self.knobs.lock().unwrap().handshake
    }

    fn start(&self, _node: &PublicKey) -> BoxFuture<'static, bool> {
        self.log("handshake".into());
        let mut knobs = self.knobs.lock().unwrap();
        let ok = knobs.handshake_ok;
        knobs.handshake = if ok {
            HandshakeStatus::Done
        } else {
            HandshakeStatus::InProgress
        };
        Box::pin(async move { ok })
    }
}

impl Environments for FakeNode {
    fn get_environment_by_id(&self, env_id: &str) -> Option<EnvironmentInfo> {
        (env_id == "DOCKER").then(|| EnvironmentInfo {
            id: env_id.into(),
            docker_images: vec![base_image()],
        })
    }
}

impl TaskComputer for FakeNode {
    fn task_given(&self, ctd: &ComputeTaskDef, env: &EnvironmentInfo) {
        self.log(format!("task_given:{}:{}", ctd.subtask_id, env.id));
    }

    fn session_closed(&self) {
        self.log("session_closed".into());
    }

    fn subtask_waiting(&self, task_id: &str, subtask_id: &str) {
        self.log(format!("subtask_waiting:{task_id}:{subtask_id}"));
    }
}

impl ResourceShare for FakeNode {
    fn resources_options(&self) -> Option<ResourcesOptions> {
        None
    }

    fn result_package(&self, subtask_id: &str) -> Option<ResultPackage> {
        Some(ResultPackage {
            package_hash: format!("sha1:{subtask_id}"),
            multihash: String::new(),
            secret: "s3cret".into(),
            size: 2048,
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingArbiter {
    seen: Mutex<Vec<Submission>>,
}

impl RecordingArbiter {
    pub fn classes(&self) -> Vec<MessageKind> {
        self.seen.lock().unwrap().iter().map(|s| s.class).collect()
    }
}

impl Arbiter for RecordingArbiter {
    fn submit(&self, submission: &Submission) {
        self.seen.lock().unwrap().push(submission.clone());
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

pub(crate) struct Harness {
    pub session: Session,
    pub conn: Arc<RecordingConnection>,
    pub node: Arc<FakeNode>,
    pub arbiter: Arc<RecordingArbiter>,
    pub keypair: Arc<Keypair>,
    pub stores: Stores,
    ctx: SessionContext,
}

impl Harness {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_addr(config, None)
    }

    pub fn with_addr(config: SessionConfig, addr: Option<&str>) -> Self {
        let node = Arc::new(FakeNode::default());
        let arbiter = Arc::new(RecordingArbiter::default());
        let keypair = Arc::new(difficult_key());
        let stores = Stores {
            history: MessageHistory::new(),
            ledger: SubtaskLedger::new(),
            directory: SessionDirectory::new(),
            escalation: EscalationService::new(config.concent_enabled, arbiter.clone()),
        };
        let ctx = SessionContext {
            keypair: keypair.clone(),
            config: Arc::new(config),
            stores: stores.clone(),
            hooks: node.collaborators(),
        };
        let conn = Arc::new(RecordingConnection::new(addr));
        let (session, _handle) = Session::new(ctx.clone(), conn.clone());
        Self {
            session,
            conn,
            node,
            arbiter,
            keypair,
            stores,
            ctx,
        }
    }

    /// A second session of the same node, on a fresh connection.
    pub fn sibling(&self) -> (Session, Arc<RecordingConnection>) {
        let conn = Arc::new(RecordingConnection::new(None));
        let (session, _handle) = Session::new(self.ctx.clone(), conn.clone());
        (session, conn)
    }
}

/// Shuttle messages between two sessions until both are quiet.
pub(crate) async fn pump(a: &mut Harness, b: &mut Harness) {
    loop {
        a.session.settle().await;
        b.session.settle().await;
        let from_a = a.conn.take();
        let from_b = b.conn.take();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for msg in from_a {
            b.session.handle_message(msg);
        }
        for msg in from_b {
            a.session.handle_message(msg);
        }
    }
}

/// A requestor owning task "t1" and a provider, handshaken.
pub(crate) async fn pair(requestor: SessionConfig, provider: SessionConfig) -> (Harness, Harness) {
    let mut req = Harness::new(requestor);
    let mut prov = Harness::new(provider);
    req.node.add_task(task_header(&req.keypair, "t1"));
    prov.session.start();
    pump(&mut req, &mut prov).await;
    (req, prov)
}
