//! Tasknet integration test harness.
//!
//! Two complete nodes run in one process and talk over in-memory duplex
//! pipes through the same framing and session loop the daemon uses. One
//! side owns tasks (the requestor), the other computes them (the provider).
//!
//!   cargo test --test integration
//!
//! Escalation tests run with paused time so arbiter deadlines fire without
//! waiting for them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use tasknet_core::crypto::Keypair;
use tasknet_core::task::{NodeInfo, TaskHeader};
use tasknet_core::{MessageKind, Signed};
use tasknet_services::directory::SessionDirectory;
use tasknet_services::escalation::{Arbiter, Submission};
use tasknet_services::hooks::Collaborators;
use tasknet_services::ledger::{LedgerEntry, Outcome};
use tasknet_services::node::DEFAULT_ENVIRONMENT;
use tasknet_services::session::SessionConfig;
use tasknet_services::tasks::TaskSpec;
use tasknet_services::transport::framed;
use tasknet_services::{
    EscalationService, LocalNode, MessageHistory, Session, SessionContext, SessionHandle, Stores,
    SubtaskLedger, TaskBoard,
};

mod escalation;
mod failures;
mod flow;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const KEY_DIFFICULTY: u32 = 4;
pub const COMPUTE_DELAY: Duration = Duration::from_millis(20);

/// Arbiter that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingArbiter {
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

/// One node: its identity, shared stores, task board and local collaborators.
pub struct TestNode {
    pub keypair: Arc<Keypair>,
    pub config: Arc<SessionConfig>,
    pub stores: Stores,
    pub board: TaskBoard,
    pub local: Arc<LocalNode>,
    pub arbiter: Arc<RecordingArbiter>,
    pub hooks: Collaborators,
}

impl TestNode {
    pub fn new(name: &str, concent: bool) -> Self {
        Self::with_config(SessionConfig {
            node_name: name.to_string(),
            key_difficulty: KEY_DIFFICULTY,
            concent_enabled: concent,
            ..SessionConfig::default()
        })
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let keypair = Arc::new(Keypair::generate_with_difficulty(config.key_difficulty));
        let arbiter = Arc::new(RecordingArbiter::default());
        let directory = SessionDirectory::new();
        let stores = Stores {
            history: MessageHistory::new(),
            ledger: SubtaskLedger::new(),
            directory: directory.clone(),
            escalation: EscalationService::new(config.concent_enabled, arbiter.clone()),
        };
        let board = TaskBoard::new();
        let local = Arc::new(LocalNode::new(board.clone(), directory, COMPUTE_DELAY));
        let hooks = local.collaborators();
        Self {
            keypair,
            config: Arc::new(config),
            stores,
            board,
            local,
            arbiter,
            hooks,
        }
    }

    /// A requestor advertising a public address, so its tasks can be offered.
    pub fn requestor(name: &str, concent: bool) -> Self {
        Self::with_config(SessionConfig {
            node_name: name.to_string(),
            key_difficulty: KEY_DIFFICULTY,
            concent_enabled: concent,
            public_addr: Some("127.0.0.1".into()),
            public_port: Some(40102),
            ..SessionConfig::default()
        })
    }

    /// Replace the local compute engine with one taking `delay` per subtask.
    pub fn computing_for(mut self, delay: Duration) -> Self {
        self.local = Arc::new(LocalNode::new(
            self.board.clone(),
            self.stores.directory.clone(),
            delay,
        ));
        self.hooks = self.local.collaborators();
        self
    }

    pub fn ctx(&self) -> SessionContext {
        SessionContext {
            keypair: self.keypair.clone(),
            config: self.config.clone(),
            stores: self.stores.clone(),
            hooks: self.hooks.clone(),
        }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            pub_addr: self.config.public_addr.clone(),
            pub_port: self.config.public_port,
            ..NodeInfo::new(self.keypair.public, self.config.node_name.clone())
        }
    }

    pub fn create_task(&self, spec: TaskSpec) -> Signed<TaskHeader> {
        self.board
            .create(spec, &self.keypair, self.info())
            .expect("task spec should be valid")
    }

    pub fn entry(&self, subtask_id: &str) -> Option<LedgerEntry> {
        self.stores.ledger.get(subtask_id)
    }

    pub fn outcome(&self, subtask_id: &str) -> Option<Outcome> {
        self.entry(subtask_id).and_then(|e| e.outcome)
    }

    /// Classes of every history record for `subtask_id`, oldest first.
    pub fn history_classes(&self, subtask_id: &str) -> Vec<MessageKind> {
        self.stores
            .history
            .for_subtask(subtask_id)
            .into_iter()
            .map(|r| r.class)
            .collect()
    }
}

pub fn spec(subtasks_count: u32) -> TaskSpec {
    TaskSpec {
        environment: DEFAULT_ENVIRONMENT.to_string(),
        docker_images: Vec::new(),
        subtasks_count,
        subtask_timeout: 600,
        timeout: 3600,
        max_price: 50,
        resource_size: 0,
        extra_data: Default::default(),
    }
}

/// Handles to the two ends of a connected pair.
pub struct Link {
    pub provider: SessionHandle,
    pub requestor: SessionHandle,
}

/// Connect `provider` to `requestor` the way the daemon does: the provider
/// dials and says Hello first. `seen_addr` is the address the provider sees
/// the requestor connecting from.
pub fn connect(provider: &TestNode, requestor: &TestNode, seen_addr: Option<&str>) -> Link {
    let (a, b) = tokio::io::duplex(256 * 1024);

    let (conn_p, reader_p) = framed(a, seen_addr.map(str::to_string));
    let (mut session_p, handle_p) = Session::new(provider.ctx(), conn_p);
    session_p.start();

    let (conn_r, reader_r) = framed(b, None);
    let (session_r, handle_r) = Session::new(requestor.ctx(), conn_r);

    tokio::spawn(reader_p.run(handle_p.clone()));
    tokio::spawn(session_p.run());
    tokio::spawn(reader_r.run(handle_r.clone()));
    tokio::spawn(session_r.run());

    Link {
        provider: handle_p,
        requestor: handle_r,
    }
}

/// Poll `cond` every 10ms, failing after `limit`.
pub async fn wait_until(what: &str, limit: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while !cond() {
        if waited >= limit {
            bail!("timed out after {limit:?} waiting for {what}");
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    Ok(())
}

/// The only subtask issued so far for `task_id`.
pub fn first_subtask(node: &TestNode, task_id: &str) -> Option<String> {
    node.board
        .get(task_id)
        .and_then(|view| view.subtasks.first().map(|s| s.definition.subtask_id.clone()))
}
