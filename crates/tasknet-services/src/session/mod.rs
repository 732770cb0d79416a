//! Task session: one protocol conversation with one peer.
//!
//! A session owns its protocol state and is driven by a single event loop:
//! incoming messages, completions of spawned work (package pulls,
//! verification, node handshakes) and local requests all arrive on one
//! channel and are handled to completion one at a time.
//!
//! Lifecycle: `Init → Handshaking → Verified → Closed`. Until the peer's
//! `Hello` has been checked, only `Hello` and `Disconnect` are accepted and
//! outgoing messages other than those two are queued.
//!
//! Handlers live in `handshake` (Hello/Disconnect), `requestor` (the side
//! that owns the task) and `provider` (the side that computes).

mod handshake;
mod provider;
mod requestor;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use tasknet_core::config::TasknetConfig;
use tasknet_core::crypto::{self, Keypair, PublicKey};
use tasknet_core::message::{Body, ReportComputedTask, TaskToCompute, WantToComputeTask};
use tasknet_core::task::{now_secs, NodeInfo, TaskHeader};
use tasknet_core::{Message, MessageKind, Signed};

use crate::directory::SessionDirectory;
use crate::escalation::EscalationService;
use crate::history::{Actor, MessageHistory};
use crate::hooks::{Collaborators, Connection, HookError};
use crate::ledger::{SubtaskLedger, SubtaskState};

// ── Settings and shared state ─────────────────────────────────────────────────

/// Protocol settings a session runs with.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub node_name: String,
    pub public_addr: Option<String>,
    pub public_port: Option<u16>,
    pub key_difficulty: u32,
    pub max_price: u64,
    pub max_resource_size: u64,
    pub max_memory_size: u64,
    pub deadline_slack_secs: u64,
    pub offer_price: u64,
    pub perf_index: f64,
    pub concent_enabled: bool,
    pub force_get_result_delay: Duration,
    pub force_report_delay: Duration,
    pub force_results_delay: Duration,
}

impl SessionConfig {
    pub fn from_config(config: &TasknetConfig) -> Self {
        let public_addr = Some(config.network.public_addr.clone()).filter(|a| !a.is_empty());
        Self {
            node_name: config.identity.node_name.clone(),
            public_port: public_addr.as_ref().map(|_| config.network.listen_port),
            public_addr,
            key_difficulty: config.protocol.key_difficulty,
            max_price: config.protocol.max_price,
            max_resource_size: config.protocol.max_resource_size,
            max_memory_size: config.protocol.max_memory_size,
            deadline_slack_secs: config.protocol.deadline_slack_secs,
            offer_price: config.protocol.offer_price,
            perf_index: config.protocol.perf_index,
            concent_enabled: config.concent.enabled,
            force_get_result_delay: config.concent.force_get_result_delay(),
            force_report_delay: config.concent.force_report_delay(),
            force_results_delay: config.concent.force_results_delay(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&TasknetConfig::default())
    }
}

/// Stores shared by every session of a node.
#[derive(Clone)]
pub struct Stores {
    pub history: MessageHistory,
    pub ledger: SubtaskLedger,
    pub directory: SessionDirectory,
    pub escalation: EscalationService,
}

/// Everything a session is constructed with besides its connection.
#[derive(Clone)]
pub struct SessionContext {
    pub keypair: Arc<Keypair>,
    pub config: Arc<SessionConfig>,
    pub stores: Stores,
    pub hooks: Collaborators,
}

// ── State, events, handles ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Init,
    Handshaking,
    Verified,
    Closed,
}

/// Summary published to the directory for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub peer_key_id: Option<String>,
    pub peer_addr: Option<String>,
    pub state: SessionState,
    pub opened_at: u64,
    pub messages_in: u64,
    pub messages_out: u64,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// A decoded message from the peer.
    Incoming(Message),
    PullDone {
        subtask_id: String,
        result: Result<(), HookError>,
    },
    VerificationDone {
        subtask_id: String,
        accepted: bool,
    },
    NodeHandshakeDone {
        node: PublicKey,
        ok: bool,
    },
    /// Offer to compute a subtask of the advertised task.
    RequestTask(Signed<TaskHeader>),
    /// The local computation of a subtask finished; report it.
    ResultReady { subtask_id: String },
    ConnectionLost,
}

/// Cheap, cloneable route into a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    /// A handle with no session behind it; the caller owns the receiver.
    pub fn detached(id: u64) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Returns false if the session has ended.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn deliver(&self, msg: Message) -> bool {
        self.send(SessionEvent::Incoming(msg))
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    id: u64,
    ctx: SessionContext,
    conn: Arc<dyn Connection>,
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    state: SessionState,
    peer: Option<PublicKey>,
    peer_info: Option<NodeInfo>,
    rand_val: u64,
    hello_sent: bool,
    /// Outgoing messages waiting for the handshake.
    queue: Vec<Message>,
    /// Offers waiting for an external node handshake.
    held: Vec<Signed<WantToComputeTask>>,
    /// In-memory copies, used when history has no record.
    assignments: HashMap<String, Signed<TaskToCompute>>,
    reports: HashMap<String, Signed<ReportComputedTask>>,
    /// Spawned futures whose outcome has not come back yet.
    inflight: usize,
    opened_at: u64,
    messages_in: u64,
    messages_out: u64,
}

impl Session {
    pub fn new(ctx: SessionContext, conn: Arc<dyn Connection>) -> (Self, SessionHandle) {
        let id = ctx.stores.directory.next_session_id();
        let (handle, events) = SessionHandle::detached(id);
        let session = Self {
            id,
            ctx,
            conn,
            handle: handle.clone(),
            events,
            state: SessionState::Init,
            peer: None,
            peer_info: None,
            rand_val: crypto::random_u64(),
            hello_sent: false,
            queue: Vec::new(),
            held: Vec::new(),
            assignments: HashMap::new(),
            reports: HashMap::new(),
            inflight: 0,
            opened_at: now_secs(),
            messages_in: 0,
            messages_out: 0,
        };
        session.publish();
        (session, handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> Option<PublicKey> {
        self.peer
    }

    pub fn peer_info(&self) -> Option<&NodeInfo> {
        self.peer_info.as_ref()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Drive the session until it closes.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle_event(event);
            if self.state == SessionState::Closed {
                break;
            }
        }
        tracing::debug!(session = self.id, "session loop finished");
    }

    /// Handle queued events until no spawned work is outstanding.
    pub async fn settle(&mut self) {
        loop {
            while let Ok(event) = self.events.try_recv() {
                self.handle_event(event);
            }
            if self.inflight == 0 {
                return;
            }
            match self.events.recv().await {
                Some(event) => self.handle_event(event),
                None => return,
            }
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        let completes_spawned = matches!(
            event,
            SessionEvent::PullDone { .. }
                | SessionEvent::VerificationDone { .. }
                | SessionEvent::NodeHandshakeDone { .. }
        );
        if completes_spawned {
            self.inflight = self.inflight.saturating_sub(1);
        }
        if self.state == SessionState::Closed {
            tracing::debug!(session = self.id, ?event, "session closed, event dropped");
            return;
        }

        match event {
            SessionEvent::Incoming(msg) => self.handle_message(msg),
            SessionEvent::PullDone { subtask_id, result } => self.on_pull_done(&subtask_id, result),
            SessionEvent::VerificationDone {
                subtask_id,
                accepted,
            } => self.on_verification_done(&subtask_id, accepted),
            SessionEvent::NodeHandshakeDone { node, ok } => self.on_node_handshake_done(node, ok),
            SessionEvent::RequestTask(header) => self.request_task(header),
            SessionEvent::ResultReady { subtask_id } => {
                match self.ctx.hooks.resources.result_package(&subtask_id) {
                    Some(result) => self.send_report_computed_task(&subtask_id, result),
                    None => tracing::warn!(subtask = %subtask_id, "no shared result package, not reporting"),
                }
            }
            SessionEvent::ConnectionLost => {
                tracing::info!(session = self.id, "connection lost");
                self.close();
            }
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Verify and route one message from the peer.
    pub fn handle_message(&mut self, msg: Message) {
        if self.state == SessionState::Closed {
            return;
        }
        self.messages_in += 1;
        let kind = msg.kind();

        if self.state != SessionState::Verified && !kind.allowed_unverified() {
            tracing::warn!(session = self.id, %kind, "message before handshake, dropped");
            return;
        }

        let claimed = match (&msg, self.peer) {
            (Message::Hello(hello), _) => hello.body.client_key_id,
            (_, Some(peer)) => peer,
            (_, None) => *msg.sender(),
        };
        if !msg.verify(&claimed) {
            tracing::warn!(
                session = self.id,
                %kind,
                sender = %msg.sender_id(),
                "signature check failed, dropped"
            );
            return;
        }

        tracing::debug!(session = self.id, %kind, task = ?msg.task_id(), subtask = ?msg.subtask_id(), "received");

        match msg {
            Message::Hello(m) => self.on_hello(m),
            Message::Disconnect(m) => self.on_disconnect(m),
            other => match self.peer {
                Some(peer) => self.dispatch(peer, other),
                None => tracing::warn!(session = self.id, %kind, "no verified peer, dropped"),
            },
        }
    }

    fn dispatch(&mut self, peer: PublicKey, msg: Message) {
        match msg {
            Message::WantToComputeTask(m) => self.on_want_to_compute_task(peer, m),
            Message::TaskToCompute(m) => self.on_task_to_compute(peer, m),
            Message::CannotAssignTask(m) => self.on_cannot_assign_task(peer, m),
            Message::CannotComputeTask(m) => self.on_cannot_compute_task(peer, m),
            Message::ReportComputedTask(m) => self.on_report_computed_task(peer, m),
            Message::AckReportComputedTask(m) => self.on_ack_report_computed_task(peer, m),
            Message::RejectReportComputedTask(m) => self.on_reject_report_computed_task(peer, m),
            Message::SubtaskResultsAccepted(m) => self.on_subtask_results_accepted(peer, m),
            Message::SubtaskResultsRejected(m) => self.on_subtask_results_rejected(peer, m),
            Message::WaitingForResults(m) => self.on_waiting_for_results(peer, m),
            other => tracing::warn!(
                session = self.id,
                kind = %other.kind(),
                "no handler for message kind, dropped"
            ),
        }
    }

    // ── Outgoing ──────────────────────────────────────────────────────────────

    fn sign<T: Body>(&self, body: T) -> Option<Signed<T>> {
        match Signed::sign(body, &self.ctx.keypair) {
            Ok(signed) => Some(signed),
            Err(e) => {
                tracing::error!(error = %e, kind = T::TAG, "failed to sign message");
                None
            }
        }
    }

    /// Send now if verified, otherwise queue until the handshake completes.
    fn send(&mut self, msg: Message) {
        if self.state == SessionState::Closed {
            tracing::debug!(session = self.id, kind = %msg.kind(), "session closed, not sending");
            return;
        }
        if self.state != SessionState::Verified && !msg.kind().allowed_unverified() {
            self.queue.push(msg);
            return;
        }
        self.transmit(msg);
    }

    fn transmit(&mut self, msg: Message) {
        let kind = msg.kind();
        match self.conn.send(msg) {
            Ok(()) => {
                self.messages_out += 1;
                tracing::debug!(session = self.id, %kind, "sent");
            }
            Err(e) => tracing::warn!(session = self.id, %kind, error = %e, "send failed"),
        }
    }

    fn flush_queue(&mut self) {
        for msg in std::mem::take(&mut self.queue) {
            self.transmit(msg);
        }
    }

    /// Record a task message exchanged with `peer` in history.
    fn record(&self, msg: &Message, peer: &PublicKey, local: Actor) {
        let remote = match local {
            Actor::Requestor => Actor::Provider,
            Actor::Provider => Actor::Requestor,
        };
        if let Err(e) = self.ctx.stores.history.add(msg, peer, local, remote) {
            tracing::warn!(session = self.id, error = %e, "failed to record message");
        }
    }

    /// Spawn `work`; its event re-enters this session through the loop.
    fn spawn_outcome<F>(&mut self, work: F)
    where
        F: Future<Output = SessionEvent> + Send + 'static,
    {
        self.inflight += 1;
        let tx = self.handle.tx.clone();
        tokio::spawn(async move {
            let event = work.await;
            let _ = tx.send(event);
        });
    }

    /// Is the arbiter involved for this assignment?
    fn concent_for(&self, ttc: &TaskToCompute) -> bool {
        self.ctx.config.concent_enabled && ttc.concent_enabled
    }

    /// Fetch a previously exchanged message of `kind` from history.
    fn stored(&self, kind: MessageKind, peer: &PublicKey, task_id: &str, subtask_id: &str) -> Option<Message> {
        match self
            .ctx
            .stores
            .history
            .get(kind, peer, task_id, Some(subtask_id))
        {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::debug!(session = self.id, error = %e, "history miss");
                None
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    fn publish(&self) {
        self.ctx.stores.directory.update_session(SessionInfo {
            id: self.id,
            peer_key_id: self.peer.map(hex::encode),
            peer_addr: self.conn.peer_addr(),
            state: self.state,
            opened_at: self.opened_at,
            messages_in: self.messages_in,
            messages_out: self.messages_out,
        });
    }

    /// Stop sending and release the connection. Escalation timers armed by
    /// this session keep running. Reports still being collected or verified
    /// can no longer be answered here; they fail once their escalations
    /// settle.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.queue.clear();
        self.conn.close();
        for (subtask_id, report) in std::mem::take(&mut self.reports) {
            let unanswered = self.ctx.stores.ledger.get(&subtask_id).is_some_and(|entry| {
                !entry.is_final() && entry.state != SubtaskState::Escalated
            });
            if unanswered {
                self.fail_when_escalation_settles(&subtask_id, report.sender, "session closed before results were verified");
            }
        }
        self.ctx.hooks.computer.session_closed();
        self.ctx.stores.directory.remove_session(self.id);
        tracing::info!(
            session = self.id,
            peer = ?self.peer.map(|p| hex::encode(&p[..8])),
            "session closed"
        );
    }
}

#[cfg(test)]
pub(crate) mod testkit;
