//! Requestor side: answering offers, receiving reports, verdicts.

use tasknet_core::crypto::PublicKey;
use tasknet_core::message::{
    AckReportComputedTask, Body, CannotAssignReason, CannotAssignTask, CannotComputeTask,
    ForceGetTaskResult, RejectReportComputedTask, RejectReportReason, ReportComputedTask,
    ResultsRejectedReason, SubtaskResultsAccepted, SubtaskResultsRejected, TaskToCompute,
    WaitingForResults, WantToComputeTask,
};
use tasknet_core::task::now_secs;
use tasknet_core::{Message, MessageKind, Signed};

use super::{Session, SessionEvent};
use crate::history::Actor;
use crate::hooks::{HandshakeStatus, HookError};
use crate::ledger::{LedgerEntry, Outcome, SubtaskState};

impl Session {
    // ── Offers ────────────────────────────────────────────────────────────────

    pub(super) fn on_want_to_compute_task(&mut self, peer: PublicKey, msg: Signed<WantToComputeTask>) {
        let our_key = self.ctx.keypair.public;
        let task_id = msg.body.task_header.body.task_id.clone();
        let tasks = self.ctx.hooks.tasks.clone();

        if !tasks.is_my_task(&task_id) || !msg.body.task_header.verify(&our_key) {
            tracing::info!(session = self.id, task = %task_id, "offer for a task that is not ours");
            self.cannot_assign(peer, &task_id, CannotAssignReason::NotMyTask);
            return;
        }
        if msg.body.provider_public_key != peer {
            tracing::warn!(session = self.id, task = %task_id, "offer names a different provider key");
            self.cannot_assign(peer, &task_id, CannotAssignReason::WrongKey);
            return;
        }

        match self.ctx.hooks.handshakes.status(&peer) {
            HandshakeStatus::Done => {}
            HandshakeStatus::InProgress => {
                tracing::warn!(session = self.id, task = %task_id, "node handshake in progress, holding offer");
                self.held.push(msg);
                return;
            }
            HandshakeStatus::Required => {
                tracing::warn!(session = self.id, task = %task_id, "node handshake required, holding offer");
                self.held.push(msg);
                let handshake = self.ctx.hooks.handshakes.start(&peer);
                self.spawn_outcome(async move {
                    SessionEvent::NodeHandshakeDone {
                        node: peer,
                        ok: handshake.await,
                    }
                });
                return;
            }
        }

        self.record(&Message::from(msg.clone()), &peer, Actor::Requestor);

        if msg.body.price > self.ctx.config.max_price {
            tracing::info!(
                session = self.id,
                task = %task_id,
                price = msg.body.price,
                max = self.ctx.config.max_price,
                "offer price too high"
            );
            self.cannot_assign(peer, &task_id, CannotAssignReason::PriceTooHigh);
            return;
        }
        if let Err(reason) = self
            .ctx
            .hooks
            .policy
            .should_accept_provider(&peer, &task_id, &msg.body)
        {
            tracing::info!(session = self.id, task = %task_id, ?reason, "provider not accepted");
            self.cannot_assign(peer, &task_id, reason);
            return;
        }
        if let Some(subtask_id) = tasks.should_wait_for_node(&task_id, &peer) {
            tracing::info!(session = self.id, task = %task_id, subtask = %subtask_id, "provider still owes results");
            if let Some(waiting) = self.sign(WaitingForResults {
                task_id: task_id.clone(),
                subtask_id,
            }) {
                let waiting = Message::from(waiting);
                self.record(&waiting, &peer, Actor::Requestor);
                self.send(waiting);
            }
            return;
        }
        if !tasks.check_next_subtask(&task_id, msg.body.price) {
            self.cannot_assign(peer, &task_id, CannotAssignReason::NoMoreSubtasks);
            return;
        }
        let Some(ctd) = tasks.get_next_subtask(&task_id, &msg.body) else {
            self.cannot_assign(peer, &task_id, CannotAssignReason::NoMoreSubtasks);
            return;
        };
        let Some(package) = tasks.package_info(&task_id) else {
            tracing::warn!(session = self.id, task = %task_id, "no package for task");
            self.cannot_assign(peer, &task_id, CannotAssignReason::NoMoreSubtasks);
            return;
        };

        let subtask_id = ctd.subtask_id.clone();
        let concent_enabled = self.ctx.config.concent_enabled && msg.body.concent_enabled;
        let body = TaskToCompute {
            price: ctd.price,
            compute_task_def: Some(ctd),
            want_to_compute_task: msg,
            requestor_id: self.ctx.keypair.key_id(),
            requestor_public_key: our_key,
            requestor_ethereum_public_key: our_key,
            package_hash: package.package_hash,
            size: package.size,
            concent_enabled,
            resources_options: self.ctx.hooks.resources.resources_options(),
            ethsig: None,
        };
        let ttc = match Signed::sign_with_ethsig(body, &self.ctx.keypair) {
            Ok(ttc) => ttc,
            Err(e) => {
                tracing::error!(session = self.id, error = %e, "failed to sign TaskToCompute");
                return;
            }
        };

        let stores = &self.ctx.stores;
        stores
            .ledger
            .assign(&subtask_id, &task_id, &hex::encode(peer), Actor::Requestor);
        stores.directory.register_subtask(&subtask_id, &task_id, our_key);
        stores.directory.bind_session(&subtask_id, self.handle.clone());
        self.assignments.insert(subtask_id.clone(), ttc.clone());

        let msg = Message::from(ttc);
        self.record(&msg, &peer, Actor::Requestor);
        tracing::info!(session = self.id, task = %task_id, subtask = %subtask_id, "subtask assigned");
        self.send(msg);
    }

    fn cannot_assign(&mut self, peer: PublicKey, task_id: &str, reason: CannotAssignReason) {
        let Some(msg) = self.sign(CannotAssignTask {
            task_id: task_id.to_string(),
            reason,
        }) else {
            return;
        };
        let msg = Message::from(msg);
        self.record(&msg, &peer, Actor::Requestor);
        self.send(msg);
    }

    pub(super) fn on_node_handshake_done(&mut self, node: PublicKey, ok: bool) {
        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|offer| offer.sender == node);
        self.held = rest;

        if ok {
            tracing::debug!(session = self.id, held = ready.len(), "node handshake done, replaying offers");
            for offer in ready {
                self.on_want_to_compute_task(node, offer);
            }
        } else {
            tracing::warn!(session = self.id, held = ready.len(), "node handshake failed");
            for offer in ready {
                let task_id = offer.body.task_header.body.task_id.clone();
                self.cannot_assign(
                    node,
                    &task_id,
                    CannotAssignReason::Rejected("node handshake failed".into()),
                );
            }
        }
    }

    pub(super) fn on_cannot_compute_task(&mut self, peer: PublicKey, msg: Signed<CannotComputeTask>) {
        let Some(subtask_id) = msg.body.subtask_id().map(str::to_string) else {
            tracing::warn!(session = self.id, "CannotComputeTask without a subtask");
            return;
        };
        if self.ctx.hooks.tasks.node_for_subtask(&subtask_id) != Some(peer) {
            tracing::warn!(session = self.id, subtask = %subtask_id, "CannotComputeTask from a node not assigned the subtask, ignored");
            return;
        }
        if !msg.body.task_to_compute.verify(&self.ctx.keypair.public) {
            tracing::warn!(session = self.id, subtask = %subtask_id, "CannotComputeTask embeds a foreign assignment, ignored");
            return;
        }

        tracing::info!(session = self.id, subtask = %subtask_id, reason = ?msg.body.reason, "provider cannot compute");
        let reason = msg.body.reason;
        self.record(&Message::from(msg), &peer, Actor::Requestor);
        self.ctx.hooks.tasks.task_computation_cancelled(&subtask_id, reason);
        if let Err(e) = self.ctx.stores.ledger.close(&subtask_id) {
            tracing::debug!(session = self.id, error = %e, "no ledger entry to close");
        }
    }

    // ── Reports ───────────────────────────────────────────────────────────────

    pub(super) fn on_report_computed_task(&mut self, peer: PublicKey, msg: Signed<ReportComputedTask>) {
        let subtask_id = msg.body.subtask_id.clone();
        let Some(entry) = self.ctx.stores.ledger.get(&subtask_id) else {
            tracing::warn!(session = self.id, subtask = %subtask_id, "report for an unknown subtask, ignored");
            return;
        };
        if entry.role != Actor::Requestor || entry.peer_key_id != hex::encode(peer) {
            tracing::warn!(session = self.id, subtask = %subtask_id, "report from a node not assigned the subtask, ignored");
            return;
        }
        let ttc = &msg.body.task_to_compute;
        if !ttc.verify(&self.ctx.keypair.public)
            || ttc.body.subtask_id() != Some(subtask_id.as_str())
            || ttc.body.provider_public_key() != &peer
        {
            tracing::warn!(session = self.id, subtask = %subtask_id, "report embeds an assignment we did not make, ignored");
            return;
        }

        if entry.is_reported() {
            self.reacknowledge(peer, &entry);
            return;
        }

        self.record(&Message::from(msg.clone()), &peer, Actor::Requestor);

        let deadline = ttc
            .body
            .compute_task_def
            .as_ref()
            .map(|ctd| ctd.deadline)
            .unwrap_or(0);
        let concent = self.concent_for(&ttc.body);
        let ledger = self.ctx.stores.ledger.clone();

        if now_secs() > deadline.saturating_add(self.ctx.config.deadline_slack_secs) {
            tracing::info!(session = self.id, subtask = %subtask_id, deadline, "report after deadline");
            if let Some(reject) = self.sign(RejectReportComputedTask {
                attached_task_to_compute: ttc.clone(),
                reason: RejectReportReason::SubtaskTimeLimitExceeded,
            }) {
                let reject = Message::from(reject);
                self.record(&reject, &peer, Actor::Requestor);
                self.send(reject);
            }
            if let Err(e) = ledger.advance(&subtask_id, SubtaskState::Reported) {
                tracing::warn!(session = self.id, error = %e, "ledger");
            }
            if let Err(e) = ledger.finalize(&subtask_id, Outcome::Rejected) {
                tracing::warn!(session = self.id, error = %e, "ledger");
            }
            self.ctx
                .hooks
                .tasks
                .task_computation_failure(&subtask_id, "subtask time limit exceeded");
            return;
        }

        if let Some(ack) = self.sign(AckReportComputedTask {
            report_computed_task: msg.clone(),
        }) {
            let ack = Message::from(ack);
            self.record(&ack, &peer, Actor::Requestor);
            self.send(ack);
        }
        if let Err(e) = ledger.advance(&subtask_id, SubtaskState::Reported) {
            tracing::warn!(session = self.id, error = %e, "ledger");
        }
        self.reports.insert(subtask_id.clone(), msg.clone());

        if concent {
            if let Some(force) = self.sign(ForceGetTaskResult {
                report_computed_task: msg.clone(),
            }) {
                self.ctx.stores.escalation.submit(
                    &subtask_id,
                    force.into(),
                    Some(self.ctx.config.force_get_result_delay),
                );
            }
        }

        let pull = self.ctx.hooks.puller.pull_package(&msg);
        self.spawn_outcome(async move {
            SessionEvent::PullDone {
                subtask_id,
                result: pull.await,
            }
        });
    }

    /// A report for a subtask we already answered. Resend the same answer.
    fn reacknowledge(&mut self, peer: PublicKey, entry: &LedgerEntry) {
        for kind in [MessageKind::AckReportComputedTask, MessageKind::RejectReportComputedTask] {
            if let Some(answer) = self.stored(kind, &peer, &entry.task_id, &entry.subtask_id) {
                tracing::debug!(session = self.id, subtask = %entry.subtask_id, %kind, "duplicate report, resending answer");
                self.send(answer);
                return;
            }
        }
        tracing::debug!(session = self.id, subtask = %entry.subtask_id, "duplicate report, nothing to resend");
    }

    pub(super) fn on_pull_done(&mut self, subtask_id: &str, result: Result<(), HookError>) {
        let Some(report) = self.reports.get(subtask_id).cloned() else {
            tracing::warn!(session = self.id, subtask = subtask_id, "pull finished for an unknown report");
            return;
        };
        let ledger = self.ctx.stores.ledger.clone();
        let escalation = self.ctx.stores.escalation.clone();

        match result {
            Ok(()) => {
                tracing::info!(session = self.id, subtask = subtask_id, "results downloaded");
                escalation.cancel(subtask_id, MessageKind::ForceGetTaskResult);
                if let Err(e) = ledger.advance(subtask_id, SubtaskState::Verifying) {
                    tracing::warn!(session = self.id, error = %e, "ledger");
                    return;
                }
                let verify = self.ctx.hooks.verifier.verify_subtask(subtask_id);
                let subtask_id = subtask_id.to_string();
                self.spawn_outcome(async move {
                    SessionEvent::VerificationDone {
                        subtask_id,
                        accepted: verify.await,
                    }
                });
            }
            Err(e) => {
                tracing::warn!(session = self.id, subtask = subtask_id, error = %e, "results download failed");
                if self.concent_for(&report.body.task_to_compute.body) {
                    let provider = report.sender;
                    if let Some(force) = self.sign(ForceGetTaskResult {
                        report_computed_task: report,
                    }) {
                        escalation.submit(subtask_id, force.into(), None);
                    }
                    if let Err(e) = ledger.advance(subtask_id, SubtaskState::Escalated) {
                        tracing::warn!(session = self.id, error = %e, "ledger");
                        return;
                    }
                    self.fail_when_escalation_settles(subtask_id, provider, "results unavailable after arbiter escalation");
                } else {
                    if let Err(e) = ledger.finalize(subtask_id, Outcome::Rejected) {
                        tracing::warn!(session = self.id, error = %e, "ledger");
                        return;
                    }
                    self.ctx.hooks.payments.reject_result(subtask_id, &report.sender);
                    self.ctx
                        .hooks
                        .tasks
                        .task_computation_failure(subtask_id, &e.to_string());
                }
            }
        }
    }

    /// Reject `subtask_id` once every `ForceGetTaskResult` armed for it has
    /// fired or been cancelled, unless a verdict was recorded first. Runs
    /// detached so it outlives this session.
    pub(super) fn fail_when_escalation_settles(&self, subtask_id: &str, provider: PublicKey, reason: &'static str) {
        let escalation = self.ctx.stores.escalation.clone();
        let ledger = self.ctx.stores.ledger.clone();
        let hooks = self.ctx.hooks.clone();
        let subtask_id = subtask_id.to_string();
        let session = self.id;
        tokio::spawn(async move {
            escalation
                .settled(&subtask_id, MessageKind::ForceGetTaskResult)
                .await;
            if let Err(e) = ledger.finalize(&subtask_id, Outcome::Rejected) {
                tracing::debug!(session, error = %e, "verdict recorded before escalation settled");
                return;
            }
            tracing::warn!(session, subtask = %subtask_id, reason, "results never verified, subtask failed");
            hooks.payments.reject_result(&subtask_id, &provider);
            hooks.tasks.task_computation_failure(&subtask_id, reason);
        });
    }

    pub(super) fn on_verification_done(&mut self, subtask_id: &str, accepted: bool) {
        let Some(entry) = self.ctx.stores.ledger.get(subtask_id) else {
            tracing::warn!(session = self.id, subtask = subtask_id, "verification finished for an unknown subtask");
            return;
        };
        let Some(peer) = self.peer else {
            return;
        };
        let Some(report) = self.stored_report(&peer, &entry.task_id, subtask_id) else {
            tracing::error!(session = self.id, subtask = subtask_id, "no report to answer");
            return;
        };

        if accepted {
            if let Err(e) = self.ctx.stores.ledger.finalize(subtask_id, Outcome::Accepted) {
                tracing::debug!(session = self.id, error = %e, "verdict already given");
                return;
            }
            let price = report.body.task_to_compute.body.price;
            let payment_ts = self
                .ctx
                .hooks
                .payments
                .accept_result(subtask_id, &peer, price);
            if let Some(sra) = self.sign(SubtaskResultsAccepted {
                report_computed_task: report,
                payment_ts,
            }) {
                let sra = Message::from(sra);
                self.record(&sra, &peer, Actor::Requestor);
                self.send(sra);
            }
            self.ctx
                .stores
                .escalation
                .cancel(subtask_id, MessageKind::ForceSubtaskResults);
            tracing::info!(session = self.id, subtask = subtask_id, price, "results accepted");
        } else {
            if let Err(e) = self.ctx.stores.ledger.finalize(subtask_id, Outcome::Rejected) {
                tracing::debug!(session = self.id, error = %e, "verdict already given");
                return;
            }
            if let Some(srr) = self.sign(SubtaskResultsRejected {
                report_computed_task: report,
                reason: ResultsRejectedReason::VerificationNegative,
            }) {
                let srr = Message::from(srr);
                self.record(&srr, &peer, Actor::Requestor);
                self.send(srr);
            }
            self.ctx.hooks.payments.reject_result(subtask_id, &peer);
            tracing::info!(session = self.id, subtask = subtask_id, "results rejected");
            self.close();
        }
    }

    /// The report exactly as received, from history if it has it.
    fn stored_report(
        &self,
        peer: &PublicKey,
        task_id: &str,
        subtask_id: &str,
    ) -> Option<Signed<ReportComputedTask>> {
        match self.stored(MessageKind::ReportComputedTask, peer, task_id, subtask_id) {
            Some(Message::ReportComputedTask(report)) => Some(report),
            _ => {
                tracing::warn!(session = self.id, subtask = subtask_id, "report missing from history, using in-memory copy");
                self.reports.get(subtask_id).cloned()
            }
        }
    }
}
