//! Provider side: offering, taking assignments, reporting results.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use tasknet_core::crypto::PublicKey;
use tasknet_core::message::{
    AckReportComputedTask, Body, CannotAssignTask, CannotComputeReason, CannotComputeTask,
    ForceReportComputedTask, ForceSubtaskResults, RejectReportComputedTask, ReportComputedTask,
    SubtaskResultsAccepted, SubtaskResultsRejected, SubtaskResultsVerify, TaskToCompute,
    WaitingForResults, WantToComputeTask,
};
use tasknet_core::task::{ComputeTaskDef, NodeInfo, TaskHeader};
use tasknet_core::{Message, MessageKind, Signed};

use super::Session;
use crate::history::Actor;
use crate::hooks::{EnvironmentInfo, ResultPackage};
use crate::ledger::{Outcome, SubtaskState};

impl Session {
    // ── Offering ──────────────────────────────────────────────────────────────

    /// Offer to compute a subtask of `header`'s task. The peer must be the
    /// task owner.
    pub fn request_task(&mut self, header: Signed<TaskHeader>) {
        let task_id = header.body.task_id.clone();
        let owner = header.body.task_owner.key;
        if !header.verify(&owner) {
            tracing::warn!(session = self.id, task = %task_id, "task header not signed by its owner");
            return;
        }
        if self.peer.is_some_and(|peer| peer != owner) {
            tracing::warn!(session = self.id, task = %task_id, "peer does not own the task, not offering");
            return;
        }

        let directory = &self.ctx.stores.directory;
        if !directory.register_task_owner(&task_id, owner) {
            tracing::warn!(session = self.id, task = %task_id, "task id already recorded under another owner, not offering");
            return;
        }

        let cfg = self.ctx.config.clone();
        let Some(offer) = self.sign(WantToComputeTask {
            task_header: header,
            perf_index: cfg.perf_index,
            price: cfg.offer_price,
            max_resource_size: cfg.max_resource_size,
            max_memory_size: cfg.max_memory_size,
            node_name: cfg.node_name.clone(),
            provider_public_key: self.ctx.keypair.public,
            concent_enabled: cfg.concent_enabled,
        }) else {
            return;
        };

        self.ctx.stores.directory.add_request(&task_id);

        let msg = Message::from(offer);
        self.record(&msg, &owner, Actor::Provider);
        tracing::info!(session = self.id, task = %task_id, price = cfg.offer_price, "offering to compute");
        self.send(msg);
    }

    pub(super) fn on_cannot_assign_task(&mut self, peer: PublicKey, msg: Signed<CannotAssignTask>) {
        let task_id = msg.body.task_id.clone();
        if !self.ctx.stores.directory.cancel_request(&task_id, &peer) {
            tracing::warn!(session = self.id, task = %task_id, "CannotAssignTask not from the task owner, ignored");
            return;
        }
        tracing::info!(session = self.id, task = %task_id, reason = ?msg.body.reason, "offer refused");
        self.record(&Message::from(msg), &peer, Actor::Provider);
    }

    pub(super) fn on_waiting_for_results(&mut self, peer: PublicKey, msg: Signed<WaitingForResults>) {
        let WaitingForResults { task_id, subtask_id } = msg.body.clone();
        if self
            .ctx
            .stores
            .directory
            .owner_of(&task_id)
            .is_some_and(|owner| owner != peer)
        {
            tracing::warn!(session = self.id, task = %task_id, "WaitingForResults not from the task owner, ignored");
            return;
        }
        self.record(&Message::from(msg), &peer, Actor::Provider);
        self.ctx.hooks.computer.subtask_waiting(&task_id, &subtask_id);
    }

    // ── Assignment ────────────────────────────────────────────────────────────

    pub(super) fn on_task_to_compute(&mut self, peer: PublicKey, msg: Signed<TaskToCompute>) {
        let our_key = self.ctx.keypair.public;
        let Some(ctd) = msg.body.compute_task_def.clone() else {
            tracing::warn!(session = self.id, "TaskToCompute without a task definition");
            self.close();
            return;
        };
        let offer = &msg.body.want_to_compute_task;
        if !offer.verify(&our_key) || offer.body.provider_public_key != our_key {
            tracing::warn!(session = self.id, subtask = %ctd.subtask_id, "TaskToCompute embeds an offer we did not make");
            self.close();
            return;
        }
        if !msg.verify_ethsig() {
            tracing::warn!(session = self.id, subtask = %ctd.subtask_id, "TaskToCompute payment signature invalid");
            self.close();
            return;
        }

        let task_id = ctd.task_id.clone();
        let subtask_id = ctd.subtask_id.clone();
        let peer_key_id = hex::encode(peer);
        if self.ctx.stores.ledger.get(&subtask_id).is_some_and(|entry| {
            entry.role == Actor::Provider && entry.peer_key_id == peer_key_id && entry.task_id == task_id
        }) {
            tracing::debug!(session = self.id, subtask = %subtask_id, "assignment repeated, ignored");
            return;
        }
        self.ctx.stores.directory.cancel_request(&task_id, &peer);

        let env = match self.check_assignment(peer, &msg.body, &ctd) {
            Ok(env) => env,
            Err(reason) => return self.cannot_compute(peer, msg, reason),
        };

        // The ledger entry claims the subtask id.
        let stores = self.ctx.stores.clone();
        if !stores
            .ledger
            .assign(&subtask_id, &task_id, &peer_key_id, Actor::Provider)
        {
            return self.cannot_compute(peer, msg, CannotComputeReason::WrongCTD);
        }
        stores.directory.register_subtask(&subtask_id, &task_id, peer);
        stores.directory.bind_session(&subtask_id, self.handle.clone());
        self.assignments.insert(subtask_id.clone(), msg.clone());
        self.record(&Message::from(msg), &peer, Actor::Provider);

        tracing::info!(session = self.id, task = %task_id, subtask = %subtask_id, env = %env.id, "subtask accepted for computing");
        self.ctx.hooks.computer.task_given(&ctd, &env);
    }

    fn cannot_compute(&mut self, peer: PublicKey, ttc: Signed<TaskToCompute>, reason: CannotComputeReason) {
        tracing::info!(session = self.id, subtask = ?ttc.body.subtask_id(), ?reason, "cannot compute");
        if let Some(reply) = self.sign(CannotComputeTask {
            task_to_compute: ttc,
            reason,
        }) {
            let reply = Message::from(reply);
            self.record(&reply, &peer, Actor::Provider);
            self.send(reply);
        }
        self.close();
    }

    /// Checks run in this order; the first failure is the reason given.
    fn check_assignment(
        &self,
        peer: PublicKey,
        ttc: &TaskToCompute,
        ctd: &ComputeTaskDef,
    ) -> Result<EnvironmentInfo, CannotComputeReason> {
        let header = &ttc.want_to_compute_task.body.task_header.body;
        if ctd.task_id != header.task_id {
            return Err(CannotComputeReason::WrongCTD);
        }
        let stores = &self.ctx.stores;
        if stores.ledger.get(&ctd.subtask_id).is_some() || stores.directory.task_for(&ctd.subtask_id).is_some() {
            tracing::warn!(session = self.id, subtask = %ctd.subtask_id, "subtask id already in use");
            return Err(CannotComputeReason::WrongCTD);
        }
        if header.task_owner.key != peer || ttc.requestor_public_key != peer {
            return Err(CannotComputeReason::WrongKey);
        }
        if !self.owner_address_matches(&header.task_owner) {
            return Err(CannotComputeReason::WrongAddress);
        }
        if ttc.size > self.ctx.config.max_resource_size {
            return Err(CannotComputeReason::ResourcesTooBig);
        }
        let env = self
            .ctx
            .hooks
            .environments
            .get_environment_by_id(&ctd.environment)
            .ok_or(CannotComputeReason::WrongEnvironment)?;
        if !env.accepts_images(&ctd.docker_images) {
            return Err(CannotComputeReason::WrongDockerImages);
        }
        Ok(env)
    }

    /// True unless both the transport address and the owner's advertised
    /// address are known and name different hosts.
    fn owner_address_matches(&self, owner: &NodeInfo) -> bool {
        let (Some(seen), Some(advertised)) = (self.conn.peer_addr(), owner.pub_addr.as_deref()) else {
            return true;
        };
        let host = seen
            .parse::<SocketAddr>()
            .map(|addr| addr.ip().to_string())
            .unwrap_or(seen);
        advertised.is_empty() || host == advertised
    }

    // ── Reporting ─────────────────────────────────────────────────────────────

    /// Report a finished subtask to its owner.
    pub fn send_report_computed_task(&mut self, subtask_id: &str, result: ResultPackage) {
        let Some(entry) = self.ctx.stores.ledger.get(subtask_id) else {
            tracing::warn!(session = self.id, subtask = subtask_id, "result for an unknown subtask");
            return;
        };
        if entry.role != Actor::Provider || entry.is_final() {
            tracing::warn!(session = self.id, subtask = subtask_id, state = ?entry.state, "subtask not awaiting a report");
            return;
        }
        let Some(owner) = self.ctx.stores.directory.subtask_owner(subtask_id) else {
            tracing::warn!(session = self.id, subtask = subtask_id, "no owner recorded for subtask");
            return;
        };
        let ttc = match self.stored(MessageKind::TaskToCompute, &owner, &entry.task_id, subtask_id) {
            Some(Message::TaskToCompute(ttc)) => ttc,
            _ => {
                tracing::warn!(session = self.id, subtask = subtask_id, "assignment missing from history, using in-memory copy");
                match self.assignments.get(subtask_id).cloned() {
                    Some(ttc) => ttc,
                    None => {
                        tracing::error!(session = self.id, subtask = subtask_id, "no assignment to report against");
                        return;
                    }
                }
            }
        };

        let cfg = self.ctx.config.clone();
        let concent = self.concent_for(&ttc.body);
        let Some(report) = self.sign(ReportComputedTask {
            subtask_id: subtask_id.to_string(),
            task_to_compute: ttc,
            node_name: cfg.node_name.clone(),
            address: cfg.public_addr.clone().unwrap_or_default(),
            port: cfg.public_port.unwrap_or(0),
            node_info: self.local_node_info(),
            package_hash: result.package_hash.clone(),
            multihash: result.multihash,
            secret: result.secret,
            size: result.size,
            extra_data: BTreeMap::new(),
        }) else {
            return;
        };

        let msg = Message::from(report.clone());
        self.record(&msg, &owner, Actor::Provider);
        if let Err(e) = self.ctx.stores.ledger.advance(subtask_id, SubtaskState::Reported) {
            tracing::warn!(session = self.id, error = %e, "ledger");
        }
        tracing::info!(session = self.id, subtask = subtask_id, size = result.size, "reporting computed subtask");
        self.send(msg);

        if concent {
            if let Some(force) = self.sign(ForceReportComputedTask {
                report_computed_task: report,
                result_hash: result.package_hash,
            }) {
                self.ctx.stores.escalation.submit(
                    subtask_id,
                    force.into(),
                    Some(cfg.force_report_delay),
                );
            }
        }
    }

    /// Subtask id of a message answering one of our reports, if `peer` may
    /// answer it and the embedded report is ours.
    fn answered_subtask(&self, peer: &PublicKey, kind: MessageKind, subtask_id: Option<&str>, report_ok: bool) -> Option<String> {
        let Some(subtask_id) = subtask_id else {
            tracing::warn!(session = self.id, %kind, "answer without a subtask id");
            return None;
        };
        if !self.ctx.stores.directory.is_authorized(subtask_id, peer) {
            tracing::warn!(session = self.id, %kind, subtask = subtask_id, "answer not from the subtask owner, ignored");
            return None;
        }
        if !report_ok {
            tracing::warn!(session = self.id, %kind, subtask = subtask_id, "answer embeds a report we did not send, ignored");
            return None;
        }
        Some(subtask_id.to_string())
    }

    pub(super) fn on_ack_report_computed_task(&mut self, peer: PublicKey, msg: Signed<AckReportComputedTask>) {
        let ours = msg.body.report_computed_task.verify(&self.ctx.keypair.public);
        let Some(subtask_id) =
            self.answered_subtask(&peer, MessageKind::AckReportComputedTask, msg.body.subtask_id(), ours)
        else {
            return;
        };
        if self
            .ctx
            .stores
            .ledger
            .get(&subtask_id)
            .map_or(true, |entry| entry.is_final())
        {
            tracing::debug!(session = self.id, subtask = %subtask_id, "ack for a finished subtask, ignored");
            return;
        }

        let escalation = self.ctx.stores.escalation.clone();
        escalation.cancel(&subtask_id, MessageKind::ForceReportComputedTask);
        let concent = self.concent_for(&msg.body.report_computed_task.body.task_to_compute.body);
        self.record(&Message::from(msg.clone()), &peer, Actor::Provider);
        tracing::info!(session = self.id, subtask = %subtask_id, "report acknowledged");

        if concent && escalation.pending(&subtask_id, MessageKind::ForceSubtaskResults) == 0 {
            if let Some(force) = self.sign(ForceSubtaskResults {
                ack_report_computed_task: msg,
            }) {
                escalation.submit(
                    &subtask_id,
                    force.into(),
                    Some(self.ctx.config.force_results_delay),
                );
            }
        }
    }

    pub(super) fn on_reject_report_computed_task(&mut self, peer: PublicKey, msg: Signed<RejectReportComputedTask>) {
        let attached = &msg.body.attached_task_to_compute;
        let ours = attached.verify(&peer) && attached.body.provider_public_key() == &self.ctx.keypair.public;
        let Some(subtask_id) =
            self.answered_subtask(&peer, MessageKind::RejectReportComputedTask, msg.body.subtask_id(), ours)
        else {
            return;
        };

        self.ctx
            .stores
            .escalation
            .cancel(&subtask_id, MessageKind::ForceReportComputedTask);
        tracing::info!(session = self.id, subtask = %subtask_id, reason = ?msg.body.reason, "report rejected");
        self.record(&Message::from(msg), &peer, Actor::Provider);
        if let Err(e) = self.ctx.stores.ledger.finalize(&subtask_id, Outcome::Rejected) {
            tracing::debug!(session = self.id, error = %e, "ledger");
        }
    }

    // ── Verdicts ──────────────────────────────────────────────────────────────

    pub(super) fn on_subtask_results_accepted(&mut self, peer: PublicKey, msg: Signed<SubtaskResultsAccepted>) {
        let ours = msg.body.report_computed_task.verify(&self.ctx.keypair.public);
        let Some(subtask_id) =
            self.answered_subtask(&peer, MessageKind::SubtaskResultsAccepted, msg.body.subtask_id(), ours)
        else {
            return;
        };
        if let Err(e) = self.ctx.stores.ledger.finalize(&subtask_id, Outcome::Accepted) {
            tracing::debug!(session = self.id, error = %e, "verdict already received");
            return;
        }

        let price = msg.body.report_computed_task.body.task_to_compute.body.price;
        self.ctx
            .hooks
            .payments
            .subtask_accepted(&subtask_id, &peer, price, msg.body.payment_ts);
        self.ctx
            .stores
            .escalation
            .cancel(&subtask_id, MessageKind::ForceSubtaskResults);
        tracing::info!(session = self.id, subtask = %subtask_id, price, "results accepted by requestor");
        self.record(&Message::from(msg), &peer, Actor::Provider);
    }

    pub(super) fn on_subtask_results_rejected(&mut self, peer: PublicKey, msg: Signed<SubtaskResultsRejected>) {
        let ours = msg.body.report_computed_task.verify(&self.ctx.keypair.public);
        let Some(subtask_id) =
            self.answered_subtask(&peer, MessageKind::SubtaskResultsRejected, msg.body.subtask_id(), ours)
        else {
            return;
        };
        if let Err(e) = self.ctx.stores.ledger.finalize(&subtask_id, Outcome::Rejected) {
            tracing::debug!(session = self.id, error = %e, "verdict already received");
            return;
        }

        self.ctx.hooks.payments.subtask_rejected(&subtask_id, &peer);
        let escalation = self.ctx.stores.escalation.clone();
        escalation.cancel(&subtask_id, MessageKind::ForceSubtaskResults);
        tracing::info!(session = self.id, subtask = %subtask_id, reason = ?msg.body.reason, "results rejected by requestor");
        self.record(&Message::from(msg.clone()), &peer, Actor::Provider);

        if self.concent_for(&msg.body.report_computed_task.body.task_to_compute.body) {
            if let Some(verify) = self.sign(SubtaskResultsVerify {
                subtask_results_rejected: msg,
            }) {
                escalation.submit(&subtask_id, verify.into(), None);
            }
        }
        self.close();
    }
}
