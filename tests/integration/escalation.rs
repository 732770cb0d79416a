//! Arbiter escalation between two live nodes. Time is paused; sleeping
//! past an escalation delay fires it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;

use tasknet_core::message::ReportComputedTask;
use tasknet_core::{MessageKind, Signed};
use tasknet_services::escalation::SubmissionState;
use tasknet_services::hooks::{HookError, ResultPuller};
use tasknet_services::ledger::{Outcome, SubtaskState};
use tasknet_services::tasks::SubtaskProgress;
use tasknet_services::SessionEvent;

use crate::failures::Unconvinced;
use crate::*;

const LIMIT: Duration = Duration::from_secs(5);

/// Puller whose storage is never reachable.
struct Unreachable;

impl ResultPuller for Unreachable {
    fn pull_package(&self, _report: &Signed<ReportComputedTask>) -> BoxFuture<'static, Result<(), HookError>> {
        Box::pin(async { Err(HookError::PullFailed("storage unreachable".into())) })
    }
}

async fn issued_subtask(requestor: &TestNode, task_id: &str) -> Result<String> {
    wait_until("subtask issued", LIMIT, || first_subtask(requestor, task_id).is_some()).await?;
    first_subtask(requestor, task_id).context("no subtask")
}

#[tokio::test(start_paused = true)]
async fn failed_pull_escalates_on_both_sides() -> Result<()> {
    let mut requestor = TestNode::requestor("requestor", true);
    requestor.hooks.puller = Arc::new(Unreachable);
    let provider = TestNode::new("provider", true);
    let header = requestor.create_task(spec(1));
    let task_id = header.body.task_id.clone();

    let link = connect(&provider, &requestor, None);
    link.provider.send(SessionEvent::RequestTask(header));
    let subtask = issued_subtask(&requestor, &task_id).await?;

    wait_until("requestor escalates", LIMIT, || {
        requestor.entry(&subtask).map(|e| e.state) == Some(SubtaskState::Escalated)
    })
    .await?;
    wait_until("provider acknowledged", LIMIT, || {
        provider
            .stores
            .escalation
            .pending(&subtask, MessageKind::ForceSubtaskResults)
            == 1
    })
    .await?;

    // The failed pull goes to the arbiter at once.
    assert_eq!(requestor.arbiter.classes(), vec![MessageKind::ForceGetTaskResult]);
    assert!(provider.arbiter.classes().is_empty());

    // The delayed request armed on the report is never cancelled, so it
    // fires too.
    tokio::time::sleep(requestor.config.force_get_result_delay + Duration::from_secs(1)).await;
    assert_eq!(
        requestor.arbiter.classes(),
        vec![MessageKind::ForceGetTaskResult, MessageKind::ForceGetTaskResult]
    );
    assert!(provider.arbiter.classes().is_empty());

    // Both stages fired and no package came: the subtask fails and goes
    // back on the board instead of blocking the provider's next offer.
    wait_until("requestor gives up", LIMIT, || {
        requestor.outcome(&subtask) == Some(Outcome::Rejected)
    })
    .await?;
    let issued = requestor.board.subtask(&subtask).context("subtask left the board")?;
    assert_eq!(issued.progress, SubtaskProgress::Failed);
    assert_eq!(requestor.board.remaining(&task_id), 1);

    // No verdict ever reaches the provider; it asks the arbiter for one.
    tokio::time::sleep(provider.config.force_results_delay).await;
    assert_eq!(provider.arbiter.classes(), vec![MessageKind::ForceSubtaskResults]);
    assert_eq!(provider.outcome(&subtask), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejected_results_are_sent_for_verification() -> Result<()> {
    let mut requestor = TestNode::requestor("requestor", true);
    requestor.hooks.verifier = Arc::new(Unconvinced);
    let provider = TestNode::new("provider", true);
    let header = requestor.create_task(spec(1));
    let task_id = header.body.task_id.clone();

    let link = connect(&provider, &requestor, None);
    link.provider.send(SessionEvent::RequestTask(header));
    let subtask = issued_subtask(&requestor, &task_id).await?;

    wait_until("provider sees the rejection", LIMIT, || {
        provider.outcome(&subtask) == Some(Outcome::Rejected)
    })
    .await?;
    assert_eq!(provider.arbiter.classes(), vec![MessageKind::SubtaskResultsVerify]);

    tokio::time::sleep(Duration::from_secs(1000)).await;
    assert_eq!(provider.arbiter.classes(), vec![MessageKind::SubtaskResultsVerify]);
    assert!(requestor.arbiter.classes().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn answered_steps_never_reach_the_arbiter() -> Result<()> {
    let requestor = TestNode::requestor("requestor", true);
    let provider = TestNode::new("provider", true);
    let header = requestor.create_task(spec(1));
    let task_id = header.body.task_id.clone();

    let link = connect(&provider, &requestor, None);
    link.provider.send(SessionEvent::RequestTask(header));
    let subtask = issued_subtask(&requestor, &task_id).await?;

    wait_until("both sides settle on Accepted", LIMIT, || {
        requestor.outcome(&subtask) == Some(Outcome::Accepted)
            && provider.outcome(&subtask) == Some(Outcome::Accepted)
    })
    .await?;

    tokio::time::sleep(Duration::from_secs(1000)).await;
    assert!(requestor.arbiter.classes().is_empty());
    assert!(provider.arbiter.classes().is_empty());

    let armed: Vec<_> = provider
        .stores
        .escalation
        .list()
        .into_iter()
        .chain(requestor.stores.escalation.list())
        .collect();
    assert!(!armed.is_empty());
    assert!(armed.iter().all(|e| e.state == SubmissionState::Cancelled));
    assert!(armed.iter().any(|e| e.class == MessageKind::ForceReportComputedTask));
    assert!(armed.iter().any(|e| e.class == MessageKind::ForceGetTaskResult));
    Ok(())
}
