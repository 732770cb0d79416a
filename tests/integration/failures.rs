//! Refusals and negative verdicts between two live nodes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;

use tasknet_core::message::{CannotAssignReason, CannotComputeReason};
use tasknet_core::task::{generate_id, now_secs, TaskHeader};
use tasknet_core::{Message, MessageKind, Signed};
use tasknet_services::hooks::ResultVerifier;
use tasknet_services::ledger::{Outcome, SubtaskState};
use tasknet_services::tasks::SubtaskProgress;
use tasknet_services::SessionEvent;

use crate::*;

const LIMIT: Duration = Duration::from_secs(5);

/// Verifier that finds fault with every result.
pub struct Unconvinced;

impl ResultVerifier for Unconvinced {
    fn verify_subtask(&self, _subtask_id: &str) -> BoxFuture<'static, bool> {
        Box::pin(async { false })
    }
}

/// Last CannotComputeTask the requestor recorded for `subtask_id`.
fn cannot_compute_reason(requestor: &TestNode, provider: &TestNode, task_id: &str, subtask_id: &str) -> Option<CannotComputeReason> {
    match requestor.stores.history.get(
        MessageKind::CannotComputeTask,
        &provider.keypair.public,
        task_id,
        Some(subtask_id),
    ) {
        Ok(Message::CannotComputeTask(msg)) => Some(msg.body.reason),
        _ => None,
    }
}

#[tokio::test]
async fn negative_verification_rejects_and_frees_the_subtask() -> Result<()> {
    let mut requestor = TestNode::requestor("requestor", false);
    requestor.hooks.verifier = Arc::new(Unconvinced);
    let provider = TestNode::new("provider", false);
    let header = requestor.create_task(spec(1));
    let task_id = header.body.task_id.clone();

    let link = connect(&provider, &requestor, None);
    link.provider.send(SessionEvent::RequestTask(header));

    wait_until("subtask issued", LIMIT, || first_subtask(&requestor, &task_id).is_some()).await?;
    let subtask = first_subtask(&requestor, &task_id).context("no subtask")?;

    wait_until("both sides settle on Rejected", LIMIT, || {
        requestor.outcome(&subtask) == Some(Outcome::Rejected)
            && provider.outcome(&subtask) == Some(Outcome::Rejected)
    })
    .await?;

    assert!(provider
        .history_classes(&subtask)
        .contains(&MessageKind::SubtaskResultsRejected));
    let issued = requestor.board.subtask(&subtask).context("subtask left the board")?;
    assert_eq!(issued.progress, SubtaskProgress::Failed);
    assert_eq!(requestor.board.remaining(&task_id), 1);

    // The requestor hangs up after a rejection.
    wait_until("sessions closed", LIMIT, || {
        !link.requestor.is_alive() && !link.provider.is_alive()
    })
    .await?;
    assert!(provider.arbiter.classes().is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_environment_is_cancelled_by_the_provider() -> Result<()> {
    let requestor = TestNode::requestor("requestor", false);
    let provider = TestNode::new("provider", false);
    let header = requestor.create_task(TaskSpec {
        environment: "GPU".into(),
        ..spec(1)
    });
    let task_id = header.body.task_id.clone();

    let link = connect(&provider, &requestor, None);
    link.provider.send(SessionEvent::RequestTask(header));

    wait_until("subtask issued", LIMIT, || first_subtask(&requestor, &task_id).is_some()).await?;
    let subtask = first_subtask(&requestor, &task_id).context("no subtask")?;

    wait_until("cancellation recorded", LIMIT, || {
        cannot_compute_reason(&requestor, &provider, &task_id, &subtask).is_some()
    })
    .await?;
    assert!(matches!(
        cannot_compute_reason(&requestor, &provider, &task_id, &subtask),
        Some(CannotComputeReason::WrongEnvironment)
    ));

    let issued = requestor.board.subtask(&subtask).context("subtask left the board")?;
    assert_eq!(issued.progress, SubtaskProgress::Cancelled);
    assert_eq!(requestor.board.remaining(&task_id), 1);
    assert_eq!(
        requestor.entry(&subtask).map(|e| e.state),
        Some(SubtaskState::Closed)
    );
    // The provider never took the subtask on.
    assert!(provider.entry(&subtask).is_none());
    Ok(())
}

#[tokio::test]
async fn owner_seen_at_another_address_is_refused() -> Result<()> {
    let requestor = TestNode::requestor("requestor", false);
    let provider = TestNode::new("provider", false);
    let header = requestor.create_task(spec(1));
    let task_id = header.body.task_id.clone();

    let link = connect(&provider, &requestor, Some("10.9.9.9:40102"));
    link.provider.send(SessionEvent::RequestTask(header));

    wait_until("subtask issued", LIMIT, || first_subtask(&requestor, &task_id).is_some()).await?;
    let subtask = first_subtask(&requestor, &task_id).context("no subtask")?;

    wait_until("cancellation recorded", LIMIT, || {
        cannot_compute_reason(&requestor, &provider, &task_id, &subtask).is_some()
    })
    .await?;
    assert!(matches!(
        cannot_compute_reason(&requestor, &provider, &task_id, &subtask),
        Some(CannotComputeReason::WrongAddress)
    ));
    Ok(())
}

/// A header genuinely signed by the requestor, but for a task it never
/// created, gets NotMyTask.
#[tokio::test]
async fn offer_for_a_task_not_on_the_board_is_refused() -> Result<()> {
    let requestor = TestNode::requestor("requestor", false);
    let provider = TestNode::new("provider", false);
    let header = Signed::sign(
        TaskHeader {
            task_id: generate_id(),
            task_owner: requestor.info(),
            environment: DEFAULT_ENVIRONMENT.into(),
            subtask_timeout: 600,
            deadline: now_secs() + 3600,
            max_price: 50,
            subtasks_count: 1,
            resource_size: 0,
        },
        &requestor.keypair,
    )?;
    let task_id = header.body.task_id.clone();

    let link = connect(&provider, &requestor, None);
    link.provider.send(SessionEvent::RequestTask(header));

    let owner = requestor.keypair.public;
    wait_until("refusal recorded", LIMIT, || {
        provider
            .stores
            .history
            .get(MessageKind::CannotAssignTask, &owner, &task_id, None)
            .is_ok()
    })
    .await?;
    match provider
        .stores
        .history
        .get(MessageKind::CannotAssignTask, &owner, &task_id, None)?
    {
        Message::CannotAssignTask(refusal) => {
            assert!(matches!(refusal.body.reason, CannotAssignReason::NotMyTask));
        }
        other => panic!("unexpected record {:?}", other.kind()),
    }
    assert!(requestor.board.is_empty());
    Ok(())
}
