//! Happy paths: offer, assignment, report, verdict, payment.

use std::time::Duration;

use anyhow::{Context, Result};

use tasknet_core::message::CannotAssignReason;
use tasknet_core::{Message, MessageKind};
use tasknet_services::ledger::{Outcome, SubtaskState};
use tasknet_services::tasks::SubtaskProgress;
use tasknet_services::SessionEvent;

use crate::*;

const LIMIT: Duration = Duration::from_secs(5);

/// One subtask: provider offers, computes, reports; requestor pays.
#[tokio::test]
async fn offered_subtask_is_computed_and_paid() -> Result<()> {
    let requestor = TestNode::requestor("requestor", false);
    let provider = TestNode::new("provider", false);
    let header = requestor.create_task(spec(1));
    let task_id = header.body.task_id.clone();

    let link = connect(&provider, &requestor, None);
    assert!(link.provider.send(SessionEvent::RequestTask(header)));

    wait_until("subtask issued", LIMIT, || first_subtask(&requestor, &task_id).is_some()).await?;
    let subtask = first_subtask(&requestor, &task_id).context("no subtask")?;

    wait_until("both sides settle on Accepted", LIMIT, || {
        requestor.outcome(&subtask) == Some(Outcome::Accepted)
            && provider.outcome(&subtask) == Some(Outcome::Accepted)
    })
    .await?;

    let issued = requestor.board.subtask(&subtask).context("subtask left the board")?;
    assert_eq!(issued.progress, SubtaskProgress::Finished);
    assert_eq!(issued.provider, provider.keypair.public);
    assert_eq!(requestor.board.remaining(&task_id), 0);

    let seen = requestor.history_classes(&subtask);
    assert!(seen.contains(&MessageKind::TaskToCompute));
    assert!(seen.contains(&MessageKind::ReportComputedTask));
    assert!(seen.contains(&MessageKind::SubtaskResultsAccepted));

    let seen = provider.history_classes(&subtask);
    assert!(seen.contains(&MessageKind::TaskToCompute));
    assert!(seen.contains(&MessageKind::AckReportComputedTask));
    assert!(seen.contains(&MessageKind::SubtaskResultsAccepted));

    let entry = provider.entry(&subtask).context("provider ledger entry")?;
    assert_eq!(entry.peer_key_id, requestor.keypair.key_id());
    assert_eq!(entry.state, SubtaskState::Accepted);

    // Both ends of the pipe stay up after an accepted verdict.
    assert!(link.provider.is_alive());
    assert!(link.requestor.is_alive());
    assert_eq!(requestor.stores.directory.verified_sessions(), 1);
    assert_eq!(provider.stores.directory.verified_sessions(), 1);
    Ok(())
}

/// The same session serves successive offers until the task runs out.
#[tokio::test]
async fn task_runs_out_of_subtasks() -> Result<()> {
    let requestor = TestNode::requestor("requestor", false);
    let provider = TestNode::new("provider", false);
    let header = requestor.create_task(spec(2));
    let task_id = header.body.task_id.clone();

    let link = connect(&provider, &requestor, None);
    for round in 1..=2usize {
        link.provider.send(SessionEvent::RequestTask(header.clone()));
        wait_until("subtask accepted", LIMIT, || {
            let accepted = requestor
                .board
                .get(&task_id)
                .map(|view| {
                    view.subtasks
                        .iter()
                        .filter(|s| s.progress == SubtaskProgress::Finished)
                        .count()
                })
                .unwrap_or(0);
            accepted == round
        })
        .await?;
    }
    assert_eq!(requestor.board.remaining(&task_id), 0);
    assert_eq!(requestor.stores.ledger.counts().0, 2);

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
            assert!(matches!(refusal.body.reason, CannotAssignReason::NoMoreSubtasks));
        }
        other => panic!("unexpected record {:?}", other.kind()),
    }
    assert_eq!(provider.stores.directory.requests_in_flight(&task_id), 0);
    Ok(())
}

/// A provider that offers again while still computing is told to finish
/// first, and its pending result is still collected.
#[tokio::test]
async fn second_offer_while_computing_waits_for_results() -> Result<()> {
    let requestor = TestNode::requestor("requestor", false);
    let provider = TestNode::new("provider", false).computing_for(Duration::from_millis(300));
    let header = requestor.create_task(spec(3));
    let task_id = header.body.task_id.clone();

    let link = connect(&provider, &requestor, None);
    link.provider.send(SessionEvent::RequestTask(header.clone()));
    link.provider.send(SessionEvent::RequestTask(header));

    let owner = requestor.keypair.public;
    wait_until("WaitingForResults recorded", LIMIT, || {
        provider
            .stores
            .history
            .get(MessageKind::WaitingForResults, &owner, &task_id, None)
            .is_ok()
    })
    .await?;

    let subtask = first_subtask(&requestor, &task_id).context("no subtask")?;
    wait_until("first subtask accepted", LIMIT, || {
        provider.outcome(&subtask) == Some(Outcome::Accepted)
    })
    .await?;

    // Only one subtask was issued to the busy provider.
    let view = requestor.board.get(&task_id).context("task missing")?;
    assert_eq!(view.subtasks.len(), 1);
    assert_eq!(view.remaining, 2);
    Ok(())
}

/// An offer above the requestor's price ceiling is refused outright.
#[tokio::test]
async fn overpriced_offer_is_refused() -> Result<()> {
    let requestor = TestNode::requestor("requestor", false);
    let provider = TestNode::with_config(SessionConfig {
        node_name: "greedy".into(),
        key_difficulty: KEY_DIFFICULTY,
        offer_price: requestor.config.max_price + 1,
        ..SessionConfig::default()
    });
    let header = requestor.create_task(spec(1));
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
            assert!(matches!(refusal.body.reason, CannotAssignReason::PriceTooHigh));
        }
        other => panic!("unexpected record {:?}", other.kind()),
    }
    assert!(first_subtask(&requestor, &task_id).is_none());
    assert_eq!(requestor.board.remaining(&task_id), 1);
    Ok(())
}
