//! Tests for best-effort message settlement.

use super::*;
use crate::disposition::{dispose, Disposition};
use crate::test_support::{received_message, LinkCall, LogCapture, ScriptedLink};

fn lock_lost(message: &ReceivedMessage) -> BusError {
    BusError::MessageLockLost {
        message_id: message.message_id.to_string(),
    }
}

fn detached(_message: &ReceivedMessage) -> BusError {
    BusError::transport("settle", "link detached")
}

/// Successful settlement calls go straight to the link.
#[tokio::test]
async fn test_settlement_calls_link() {
    let link = ScriptedLink::new();
    let settler = MessageSettler::new(link.clone());
    let message = received_message("payload");
    let id = message.message_id.to_string();

    settler.complete(&message).await.unwrap();
    settler.abandon(None, &message).await.unwrap();

    assert_eq!(
        link.calls(),
        vec![LinkCall::Complete(id.clone()), LinkCall::Abandon(id)]
    );
}

/// The handler error text becomes the dead-letter reason.
#[tokio::test]
async fn test_dead_letter_reason_from_error() {
    let link = ScriptedLink::new();
    let settler = MessageSettler::new(link.clone());
    let message = received_message("payload");
    let error = anyhow::anyhow!("schema mismatch");

    settler.dead_letter(Some(&error), &message).await.unwrap();

    assert_eq!(
        link.calls(),
        vec![LinkCall::DeadLetter(
            message.message_id.to_string(),
            "schema mismatch".to_string()
        )]
    );
}

/// Reschedule leaves the lock to expire and makes no call.
#[tokio::test]
async fn test_reschedule_is_a_no_op() {
    let link = ScriptedLink::new();
    let settler = MessageSettler::new(link.clone());
    let message = received_message("payload");

    settler
        .reschedule(Some(&anyhow::anyhow!("try later")), &message)
        .await
        .unwrap();

    assert!(link.calls().is_empty());
}

/// Every valid disposition returns Ok even though the broker call fails,
/// and the call is still attempted.
#[tokio::test]
async fn test_failures_are_absorbed() {
    // Arrange
    let link = ScriptedLink::new();
    link.fail_settlement_with(detached);
    let settler = MessageSettler::new(link.clone());
    let message = received_message("payload");
    let error = anyhow::anyhow!("boom");

    // Act
    for disposition in [
        Disposition::Complete,
        Disposition::Abandon,
        Disposition::Deadletter,
        Disposition::Reschedule,
    ] {
        let result = dispose(&settler, disposition, Some(&error), &message).await;
        assert!(result.is_ok(), "{disposition} should not surface the failure");
    }

    // Assert
    assert_eq!(link.calls().len(), 3, "complete, abandon and deadletter attempted");
}

/// A lost lock is logged distinctly from other settlement failures.
#[tokio::test]
async fn test_lock_lost_is_logged_distinctly() {
    let (logs, _guard) = LogCapture::install();
    let link = ScriptedLink::new();
    link.fail_settlement_with(lock_lost);
    let settler = MessageSettler::new(link.clone());
    let message = received_message("payload");

    settler.complete(&message).await.unwrap();

    assert!(logs.contains("Message lock expired before settlement"));
    assert!(!logs.contains("Failed to settle message"));
}

#[tokio::test]
async fn test_transport_failure_is_logged() {
    let (logs, _guard) = LogCapture::install();
    let link = ScriptedLink::new();
    link.fail_settlement_with(detached);
    let settler = MessageSettler::new(link.clone());

    settler.complete(&received_message("payload")).await.unwrap();

    assert!(logs.contains("Failed to settle message"));
    assert!(logs.contains("link detached"));
}
