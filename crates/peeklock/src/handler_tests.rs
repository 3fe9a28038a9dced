//! Tests for handler types and handler set validation.

use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct CountingHandler {
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_open: bool,
}

#[async_trait]
impl Handler for CountingHandler {
    async fn open(&self) -> Result<(), HandlerError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            anyhow::bail!("database unavailable");
        }
        Ok(())
    }

    async fn handle(&self, context: MessageContext, _message: &ReceivedMessage) -> HandlerOutcome {
        HandlerOutcome::complete(context)
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct NoopBatchHandler;

#[async_trait]
impl BatchHandler for NoopBatchHandler {
    async fn handle(&self, context: MessageContext, messages: &[ReceivedMessage]) -> BatchOutcome {
        BatchOutcome::new(vec![Disposition::Complete; messages.len()], context, None)
    }
}

fn context() -> MessageContext {
    MessageContext::new(
        CancellationToken::new(),
        TraceContext::new_root(),
        Span::none(),
    )
}

// ============================================================================
// Handler Set Validation Tests
// ============================================================================

mod validation {
    use super::*;

    #[test]
    fn test_empty_parallel_set_rejected() {
        let set = HandlerSet::parallel(Vec::new());
        assert!(matches!(
            set.validate(),
            Err(ConfigurationError::Invalid { .. })
        ));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let serial = HandlerSet::serial(Arc::new(CountingHandler::default()), 0);
        let batch = HandlerSet::batch(Arc::new(NoopBatchHandler), 0);

        let error = serial.validate().unwrap_err();
        assert!(error.to_string().contains("serial batch size"));
        assert!(batch.validate().is_err());
    }

    #[test]
    fn test_valid_sets() {
        let handler: Arc<dyn Handler> = Arc::new(CountingHandler::default());
        assert!(HandlerSet::parallel(vec![handler.clone(), handler.clone()])
            .validate()
            .is_ok());
        assert!(HandlerSet::serial(handler, 10).validate().is_ok());
        assert!(HandlerSet::batch(Arc::new(NoopBatchHandler), 10)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_fetch_size_follows_topology() {
        let handler: Arc<dyn Handler> = Arc::new(CountingHandler::default());
        assert_eq!(
            HandlerSet::parallel(vec![handler.clone(), handler.clone(), handler.clone()])
                .fetch_size(),
            3
        );
        assert_eq!(HandlerSet::serial(handler, 7).fetch_size(), 7);
        assert_eq!(HandlerSet::batch(Arc::new(NoopBatchHandler), 4).fetch_size(), 4);
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

mod lifecycle {
    use super::*;

    /// Every handler in a parallel set is opened and closed.
    #[tokio::test]
    async fn test_parallel_set_opens_and_closes_all() {
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());
        let set = HandlerSet::parallel(vec![first.clone() as Arc<dyn Handler>, second.clone()]);

        set.open().await.unwrap();
        set.close().await;

        assert_eq!(first.opened.load(Ordering::SeqCst), 1);
        assert_eq!(second.opened.load(Ordering::SeqCst), 1);
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
        assert_eq!(second.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let failing = Arc::new(CountingHandler {
            fail_open: true,
            ..Default::default()
        });
        let set = HandlerSet::serial(failing, 1);

        let result = set.open().await;

        assert!(matches!(
            result,
            Err(BusError::HandlerFailed { ref message }) if message == "database unavailable"
        ));
    }
}

// ============================================================================
// Outcome and Lock-Lost Detection Tests
// ============================================================================

#[test]
fn test_outcome_constructors() {
    let outcome = HandlerOutcome::dead_letter(context(), anyhow::anyhow!("bad"));
    assert_eq!(outcome.disposition, Disposition::Deadletter);
    assert!(outcome.error.is_some());

    let outcome = HandlerOutcome::complete(context());
    assert_eq!(outcome.disposition, Disposition::Complete);
    assert!(outcome.error.is_none());
}

#[test]
fn test_lock_lost_detected_through_context() {
    let error = HandlerError::from(BusError::MessageLockLost {
        message_id: "m-1".to_string(),
    })
    .context("settling downstream write");

    assert!(is_lock_lost(&error));
    assert!(!is_lock_lost(&anyhow::anyhow!("plain failure")));
}

#[test]
fn test_context_with_trace() {
    let trace = TraceContext::new_root();
    let updated = context().with_trace(trace.clone());
    assert_eq!(updated.trace(), &trace);
    assert!(!updated.is_cancelled());
}
