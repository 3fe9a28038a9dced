//! Tests for the crate-root surface.

use super::*;
use async_trait::async_trait;
use std::sync::Arc;

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, context: MessageContext, _message: &ReceivedMessage) -> HandlerOutcome {
        HandlerOutcome::complete(context)
    }
}

/// Verify that a receiver can be assembled from crate-root names alone.
#[test]
fn test_root_exports_build_a_receiver() {
    let transport: Arc<dyn BusTransport> = Arc::new(InMemoryTransport::default());
    let name = EntityName::new("orders".to_string()).unwrap();

    let receiver = Receiver::new(
        transport,
        ReceiverConfig::queue("memory://", name).with_lock_renewal(DEFAULT_RENEWAL_TIME),
        HandlerSet::parallel(vec![Arc::new(Echo) as Arc<dyn Handler>]),
    )
    .unwrap();

    assert_eq!(receiver.to_string(), "orders");
}

#[test]
fn test_lock_constants() {
    assert!(DEFAULT_RENEWAL_TIME < PEEK_LOCK_TIMEOUT);
    assert_eq!(PEEK_LOCK_TIMEOUT.as_secs(), 60);
}

#[test]
fn test_disposition_names_round_trip() {
    for disposition in Disposition::ALL {
        assert_eq!(Disposition::from_name(disposition.as_str()), disposition);
    }
    assert_eq!(Disposition::from_name("garbage"), Disposition::Unknown);
}
