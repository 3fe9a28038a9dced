//! Integration tests for the sender
//!
//! These tests verify:
//! - Oversized messages are refused before transmission and the sender
//!   stays usable
//! - Trace context flows from sender to handler through message properties
//! - Messages sent to a topic reach every subscription

mod common;

use common::{name, spawn_listen, wait_until, Probe, ScriptedHandler};
use peeklock::providers::BrokerOperation;
use peeklock::{
    BusError, BusTransport, HandlerSet, InMemoryConfig, InMemoryTransport, OutMessage, Receiver,
    ReceiverConfig, Sender, SenderConfig, TraceContext,
};
use std::sync::Arc;

fn sender(broker: &InMemoryTransport, entity: &str) -> Sender {
    Sender::new(
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        SenderConfig::new("memory://", name(entity)),
    )
}

/// Verify that an oversized message costs no transmission and does not
/// break the sender.
#[tokio::test]
async fn test_oversized_message_rejected_link_stays_healthy() {
    // Arrange
    let broker = InMemoryTransport::new(InMemoryConfig {
        max_message_size: 1024,
        ..Default::default()
    });
    let sender = sender(&broker, "orders");
    let trace = TraceContext::new_root();

    // Act
    let oversized = sender
        .send(&trace, OutMessage::new(vec![0u8; 2048]))
        .await;
    let normal = sender.send(&trace, OutMessage::new("fits")).await;

    // Assert
    assert!(matches!(
        oversized,
        Err(BusError::MessageOversized {
            size: 2048,
            max_size: 1024
        })
    ));
    assert!(normal.is_ok());
    assert_eq!(broker.count(BrokerOperation::Send), 1);
    assert_eq!(broker.active_message_count("orders"), 1);
}

/// Verify that the handler continues the trace the sender started.
#[tokio::test]
async fn test_trace_flows_from_sender_to_handler() {
    let broker = InMemoryTransport::default();
    let sender = sender(&broker, "orders");
    let trace = TraceContext::new_root();
    sender.send(&trace, OutMessage::new("traced")).await.unwrap();

    let probe = Probe::new();
    let transport: Arc<dyn BusTransport> = Arc::new(broker.clone());
    let receiver = Arc::new(
        Receiver::new(
            transport,
            ReceiverConfig::queue("memory://", name("orders")),
            HandlerSet::parallel(vec![ScriptedHandler::new(probe.clone()).arc()]),
        )
        .unwrap(),
    );

    let listening = spawn_listen(&receiver);
    wait_until(|| broker.count(BrokerOperation::Complete) == 1).await;
    receiver.shutdown().await.unwrap();

    assert!(listening.await.unwrap().is_ok());
    assert_eq!(probe.trace_ids(), vec![trace.trace_id().to_string()]);
}

/// Verify that a topic send fans out to every subscription receiver.
#[tokio::test]
async fn test_topic_send_reaches_each_subscription() {
    let broker = InMemoryTransport::default();
    broker.create_subscription("events", "audit");
    broker.create_subscription("events", "billing");
    let transport: Arc<dyn BusTransport> = Arc::new(broker.clone());

    let probes = [Probe::new(), Probe::new()];
    let receivers: Vec<Arc<Receiver>> = ["audit", "billing"]
        .iter()
        .zip(&probes)
        .map(|(subscription, probe)| {
            Arc::new(
                Receiver::new(
                    transport.clone(),
                    ReceiverConfig::subscription("memory://", name("events"), name(subscription)),
                    HandlerSet::parallel(vec![ScriptedHandler::new(probe.clone()).arc()]),
                )
                .unwrap(),
            )
        })
        .collect();
    let listening: Vec<_> = receivers.iter().map(spawn_listen).collect();

    sender(&broker, "events")
        .send(&TraceContext::new_root(), OutMessage::new("created"))
        .await
        .unwrap();
    wait_until(|| broker.count(BrokerOperation::Complete) == 2).await;
    for receiver in &receivers {
        receiver.shutdown().await.unwrap();
    }

    for handle in listening {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(probes[0].handled(), vec!["created"]);
    assert_eq!(probes[1].handled(), vec!["created"]);
    assert_eq!(receivers[0].to_string(), "events.audit");
}
