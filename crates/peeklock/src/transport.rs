//! Traits describing the broker transport consumed by receivers and senders.
//!
//! The runtime never talks to a broker directly. A transport hands out one
//! link per receiver or sender; links carry the per-message operations.
//! Settlement calls are not given a cancellation token: once a handler has
//! decided what to do with a message the decision is always transmitted.

use crate::error::BusError;
use crate::message::{EntityName, OutMessage, OutMessageBatch, ReceivedMessage};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Sub-queue of an entity a receiver reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubQueue {
    /// The entity itself
    #[default]
    None,
    /// The dead-letter sub-queue holding explicitly rejected messages
    DeadLetter,
}

/// Address of the entity a receiver link is opened against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiverEntity {
    pub topic_or_queue: EntityName,
    /// Present in topic/subscription mode, absent in queue mode
    pub subscription: Option<EntityName>,
    pub sub_queue: SubQueue,
}

impl ReceiverEntity {
    /// Address a queue
    pub fn queue(name: EntityName) -> Self {
        Self {
            topic_or_queue: name,
            subscription: None,
            sub_queue: SubQueue::None,
        }
    }

    /// Address a topic subscription
    pub fn subscription(topic: EntityName, subscription: EntityName) -> Self {
        Self {
            topic_or_queue: topic,
            subscription: Some(subscription),
            sub_queue: SubQueue::None,
        }
    }

    /// Address the dead-letter sub-queue of this entity instead
    pub fn dead_letter(mut self) -> Self {
        self.sub_queue = SubQueue::DeadLetter;
        self
    }
}

impl fmt::Display for ReceiverEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic_or_queue)?;
        if let Some(subscription) = &self.subscription {
            write!(f, ".{}", subscription)?;
        }
        if self.sub_queue == SubQueue::DeadLetter {
            write!(f, ".deadletter")?;
        }
        Ok(())
    }
}

/// Connection to a broker namespace
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Open a peek-lock receiver link
    async fn open_receiver(
        &self,
        entity: &ReceiverEntity,
    ) -> Result<Arc<dyn ReceiverLink>, BusError>;

    /// Open a sender link for a queue or topic
    async fn open_sender(&self, entity: &EntityName) -> Result<Arc<dyn SenderLink>, BusError>;
}

/// Management-plane queries
#[async_trait]
pub trait BusAdministration: Send + Sync {
    /// Maximum permitted message body size, in bytes, for a queue or topic
    async fn max_message_size(&self, entity: &EntityName) -> Result<u64, BusError>;
}

/// Receiving side of a link.
///
/// `receive_messages` waits until at least one message is available; callers
/// abort a pending receive by dropping the future.
#[async_trait]
pub trait ReceiverLink: Send + Sync {
    /// Receive up to `max_messages` messages under peek lock
    async fn receive_messages(&self, max_messages: usize)
        -> Result<Vec<ReceivedMessage>, BusError>;

    /// Extend the peek lock on a message
    async fn renew_message_lock(&self, message: &ReceivedMessage) -> Result<(), BusError>;

    /// Acknowledge the message, removing it permanently
    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), BusError>;

    /// Release the lock so the message is redelivered
    async fn abandon_message(&self, message: &ReceivedMessage) -> Result<(), BusError>;

    /// Move the message to the dead-letter sub-queue with a reason
    async fn dead_letter_message(
        &self,
        message: &ReceivedMessage,
        reason: &str,
    ) -> Result<(), BusError>;

    /// Detach the link
    async fn close(&self) -> Result<(), BusError>;
}

/// Sending side of a link
#[async_trait]
pub trait SenderLink: Send + Sync {
    /// Transmit a single message
    async fn send_message(&self, message: OutMessage) -> Result<(), BusError>;

    /// Create an empty batch sized to the broker's batch limit
    async fn create_message_batch(&self) -> Result<OutMessageBatch, BusError>;

    /// Transmit an accumulated batch in one call
    async fn send_message_batch(&self, batch: OutMessageBatch) -> Result<(), BusError>;

    /// Detach the link
    async fn close(&self) -> Result<(), BusError>;
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
