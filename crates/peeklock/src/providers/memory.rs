//! In-memory peek-lock broker for testing and development.
//!
//! This module provides a fully functional in-memory broker that:
//! - Supports queues and topics with fan-out to subscriptions
//! - Hands messages out under peek locks that expire and are redelivered
//! - Tracks delivery counts and dead-letters messages that exceed the limit
//! - Keeps a dead-letter sub-queue per entity
//! - Records every operation in a journal and supports failure injection
//!
//! Lock expiry runs on the tokio clock, so tests using paused time see locks
//! expire as time is advanced.

use crate::error::BusError;
use crate::lease::PEEK_LOCK_TIMEOUT;
use crate::message::{
    EntityName, LockToken, MessageId, OutMessage, OutMessageBatch, ReceivedMessage, Timestamp,
};
use crate::transport::{
    BusAdministration, BusTransport, ReceiverEntity, ReceiverLink, SenderLink, SubQueue,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Path suffix of a dead-letter sub-queue
pub const DEAD_LETTER_SUFFIX: &str = "/$deadletterqueue";

/// Reason recorded when a message runs out of delivery attempts
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

// ============================================================================
// Configuration
// ============================================================================

/// Limits enforced by the in-memory broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryConfig {
    /// How long a peek lock lasts without renewal
    pub lock_duration: Duration,
    /// Largest accepted message body
    pub max_message_size: u64,
    /// Largest accepted batch
    pub max_batch_size_in_bytes: usize,
    /// Deliveries allowed before a message is dead-lettered
    pub max_delivery_count: u32,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            lock_duration: PEEK_LOCK_TIMEOUT,
            max_message_size: 256 * 1024,
            max_batch_size_in_bytes: 256 * 1024,
            max_delivery_count: 10,
        }
    }
}

// ============================================================================
// Journal and Fault Injection
// ============================================================================

/// Broker operations, as recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    OpenReceiver,
    OpenSender,
    MaxMessageSize,
    Receive,
    RenewLock,
    Complete,
    Abandon,
    DeadLetter,
    Send,
    SendBatch,
    CloseReceiver,
    CloseSender,
}

impl BrokerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenReceiver => "open_receiver",
            Self::OpenSender => "open_sender",
            Self::MaxMessageSize => "max_message_size",
            Self::Receive => "receive",
            Self::RenewLock => "renew_lock",
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::DeadLetter => "dead_letter",
            Self::Send => "send",
            Self::SendBatch => "send_batch",
            Self::CloseReceiver => "close_receiver",
            Self::CloseSender => "close_sender",
        }
    }
}

impl fmt::Display for BrokerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One journaled broker call
#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub operation: BrokerOperation,
    /// Entity path the call targeted
    pub entity: String,
    pub message_id: Option<MessageId>,
    /// Receive size, dead-letter reason or batch size, depending on the call
    pub detail: Option<String>,
    pub succeeded: bool,
}

/// Failure returned by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `BusError::Transport`
    Transport,
    /// `BusError::ConnectionFailed`
    Connection,
    /// `BusError::MessageLockLost`
    LockLost,
}

struct FaultPlan {
    fault: Fault,
    /// `None` fails every call
    remaining: Option<usize>,
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored in an entity
#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    sequence_number: i64,
    body: Bytes,
    properties: HashMap<String, String>,
    correlation_id: Option<String>,
    enqueued_at: Timestamp,
    delivery_count: u32,
    dead_letter_reason: Option<String>,
}

/// A message currently held under a peek lock
struct LockedMessage {
    message: StoredMessage,
    locked_until: Instant,
}

#[derive(Default)]
struct EntityQueue {
    available: VecDeque<StoredMessage>,
    locked: HashMap<LockToken, LockedMessage>,
}

impl EntityQueue {
    /// Put a message back in sequence order
    fn requeue(&mut self, message: StoredMessage) {
        let position = self
            .available
            .iter()
            .position(|m| m.sequence_number > message.sequence_number)
            .unwrap_or(self.available.len());
        self.available.insert(position, message);
    }
}

#[derive(Default)]
struct Entities {
    queues: HashMap<String, EntityQueue>,
    /// Topic name to subscription names
    topics: HashMap<String, Vec<String>>,
    next_sequence: i64,
}

impl Entities {
    fn queue_mut(&mut self, path: &str) -> &mut EntityQueue {
        self.queues.entry(path.to_string()).or_default()
    }

    /// Move expired locks back to the queue, or to the dead-letter queue
    /// when the message is out of deliveries
    fn reclaim_expired(&mut self, path: &str, now: Instant, max_delivery_count: u32) {
        let Some(queue) = self.queues.get_mut(path) else {
            return;
        };
        let expired: Vec<LockToken> = queue
            .locked
            .iter()
            .filter(|(_, locked)| locked.locked_until <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            let released = self
                .queues
                .get_mut(path)
                .and_then(|q| q.locked.remove(&token));
            if let Some(locked) = released {
                self.release(path, locked.message, max_delivery_count);
            }
        }
    }

    /// Return a message whose lock has ended without settlement.
    /// Dead-letter queues have no delivery limit.
    fn release(&mut self, path: &str, message: StoredMessage, max_delivery_count: u32) {
        if message.delivery_count >= max_delivery_count && !path.ends_with(DEAD_LETTER_SUFFIX) {
            self.dead_letter(path, message, MAX_DELIVERY_COUNT_EXCEEDED);
        } else {
            self.queue_mut(path).requeue(message);
        }
    }

    fn dead_letter(&mut self, path: &str, mut message: StoredMessage, reason: &str) {
        message.dead_letter_reason = Some(reason.to_string());
        let dead_letter_path = dead_letter_path(path);
        self.queue_mut(&dead_letter_path).requeue(message);
    }

    /// Next instant at which a lock held on `path` expires
    fn next_expiry(&self, path: &str) -> Option<Instant> {
        self.queues
            .get(path)?
            .locked
            .values()
            .map(|locked| locked.locked_until)
            .min()
    }
}

/// Shared broker state
struct BrokerState {
    config: InMemoryConfig,
    entities: Mutex<Entities>,
    arrivals: Notify,
    journal: Mutex<Vec<BrokerEvent>>,
    faults: Mutex<HashMap<BrokerOperation, FaultPlan>>,
}

/// Lock a std mutex, recovering the data if a panicking test poisoned it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Storage path of a topic subscription
pub fn subscription_path(topic: &str, subscription: &str) -> String {
    format!("{}/subscriptions/{}", topic, subscription)
}

/// Storage path of the dead-letter sub-queue of `path`
pub fn dead_letter_path(path: &str) -> String {
    if path.ends_with(DEAD_LETTER_SUFFIX) {
        path.to_string()
    } else {
        format!("{}{}", path, DEAD_LETTER_SUFFIX)
    }
}

/// Storage path a receiver entity reads from
pub fn entity_path(entity: &ReceiverEntity) -> String {
    let path = match &entity.subscription {
        Some(subscription) => {
            subscription_path(entity.topic_or_queue.as_str(), subscription.as_str())
        }
        None => entity.topic_or_queue.to_string(),
    };
    match entity.sub_queue {
        SubQueue::None => path,
        SubQueue::DeadLetter => dead_letter_path(&path),
    }
}

/// Snapshot of a stored message, for inspecting broker contents in tests
#[derive(Debug, Clone)]
pub struct PeekedMessage {
    pub message_id: MessageId,
    pub sequence_number: i64,
    pub body: Bytes,
    pub application_properties: HashMap<String, String>,
    pub delivery_count: u32,
    pub dead_letter_reason: Option<String>,
}

impl From<&StoredMessage> for PeekedMessage {
    fn from(message: &StoredMessage) -> Self {
        Self {
            message_id: message.message_id.clone(),
            sequence_number: message.sequence_number,
            body: message.body.clone(),
            application_properties: message.properties.clone(),
            delivery_count: message.delivery_count,
            dead_letter_reason: message.dead_letter_reason.clone(),
        }
    }
}

// ============================================================================
// InMemoryTransport
// ============================================================================

/// In-memory broker implementing [`BusTransport`] and [`BusAdministration`]
#[derive(Clone)]
pub struct InMemoryTransport {
    state: Arc<BrokerState>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

impl InMemoryTransport {
    /// Create new in-memory broker with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            state: Arc::new(BrokerState {
                config,
                entities: Mutex::new(Entities::default()),
                arrivals: Notify::new(),
                journal: Mutex::new(Vec::new()),
                faults: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &InMemoryConfig {
        &self.state.config
    }

    // ------------------------------------------------------------------------
    // Entity management
    // ------------------------------------------------------------------------

    /// Create a queue; sending to an unknown name creates it too
    pub fn create_queue(&self, name: &str) {
        lock(&self.state.entities).queue_mut(name);
    }

    /// Create a topic with no subscriptions
    pub fn create_topic(&self, topic: &str) {
        lock(&self.state.entities)
            .topics
            .entry(topic.to_string())
            .or_default();
    }

    /// Create a subscription, creating the topic if needed
    pub fn create_subscription(&self, topic: &str, subscription: &str) {
        let mut entities = lock(&self.state.entities);
        let subscriptions = entities.topics.entry(topic.to_string()).or_default();
        if !subscriptions.iter().any(|s| s == subscription) {
            subscriptions.push(subscription.to_string());
        }
        entities.queue_mut(&subscription_path(topic, subscription));
    }

    /// Put a message directly into a queue or topic, bypassing size checks
    pub fn enqueue(&self, entity: &str, message: OutMessage) -> MessageId {
        let message_id = message.message_id.clone().unwrap_or_default();
        self.store(entity, &message_id, message);
        message_id
    }

    fn store(&self, entity: &str, message_id: &MessageId, message: OutMessage) {
        let mut entities = lock(&self.state.entities);
        let targets: Vec<String> = match entities.topics.get(entity) {
            Some(subscriptions) => subscriptions
                .iter()
                .map(|s| subscription_path(entity, s))
                .collect(),
            None => vec![entity.to_string()],
        };

        for target in targets {
            entities.next_sequence += 1;
            let stored = StoredMessage {
                message_id: message_id.clone(),
                sequence_number: entities.next_sequence,
                body: message.body.clone(),
                properties: message.application_properties.clone(),
                correlation_id: message.correlation_id.clone(),
                enqueued_at: Timestamp::now(),
                delivery_count: 0,
                dead_letter_reason: None,
            };
            entities.queue_mut(&target).available.push_back(stored);
        }
        drop(entities);
        self.state.arrivals.notify_waiters();
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Messages waiting to be received at `path`
    pub fn active_message_count(&self, path: &str) -> usize {
        lock(&self.state.entities)
            .queues
            .get(path)
            .map_or(0, |q| q.available.len())
    }

    /// Messages currently held under a lock at `path`
    pub fn locked_message_count(&self, path: &str) -> usize {
        lock(&self.state.entities)
            .queues
            .get(path)
            .map_or(0, |q| q.locked.len())
    }

    /// Messages in the dead-letter sub-queue of `path`
    pub fn dead_letter_count(&self, path: &str) -> usize {
        self.active_message_count(&dead_letter_path(path))
    }

    /// Snapshot of the messages waiting at `path`, in delivery order
    pub fn peek(&self, path: &str) -> Vec<PeekedMessage> {
        lock(&self.state.entities)
            .queues
            .get(path)
            .map(|q| q.available.iter().map(PeekedMessage::from).collect())
            .unwrap_or_default()
    }

    /// Snapshot of the dead-letter sub-queue of `path`
    pub fn peek_dead_letters(&self, path: &str) -> Vec<PeekedMessage> {
        self.peek(&dead_letter_path(path))
    }

    /// Every call made so far, in order
    pub fn journal(&self) -> Vec<BrokerEvent> {
        lock(&self.state.journal).clone()
    }

    /// Journaled calls of one kind
    pub fn operations(&self, operation: BrokerOperation) -> Vec<BrokerEvent> {
        lock(&self.state.journal)
            .iter()
            .filter(|e| e.operation == operation)
            .cloned()
            .collect()
    }

    /// Number of calls of one kind, successful or not
    pub fn count(&self, operation: BrokerOperation) -> usize {
        lock(&self.state.journal)
            .iter()
            .filter(|e| e.operation == operation)
            .count()
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Fail every future call of `operation`
    pub fn inject_fault(&self, operation: BrokerOperation, fault: Fault) {
        lock(&self.state.faults).insert(
            operation,
            FaultPlan {
                fault,
                remaining: None,
            },
        );
    }

    /// Fail the next `times` calls of `operation`
    pub fn inject_fault_times(&self, operation: BrokerOperation, fault: Fault, times: usize) {
        if times == 0 {
            return;
        }
        lock(&self.state.faults).insert(
            operation,
            FaultPlan {
                fault,
                remaining: Some(times),
            },
        );
    }

    pub fn clear_faults(&self) {
        lock(&self.state.faults).clear();
    }

    fn take_fault(&self, operation: BrokerOperation) -> Option<Fault> {
        let mut faults = lock(&self.state.faults);
        let plan = faults.get_mut(&operation)?;
        let fault = plan.fault;
        if let Some(remaining) = plan.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(&operation);
            }
        }
        Some(fault)
    }

    /// Record the call and fail it if a fault is armed
    fn begin(
        &self,
        operation: BrokerOperation,
        entity: &str,
        message_id: Option<&MessageId>,
        detail: Option<String>,
    ) -> Result<(), BusError> {
        let fault = self.take_fault(operation);
        lock(&self.state.journal).push(BrokerEvent {
            operation,
            entity: entity.to_string(),
            message_id: message_id.cloned(),
            detail,
            succeeded: fault.is_none(),
        });

        match fault {
            None => Ok(()),
            Some(Fault::Transport) => Err(BusError::transport(
                operation.as_str(),
                "injected failure",
            )),
            Some(Fault::Connection) => Err(BusError::ConnectionFailed {
                message: "injected failure".to_string(),
            }),
            Some(Fault::LockLost) => Err(BusError::MessageLockLost {
                message_id: message_id.map(|id| id.to_string()).unwrap_or_default(),
            }),
        }
    }

    /// Mark the most recent journal entry for `operation` as failed
    fn mark_failed(&self, operation: BrokerOperation) {
        if let Some(event) = lock(&self.state.journal)
            .iter_mut()
            .rev()
            .find(|e| e.operation == operation)
        {
            event.succeeded = false;
        }
    }

    // ------------------------------------------------------------------------
    // Peek-lock operations
    // ------------------------------------------------------------------------

    async fn receive(
        &self,
        path: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.begin(
            BrokerOperation::Receive,
            path,
            None,
            Some(format!("max={}", max_messages)),
        )?;
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        loop {
            let arrivals = self.state.arrivals.notified();
            tokio::pin!(arrivals);
            arrivals.as_mut().enable();

            let next_expiry = {
                let now = Instant::now();
                let mut entities = lock(&self.state.entities);
                entities.reclaim_expired(path, now, self.state.config.max_delivery_count);

                let queue = entities.queue_mut(path);
                let mut received = Vec::new();
                while received.len() < max_messages {
                    let Some(mut message) = queue.available.pop_front() else {
                        break;
                    };
                    message.delivery_count += 1;
                    let lock_token = LockToken::new();
                    received.push(ReceivedMessage {
                        message_id: message.message_id.clone(),
                        lock_token: lock_token.clone(),
                        sequence_number: message.sequence_number,
                        delivery_count: message.delivery_count,
                        application_properties: message.properties.clone(),
                        correlation_id: message.correlation_id.clone(),
                        body: message.body.clone(),
                        enqueued_at: message.enqueued_at.clone(),
                        locked_until: wall_clock_after(self.state.config.lock_duration),
                        dead_letter_reason: message.dead_letter_reason.clone(),
                    });
                    queue.locked.insert(
                        lock_token,
                        LockedMessage {
                            message,
                            locked_until: now + self.state.config.lock_duration,
                        },
                    );
                }

                if !received.is_empty() {
                    return Ok(received);
                }
                entities.next_expiry(path)
            };

            match next_expiry {
                Some(at) => {
                    tokio::select! {
                        _ = &mut arrivals => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => arrivals.await,
            }
        }
    }

    /// Remove the lock held by `message`, failing if it has expired
    fn take_locked(
        &self,
        path: &str,
        message: &ReceivedMessage,
    ) -> Result<StoredMessage, BusError> {
        let mut entities = lock(&self.state.entities);
        entities.reclaim_expired(path, Instant::now(), self.state.config.max_delivery_count);
        entities
            .queues
            .get_mut(path)
            .and_then(|q| q.locked.remove(&message.lock_token))
            .map(|locked| locked.message)
            .ok_or_else(|| BusError::MessageLockLost {
                message_id: message.message_id.to_string(),
            })
    }

    fn renew(&self, path: &str, message: &ReceivedMessage) -> Result<(), BusError> {
        self.begin(BrokerOperation::RenewLock, path, Some(&message.message_id), None)?;
        let now = Instant::now();
        let mut entities = lock(&self.state.entities);
        entities.reclaim_expired(path, now, self.state.config.max_delivery_count);
        let renewed = entities
            .queues
            .get_mut(path)
            .and_then(|q| q.locked.get_mut(&message.lock_token))
            .map(|locked| locked.locked_until = now + self.state.config.lock_duration)
            .is_some();
        drop(entities);

        if renewed {
            Ok(())
        } else {
            self.mark_failed(BrokerOperation::RenewLock);
            Err(BusError::MessageLockLost {
                message_id: message.message_id.to_string(),
            })
        }
    }

    fn settle(
        &self,
        operation: BrokerOperation,
        path: &str,
        message: &ReceivedMessage,
        reason: Option<&str>,
    ) -> Result<(), BusError> {
        self.begin(
            operation,
            path,
            Some(&message.message_id),
            reason.map(str::to_string),
        )?;
        let stored = self
            .take_locked(path, message)
            .inspect_err(|_| self.mark_failed(operation))?;

        let mut entities = lock(&self.state.entities);
        match operation {
            BrokerOperation::Abandon => {
                entities.release(path, stored, self.state.config.max_delivery_count)
            }
            BrokerOperation::DeadLetter => {
                entities.dead_letter(path, stored, reason.unwrap_or_default())
            }
            _ => {}
        }
        drop(entities);
        self.state.arrivals.notify_waiters();
        Ok(())
    }

    fn send(&self, entity: &str, message: OutMessage) -> Result<(), BusError> {
        let message_id = message.message_id.clone().unwrap_or_default();
        self.begin(BrokerOperation::Send, entity, Some(&message_id), None)?;

        let size = message.body_size();
        if size as u64 > self.state.config.max_message_size {
            self.mark_failed(BrokerOperation::Send);
            return Err(BusError::MessageOversized {
                size,
                max_size: self.state.config.max_message_size as usize,
            });
        }
        self.store(entity, &message_id, message);
        Ok(())
    }

    fn send_batch(&self, entity: &str, batch: OutMessageBatch) -> Result<(), BusError> {
        self.begin(
            BrokerOperation::SendBatch,
            entity,
            None,
            Some(format!("count={}", batch.len())),
        )?;
        if batch.size_in_bytes() > self.state.config.max_batch_size_in_bytes {
            self.mark_failed(BrokerOperation::SendBatch);
            return Err(BusError::BatchFull {
                size: batch.size_in_bytes(),
                max_size: self.state.config.max_batch_size_in_bytes,
            });
        }
        for message in batch.into_messages() {
            let message_id = message.message_id.clone().unwrap_or_default();
            self.store(entity, &message_id, message);
        }
        Ok(())
    }

    fn subscription_exists(&self, topic: &str, subscription: &str) -> bool {
        lock(&self.state.entities)
            .topics
            .get(topic)
            .is_some_and(|subs| subs.iter().any(|s| s == subscription))
    }
}

fn wall_clock_after(duration: Duration) -> Timestamp {
    let duration = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
    Timestamp::from_datetime(chrono::Utc::now() + duration)
}

#[async_trait]
impl BusTransport for InMemoryTransport {
    async fn open_receiver(
        &self,
        entity: &ReceiverEntity,
    ) -> Result<Arc<dyn ReceiverLink>, BusError> {
        let path = entity_path(entity);
        self.begin(BrokerOperation::OpenReceiver, &path, None, None)?;

        if let Some(subscription) = &entity.subscription {
            if !self.subscription_exists(entity.topic_or_queue.as_str(), subscription.as_str()) {
                self.mark_failed(BrokerOperation::OpenReceiver);
                return Err(BusError::EntityNotFound {
                    entity: entity.to_string(),
                });
            }
        }
        lock(&self.state.entities).queue_mut(&path);

        Ok(Arc::new(InMemoryReceiverLink {
            broker: self.clone(),
            path,
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_sender(&self, entity: &EntityName) -> Result<Arc<dyn SenderLink>, BusError> {
        self.begin(BrokerOperation::OpenSender, entity.as_str(), None, None)?;
        Ok(Arc::new(InMemorySenderLink {
            broker: self.clone(),
            entity: entity.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl BusAdministration for InMemoryTransport {
    async fn max_message_size(&self, entity: &EntityName) -> Result<u64, BusError> {
        self.begin(BrokerOperation::MaxMessageSize, entity.as_str(), None, None)?;
        Ok(self.state.config.max_message_size)
    }
}

// ============================================================================
// Links
// ============================================================================

struct InMemoryReceiverLink {
    broker: InMemoryTransport,
    path: String,
    closed: AtomicBool,
}

impl InMemoryReceiverLink {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed {
                entity: self.path.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReceiverLink for InMemoryReceiverLink {
    async fn receive_messages(
        &self,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.ensure_open()?;
        self.broker.receive(&self.path, max_messages).await
    }

    async fn renew_message_lock(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.renew(&self.path, message)
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker
            .settle(BrokerOperation::Complete, &self.path, message, None)
    }

    async fn abandon_message(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker
            .settle(BrokerOperation::Abandon, &self.path, message, None)
    }

    async fn dead_letter_message(
        &self,
        message: &ReceivedMessage,
        reason: &str,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker
            .settle(BrokerOperation::DeadLetter, &self.path, message, Some(reason))
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker
                .begin(BrokerOperation::CloseReceiver, &self.path, None, None)?;
        }
        Ok(())
    }
}

struct InMemorySenderLink {
    broker: InMemoryTransport,
    entity: String,
    closed: AtomicBool,
}

impl InMemorySenderLink {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed {
                entity: self.entity.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SenderLink for InMemorySenderLink {
    async fn send_message(&self, message: OutMessage) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.send(&self.entity, message)
    }

    async fn create_message_batch(&self) -> Result<OutMessageBatch, BusError> {
        self.ensure_open()?;
        Ok(OutMessageBatch::new(
            self.broker.state.config.max_batch_size_in_bytes,
        ))
    }

    async fn send_message_batch(&self, batch: OutMessageBatch) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.send_batch(&self.entity, batch)
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker
                .begin(BrokerOperation::CloseSender, &self.entity, None, None)?;
        }
        Ok(())
    }
}
