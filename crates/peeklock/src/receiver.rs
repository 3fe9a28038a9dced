//! Peek-lock receiver: owns one receiver link and runs a dispatch loop over it.

use crate::dispatcher::{Dispatcher, LeaseStrategy};
use crate::error::{BusError, ConfigurationError};
use crate::handler::HandlerSet;
use crate::lease::{DEFAULT_RENEWAL_TIME, PEEK_LOCK_TIMEOUT};
use crate::message::EntityName;
use crate::startup::Listener;
use crate::trace::{B3Propagator, TracePropagator};
use crate::transport::{BusTransport, ReceiverEntity, ReceiverLink};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

// ============================================================================
// Configuration
// ============================================================================

/// Immutable receiver configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Identifies the namespace; informational once the transport exists
    pub connection_string: String,
    pub topic_or_queue_name: EntityName,
    /// Absent in queue mode
    pub subscription_name: Option<EntityName>,
    /// Read the dead-letter sub-queue instead of the entity itself
    pub dead_letter: bool,
    pub renew_message_lock: bool,
    /// Interval between renewals when renewal is enabled
    pub renew_message_time: Duration,
    /// Processing bound when renewal is disabled
    pub deadline: Duration,
}

impl ReceiverConfig {
    /// Receive from a queue
    pub fn queue(connection_string: impl Into<String>, queue: EntityName) -> Self {
        Self {
            connection_string: connection_string.into(),
            topic_or_queue_name: queue,
            subscription_name: None,
            dead_letter: false,
            renew_message_lock: false,
            renew_message_time: DEFAULT_RENEWAL_TIME,
            deadline: DEFAULT_RENEWAL_TIME,
        }
    }

    /// Receive from a topic subscription
    pub fn subscription(
        connection_string: impl Into<String>,
        topic: EntityName,
        subscription: EntityName,
    ) -> Self {
        Self {
            subscription_name: Some(subscription),
            ..Self::queue(connection_string, topic)
        }
    }

    /// Read the dead-letter sub-queue
    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter = true;
        self
    }

    /// Renew message locks at `interval` while they are processed
    pub fn with_lock_renewal(mut self, interval: Duration) -> Self {
        self.renew_message_lock = true;
        self.renew_message_time = interval;
        self
    }

    /// Bound processing time when renewal is disabled
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Address of the entity this configuration reads from
    pub fn entity(&self) -> ReceiverEntity {
        let entity = match &self.subscription_name {
            Some(subscription) => {
                ReceiverEntity::subscription(self.topic_or_queue_name.clone(), subscription.clone())
            }
            None => ReceiverEntity::queue(self.topic_or_queue_name.clone()),
        };
        if self.dead_letter {
            entity.dead_letter()
        } else {
            entity
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.renew_message_lock {
            if self.renew_message_time.is_zero() {
                return Err(ConfigurationError::Invalid {
                    message: "renew_message_time must be greater than zero".to_string(),
                });
            }
            if self.renew_message_time >= PEEK_LOCK_TIMEOUT {
                return Err(ConfigurationError::Invalid {
                    message: format!(
                        "renew_message_time must be less than the {}s lock duration",
                        PEEK_LOCK_TIMEOUT.as_secs()
                    ),
                });
            }
        } else if self.deadline.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "deadline must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn lease_strategy(&self) -> LeaseStrategy {
        if self.renew_message_lock {
            LeaseStrategy::Renew {
                interval: self.renew_message_time,
            }
        } else {
            LeaseStrategy::Deadline {
                max_duration: self.deadline,
            }
        }
    }
}

// ============================================================================
// Link ownership
// ============================================================================

/// Open/close bookkeeping for a receiver link
#[derive(Default)]
pub(crate) struct LinkSlot {
    link: Option<Arc<dyn ReceiverLink>>,
    closed: bool,
}

impl LinkSlot {
    /// Return the open link, opening it on first use
    pub(crate) async fn open(
        &mut self,
        transport: &dyn BusTransport,
        entity: &ReceiverEntity,
    ) -> Result<(Arc<dyn ReceiverLink>, bool), BusError> {
        if self.closed {
            return Err(BusError::Closed {
                entity: entity.to_string(),
            });
        }
        if let Some(link) = &self.link {
            return Ok((link.clone(), false));
        }

        let link = transport.open_receiver(entity).await?;
        self.link = Some(link.clone());
        Ok((link, true))
    }

    /// Close the slot for good. Returns true only when this call closed a
    /// link that had been opened, which is when the handlers need closing.
    pub(crate) async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        let Some(link) = self.link.take() else {
            return false;
        };
        if let Err(e) = link.close().await {
            warn!(error = %e, "Failed to close receiver link");
        }
        true
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Receives messages under peek lock and dispatches them to a [`HandlerSet`].
///
/// `listen` runs until `shutdown` is called or a fatal error occurs. A
/// receiver cannot be restarted once shut down.
pub struct Receiver {
    config: ReceiverConfig,
    transport: Arc<dyn BusTransport>,
    propagator: Arc<dyn TracePropagator>,
    handlers: HandlerSet,
    name: String,
    slot: Mutex<LinkSlot>,
    running: Mutex<()>,
    cancel: CancellationToken,
    span: Span,
}

impl Receiver {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        config: ReceiverConfig,
        handlers: HandlerSet,
    ) -> Result<Self, BusError> {
        config.validate()?;
        handlers.validate()?;

        let name = config.entity().to_string();
        let span = tracing::info_span!("receiver", receiver = %name, mode = handlers.mode());
        Ok(Self {
            config,
            transport,
            propagator: Arc::new(B3Propagator),
            handlers,
            name,
            slot: Mutex::new(LinkSlot::default()),
            running: Mutex::new(()),
            cancel: CancellationToken::new(),
            span,
        })
    }

    /// Use a different trace propagator
    pub fn with_propagator(mut self, propagator: Arc<dyn TracePropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Receive and dispatch until shut down.
    ///
    /// Returns `Ok(())` after `shutdown`, or the first fatal error: a failed
    /// open or fetch, or a handler returning an unknown disposition.
    pub async fn listen(&self) -> Result<(), BusError> {
        let _running = self.running.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        async {
            let link = self.open().await?;
            info!(
                renew_message_lock = self.config.renew_message_lock,
                "Listening for messages"
            );
            let dispatcher = Dispatcher::new(
                link,
                self.propagator.clone(),
                self.config.lease_strategy(),
                self.cancel.clone(),
            );
            let result = match &self.handlers {
                HandlerSet::Parallel(handlers) => dispatcher.run_parallel(handlers).await,
                HandlerSet::Serial {
                    handler,
                    batch_size,
                } => dispatcher.run_serial(handler.as_ref(), *batch_size).await,
                HandlerSet::Batch {
                    handler,
                    batch_size,
                } => dispatcher.run_batch(handler.as_ref(), *batch_size).await,
            };
            match &result {
                Ok(()) => info!("Stopped listening"),
                Err(e) => error!(error = %e, "Receiver stopped on fatal error"),
            }
            result
        }
        .instrument(self.span.clone())
        .await
    }

    /// Stop receiving, wait for in-flight messages to be disposed, then close
    /// the link and the handlers. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        async {
            debug!("Shutting down");
            self.cancel.cancel();
            let _running = self.running.lock().await;

            let mut slot = self.slot.lock().await;
            if slot.close().await {
                self.handlers.close().await;
                info!("Receiver closed");
            }
        }
        .instrument(self.span.clone())
        .await;
        Ok(())
    }

    async fn open(&self) -> Result<Arc<dyn ReceiverLink>, BusError> {
        let mut slot = self.slot.lock().await;
        let (link, opened) = slot
            .open(self.transport.as_ref(), &self.config.entity())
            .await
            .inspect_err(|e| error!(error = %e, "Failed to open receiver link"))?;
        if opened {
            debug!("Opened receiver link");
            if let Err(e) = self.handlers.open().await {
                error!(error = %e, "Failed to open handlers");
                slot.close().await;
                self.handlers.close().await;
                return Err(e);
            }
        }
        Ok(link)
    }
}

impl fmt::Display for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[async_trait]
impl Listener for Receiver {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn listen(&self) -> Result<(), BusError> {
        Receiver::listen(self).await
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        Receiver::shutdown(self).await
    }
}

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;
