//! Receiver that hands whole batches to a handler which settles them itself.

use crate::deadline::Deadline;
use crate::dispatcher::{report_timing, Dispatcher, LeaseStrategy};
use crate::error::{BusError, ConfigurationError};
use crate::handler::{handler_failed, DelegatingBatchHandler};
use crate::lease::DEFAULT_RENEWAL_TIME;
use crate::message::EntityName;
use crate::receiver::LinkSlot;
use crate::settle::MessageSettler;
use crate::startup::Listener;
use crate::trace::{B3Propagator, TracePropagator};
use crate::transport::{BusTransport, ReceiverEntity, ReceiverLink};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument, Span};

/// Configuration for a [`BatchReceiver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReceiverConfig {
    pub connection_string: String,
    pub topic_or_queue_name: EntityName,
    /// Absent in queue mode
    pub subscription_name: Option<EntityName>,
    /// Most messages handed to the handler at once
    pub batch_size: usize,
    /// Time the handler has to settle a batch
    pub batch_deadline: Duration,
}

impl BatchReceiverConfig {
    pub fn queue(
        connection_string: impl Into<String>,
        queue: EntityName,
        batch_size: usize,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            topic_or_queue_name: queue,
            subscription_name: None,
            batch_size,
            batch_deadline: DEFAULT_RENEWAL_TIME,
        }
    }

    pub fn subscription(
        connection_string: impl Into<String>,
        topic: EntityName,
        subscription: EntityName,
        batch_size: usize,
    ) -> Self {
        Self {
            subscription_name: Some(subscription),
            ..Self::queue(connection_string, topic, batch_size)
        }
    }

    pub fn with_batch_deadline(mut self, deadline: Duration) -> Self {
        self.batch_deadline = deadline;
        self
    }

    pub fn entity(&self) -> ReceiverEntity {
        match &self.subscription_name {
            Some(subscription) => {
                ReceiverEntity::subscription(self.topic_or_queue_name.clone(), subscription.clone())
            }
            None => ReceiverEntity::queue(self.topic_or_queue_name.clone()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.batch_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "batch_size must be greater than zero".to_string(),
            });
        }
        if self.batch_deadline.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "batch_deadline must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Receives batches and delegates settlement to a [`DelegatingBatchHandler`].
///
/// There is no lock renewal: each batch is bounded by `batch_deadline`. A
/// handler error stops the receiver.
pub struct BatchReceiver {
    config: BatchReceiverConfig,
    transport: Arc<dyn BusTransport>,
    propagator: Arc<dyn TracePropagator>,
    handler: Arc<dyn DelegatingBatchHandler>,
    name: String,
    slot: Mutex<LinkSlot>,
    running: Mutex<()>,
    cancel: CancellationToken,
    span: Span,
}

impl BatchReceiver {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        config: BatchReceiverConfig,
        handler: Arc<dyn DelegatingBatchHandler>,
    ) -> Result<Self, BusError> {
        config.validate()?;

        let name = config.entity().to_string();
        let span = tracing::info_span!("batch_receiver", receiver = %name);
        Ok(Self {
            config,
            transport,
            propagator: Arc::new(B3Propagator),
            handler,
            name,
            slot: Mutex::new(LinkSlot::default()),
            running: Mutex::new(()),
            cancel: CancellationToken::new(),
            span,
        })
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn TracePropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    /// Receive and delegate batches until shut down or the handler fails
    pub async fn listen(&self) -> Result<(), BusError> {
        let _running = self.running.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        async {
            let link = self.open().await?;
            let settler = MessageSettler::new(link.clone());
            let dispatcher = Dispatcher::new(
                link,
                self.propagator.clone(),
                LeaseStrategy::Deadline {
                    max_duration: self.config.batch_deadline,
                },
                self.cancel.clone(),
            );
            info!(batch_size = self.config.batch_size, "Listening for batches");

            loop {
                let Some(messages) = dispatcher.fetch(self.config.batch_size).await? else {
                    info!("Stopped listening");
                    return Ok(());
                };
                if messages.is_empty() {
                    continue;
                }

                let deadline =
                    Deadline::start(&self.cancel, self.config.batch_deadline, &messages[0]);
                let context = dispatcher.message_context(deadline.token().clone(), &messages[0]);
                let span = context.span().clone();
                debug!(count = messages.len(), "Delegating batch");

                let result = self
                    .handler
                    .handle(context, &settler, &messages)
                    .instrument(span)
                    .await;
                report_timing(
                    messages.len(),
                    deadline.elapsed(),
                    Some(&deadline),
                    result.as_ref().err(),
                );
                deadline.cancel();

                if let Err(e) = result {
                    error!(error = %format!("{:#}", e), "Terminating due to batch handler error");
                    return Err(handler_failed(e));
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Stop receiving, wait for the current batch, then close the link and
    /// the handler
    pub async fn shutdown(&self) -> Result<(), BusError> {
        async {
            self.cancel.cancel();
            let _running = self.running.lock().await;

            let mut slot = self.slot.lock().await;
            if slot.close().await {
                self.handler.close().await;
                info!("Batch receiver closed");
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
            if let Err(e) = self.handler.open().await {
                error!(error = %format!("{:#}", e), "Failed to open batch handler");
                slot.close().await;
                self.handler.close().await;
                return Err(handler_failed(e));
            }
        }
        Ok(link)
    }
}

impl fmt::Display for BatchReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[async_trait]
impl Listener for BatchReceiver {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn listen(&self) -> Result<(), BusError> {
        BatchReceiver::listen(self).await
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        BatchReceiver::shutdown(self).await
    }
}

#[cfg(test)]
#[path = "batch_receiver_tests.rs"]
mod tests;
