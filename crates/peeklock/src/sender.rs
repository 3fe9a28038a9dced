//! Sending messages with an up-front size check.

use crate::error::BusError;
use crate::message::{EntityName, MessageId, OutMessage, OutMessageBatch};
use crate::trace::{B3Propagator, TraceContext, TracePropagator};
use crate::transport::{BusAdministration, BusTransport, SenderLink};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument, Span};

/// Sender configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// Identifies the namespace; informational once the transport exists
    pub connection_string: String,
    pub topic_or_queue_name: EntityName,
}

impl SenderConfig {
    pub fn new(connection_string: impl Into<String>, topic_or_queue_name: EntityName) -> Self {
        Self {
            connection_string: connection_string.into(),
            topic_or_queue_name,
        }
    }
}

#[derive(Default)]
enum SenderState {
    #[default]
    NotOpened,
    Open {
        link: Arc<dyn SenderLink>,
        max_message_size: u64,
    },
    Closed,
}

/// Sends to a single queue or topic.
///
/// The entity's maximum message size is read once when the sender opens and
/// every message is checked against it before anything goes over the wire.
pub struct Sender {
    config: SenderConfig,
    transport: Arc<dyn BusTransport>,
    administration: Arc<dyn BusAdministration>,
    propagator: Arc<dyn TracePropagator>,
    state: Mutex<SenderState>,
    span: Span,
}

impl Sender {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        administration: Arc<dyn BusAdministration>,
        config: SenderConfig,
    ) -> Self {
        let span = tracing::info_span!("sender", entity = %config.topic_or_queue_name);
        Self {
            config,
            transport,
            administration,
            propagator: Arc::new(B3Propagator),
            state: Mutex::new(SenderState::default()),
            span,
        }
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn TracePropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    /// Maximum message size cached at open, if open
    pub async fn max_message_size(&self) -> Option<u64> {
        match &*self.state.lock().await {
            SenderState::Open {
                max_message_size, ..
            } => Some(*max_message_size),
            _ => None,
        }
    }

    /// Query the size limit and open the link. Does nothing if already open.
    pub async fn open(&self) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        self.open_locked(&mut state)
            .instrument(self.span.clone())
            .await
            .map(|_| ())
    }

    /// Close the link. Close failures are logged, not returned.
    pub async fn close(&self) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, SenderState::Closed);
        if let SenderState::Open { link, .. } = previous {
            if let Err(e) = link.close().instrument(self.span.clone()).await {
                warn!(parent: &self.span, error = %e, "Failed to close sender link");
            } else {
                info!(parent: &self.span, "Sender closed");
            }
        }
        Ok(())
    }

    /// Send one message, returning the id assigned to it.
    ///
    /// `trace` is the caller's context; the message carries a child of it.
    /// The transmission runs on its own task, so dropping the returned future
    /// does not abandon a send that is already under way.
    pub async fn send(
        &self,
        trace: &TraceContext,
        mut message: OutMessage,
    ) -> Result<MessageId, BusError> {
        let message_id = MessageId::new();
        let span = tracing::info_span!(parent: &self.span, "send", message_id = %message_id);

        async {
            let (link, max_message_size) = self.ensure_open().await?;

            let size = message.body_size();
            debug!(size, max_message_size, "Checking message size");
            if size as u64 > max_message_size {
                debug!(size, max_message_size, "Rejecting oversized message");
                return Err(BusError::MessageOversized {
                    size,
                    max_size: max_message_size as usize,
                });
            }

            message.message_id = Some(message_id.clone());
            self.propagator
                .inject(&trace.child(), &mut message.application_properties);

            let started = Instant::now();
            let transmission = tokio::spawn(
                async move { link.send_message(message).await }.instrument(Span::current()),
            );
            match transmission.await {
                Ok(Ok(())) => {
                    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Sent message");
                    Ok(message_id.clone())
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to send message");
                    Err(e)
                }
                Err(e) => Err(BusError::transport("send", e.to_string())),
            }
        }
        .instrument(span)
        .await
    }

    /// Create an empty batch sized by the broker's batch limit
    pub async fn new_message_batch(&self) -> Result<OutMessageBatch, BusError> {
        let (link, _) = self.ensure_open().instrument(self.span.clone()).await?;
        link.create_message_batch().await
    }

    /// Send a batch built with [`Sender::new_message_batch`].
    ///
    /// Sizes were checked as messages were added, so the batch is sent as is.
    pub async fn send_batch(&self, batch: OutMessageBatch) -> Result<(), BusError> {
        let span = tracing::info_span!(parent: &self.span, "send_batch", count = batch.len());

        async {
            let (link, _) = self.ensure_open().await?;
            let started = Instant::now();
            let transmission = tokio::spawn(
                async move { link.send_message_batch(batch).await }.instrument(Span::current()),
            );
            match transmission.await {
                Ok(Ok(())) => {
                    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Sent batch");
                    Ok(())
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to send batch");
                    Err(e)
                }
                Err(e) => Err(BusError::transport("send_batch", e.to_string())),
            }
        }
        .instrument(span)
        .await
    }

    async fn ensure_open(&self) -> Result<(Arc<dyn SenderLink>, u64), BusError> {
        let mut state = self.state.lock().await;
        self.open_locked(&mut state).await
    }

    async fn open_locked(
        &self,
        state: &mut SenderState,
    ) -> Result<(Arc<dyn SenderLink>, u64), BusError> {
        match state {
            SenderState::Open {
                link,
                max_message_size,
            } => return Ok((link.clone(), *max_message_size)),
            SenderState::Closed => {
                return Err(BusError::Closed {
                    entity: self.config.topic_or_queue_name.to_string(),
                })
            }
            SenderState::NotOpened => {}
        }

        let entity = &self.config.topic_or_queue_name;
        let max_message_size = self
            .administration
            .max_message_size(entity)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to read maximum message size"))?;
        let link = self
            .transport
            .open_sender(entity)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to open sender link"))?;
        debug!(max_message_size, "Opened sender link");

        *state = SenderState::Open {
            link: link.clone(),
            max_message_size,
        };
        Ok((link, max_message_size))
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.config.topic_or_queue_name)
    }
}

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;
