//! Handler traits implemented by applications and the handler set a receiver
//! dispatches to.

use crate::disposition::{Disposer, Disposition};
use crate::error::{BusError, ConfigurationError};
use crate::message::ReceivedMessage;
use crate::trace::TraceContext;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Error type returned by handlers.
///
/// When a handler loses a message's lock it should return (or wrap) a
/// [`BusError::MessageLockLost`] so the receiver can report it.
pub type HandlerError = anyhow::Error;

/// Per-message scope handed to a handler
#[derive(Debug, Clone)]
pub struct MessageContext {
    cancellation: CancellationToken,
    trace: TraceContext,
    span: Span,
}

impl MessageContext {
    pub fn new(cancellation: CancellationToken, trace: TraceContext, span: Span) -> Self {
        Self {
            cancellation,
            trace,
            span,
        }
    }

    /// Cancelled on shutdown, when the processing deadline passes, or once
    /// the message has been settled
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Trace context of this processing span; pass it to a sender to
    /// continue the trace
    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// Span the handler runs in
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Replace the trace context, for handlers that start their own span
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = trace;
        self
    }
}

/// Outcome of handling one message
#[derive(Debug)]
pub struct HandlerOutcome {
    pub disposition: Disposition,
    /// Scope to settle the message in; usually the one the handler was given
    pub context: MessageContext,
    pub error: Option<HandlerError>,
}

impl HandlerOutcome {
    pub fn new(
        disposition: Disposition,
        context: MessageContext,
        error: Option<HandlerError>,
    ) -> Self {
        Self {
            disposition,
            context,
            error,
        }
    }

    pub fn complete(context: MessageContext) -> Self {
        Self::new(Disposition::Complete, context, None)
    }

    pub fn abandon(context: MessageContext, error: HandlerError) -> Self {
        Self::new(Disposition::Abandon, context, Some(error))
    }

    pub fn dead_letter(context: MessageContext, error: HandlerError) -> Self {
        Self::new(Disposition::Deadletter, context, Some(error))
    }

    pub fn reschedule(context: MessageContext, error: HandlerError) -> Self {
        Self::new(Disposition::Reschedule, context, Some(error))
    }
}

/// Outcome of handling a batch; `dispositions[i]` applies to message `i`
#[derive(Debug)]
pub struct BatchOutcome {
    pub dispositions: Vec<Disposition>,
    pub context: MessageContext,
    pub error: Option<HandlerError>,
}

impl BatchOutcome {
    pub fn new(
        dispositions: Vec<Disposition>,
        context: MessageContext,
        error: Option<HandlerError>,
    ) -> Self {
        Self {
            dispositions,
            context,
            error,
        }
    }
}

/// Processes one message at a time.
///
/// `open` is called once before the first receive and `close` once on
/// shutdown. Handlers in a parallel set run concurrently with each other but
/// each instance only ever sees one message at a time.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn open(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn handle(&self, context: MessageContext, message: &ReceivedMessage) -> HandlerOutcome;

    /// Must tolerate being called more than once
    async fn close(&self) {}
}

/// Processes a fetched batch and decides a disposition per message
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn open(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn handle(&self, context: MessageContext, messages: &[ReceivedMessage])
        -> BatchOutcome;

    async fn close(&self) {}
}

/// Processes a batch and settles each message itself through `disposer`.
///
/// Returning an error stops the receiver.
#[async_trait]
pub trait DelegatingBatchHandler: Send + Sync {
    async fn open(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn handle(
        &self,
        context: MessageContext,
        disposer: &dyn Disposer,
        messages: &[ReceivedMessage],
    ) -> Result<(), HandlerError>;

    async fn close(&self) {}
}

/// Handlers a receiver dispatches to; the variant selects the topology
#[derive(Clone)]
pub enum HandlerSet {
    /// One worker per handler, each holding at most one message
    Parallel(Vec<Arc<dyn Handler>>),
    /// One handler, messages fetched `batch_size` at a time and handled in order
    Serial {
        handler: Arc<dyn Handler>,
        batch_size: usize,
    },
    /// One handler receiving up to `batch_size` messages per call
    Batch {
        handler: Arc<dyn BatchHandler>,
        batch_size: usize,
    },
}

impl HandlerSet {
    pub fn parallel(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self::Parallel(handlers)
    }

    pub fn serial(handler: Arc<dyn Handler>, batch_size: usize) -> Self {
        Self::Serial {
            handler,
            batch_size,
        }
    }

    pub fn batch(handler: Arc<dyn BatchHandler>, batch_size: usize) -> Self {
        Self::Batch {
            handler,
            batch_size,
        }
    }

    /// Topology name used in logs
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Parallel(_) => "parallel",
            Self::Serial { .. } => "serial",
            Self::Batch { .. } => "batch",
        }
    }

    /// Most messages a single fetch may request
    pub fn fetch_size(&self) -> usize {
        match self {
            Self::Parallel(handlers) => handlers.len(),
            Self::Serial { batch_size, .. } | Self::Batch { batch_size, .. } => *batch_size,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::Parallel(handlers) if handlers.is_empty() => Err(ConfigurationError::Invalid {
                message: "parallel handler set needs at least one handler".to_string(),
            }),
            Self::Serial { batch_size: 0, .. } | Self::Batch { batch_size: 0, .. } => {
                Err(ConfigurationError::Invalid {
                    message: format!("{} batch size must be greater than zero", self.mode()),
                })
            }
            _ => Ok(()),
        }
    }

    /// Open every handler, stopping at the first failure
    pub(crate) async fn open(&self) -> Result<(), BusError> {
        match self {
            Self::Parallel(handlers) => {
                for handler in handlers {
                    handler.open().await.map_err(handler_failed)?;
                }
                Ok(())
            }
            Self::Serial { handler, .. } => handler.open().await.map_err(handler_failed),
            Self::Batch { handler, .. } => handler.open().await.map_err(handler_failed),
        }
    }

    pub(crate) async fn close(&self) {
        match self {
            Self::Parallel(handlers) => {
                for handler in handlers {
                    handler.close().await;
                }
            }
            Self::Serial { handler, .. } => handler.close().await,
            Self::Batch { handler, .. } => handler.close().await,
        }
    }
}

pub(crate) fn handler_failed(error: HandlerError) -> BusError {
    BusError::HandlerFailed {
        message: format!("{:#}", error),
    }
}

/// Whether `error` reports a lost message lock anywhere in its chain
pub fn is_lock_lost(error: &HandlerError) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<BusError>().is_some_and(BusError::is_lock_lost))
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
