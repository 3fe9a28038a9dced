//! Best-effort settlement of leased messages against a receiver link.

use crate::disposition::{dead_letter_reason, Disposer};
use crate::error::BusError;
use crate::handler::HandlerError;
use crate::message::ReceivedMessage;
use crate::transport::ReceiverLink;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// [`Disposer`] that settles messages on the link they were received from.
///
/// Broker failures are logged and absorbed. A failed complete means the
/// message will be redelivered once its lock expires; handlers must tolerate
/// the duplicate.
#[derive(Clone)]
pub struct MessageSettler {
    link: Arc<dyn ReceiverLink>,
}

impl MessageSettler {
    pub fn new(link: Arc<dyn ReceiverLink>) -> Self {
        Self { link }
    }

    fn report_failure(operation: &str, message: &ReceivedMessage, error: &BusError) {
        if error.is_lock_lost() {
            warn!(
                message_id = %message.message_id,
                operation,
                "Message lock expired before settlement; the broker will redeliver"
            );
        } else {
            warn!(
                message_id = %message.message_id,
                operation,
                error = %error,
                "Failed to settle message"
            );
        }
    }
}

#[async_trait]
impl Disposer for MessageSettler {
    async fn abandon(
        &self,
        error: Option<&HandlerError>,
        message: &ReceivedMessage,
    ) -> Result<(), BusError> {
        let span = tracing::info_span!("message.abandon", message_id = %message.message_id);
        async {
            if let Some(error) = error {
                info!(error = %format!("{:#}", error), "Abandoning message after handler error");
            }
            match self.link.abandon_message(message).await {
                Ok(()) => debug!("Message abandoned"),
                Err(e) => Self::report_failure("abandon", message, &e),
            }
        }
        .instrument(span)
        .await;
        Ok(())
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        let span = tracing::info_span!("message.complete", message_id = %message.message_id);
        async {
            match self.link.complete_message(message).await {
                Ok(()) => debug!("Message completed"),
                Err(e) => Self::report_failure("complete", message, &e),
            }
        }
        .instrument(span)
        .await;
        Ok(())
    }

    async fn dead_letter(
        &self,
        error: Option<&HandlerError>,
        message: &ReceivedMessage,
    ) -> Result<(), BusError> {
        let span = tracing::info_span!("message.deadletter", message_id = %message.message_id);
        async {
            let reason = dead_letter_reason(error);
            info!(reason = %reason, "Dead-lettering message");
            match self.link.dead_letter_message(message, &reason).await {
                Ok(()) => debug!("Message dead-lettered"),
                Err(e) => Self::report_failure("deadletter", message, &e),
            }
        }
        .instrument(span)
        .await;
        Ok(())
    }

    async fn reschedule(
        &self,
        error: Option<&HandlerError>,
        message: &ReceivedMessage,
    ) -> Result<(), BusError> {
        // Nothing to send: the lock is left to expire.
        debug!(
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            error = ?error.map(|e| format!("{:#}", e)),
            "Rescheduling message; it will be redelivered when its lock expires"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "settle_tests.rs"]
mod tests;
