//! Peek-lock lease renewal.

use crate::message::ReceivedMessage;
use crate::transport::ReceiverLink;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Lock duration granted by the broker on receipt
pub const PEEK_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default renewal interval, and the default processing deadline when renewal
/// is disabled. Kept below [`PEEK_LOCK_TIMEOUT`] so a renewal lands before the
/// lock runs out.
pub const DEFAULT_RENEWAL_TIME: Duration = Duration::from_secs(50);

/// Keep the lock on `message` alive until `cancel` fires.
///
/// The first renewal happens one full `interval` after start. Renewal
/// failures are logged and the loop keeps going; a lost lock is only
/// discovered when the message is settled. Returns the number of renewals
/// attempted.
pub async fn renew_message_lock(
    link: Arc<dyn ReceiverLink>,
    cancel: CancellationToken,
    index: usize,
    message: ReceivedMessage,
    interval: Duration,
) -> u64 {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut count: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(index, count, "Stop renewal loop");
                return count;
            }
            _ = ticker.tick() => {
                count += 1;
                match link.renew_message_lock(&message).await {
                    Ok(()) => debug!(index, count, "Renewed message lock"),
                    Err(e) if e.is_lock_lost() => {
                        info!(index, count, error = %e, "Message lock already lost");
                    }
                    Err(e) => warn!(index, count, error = %e, "Failed to renew message lock"),
                }
            }
        }
    }
}

/// Run [`renew_message_lock`] on its own task inside the current span
pub fn spawn_lock_renewal(
    link: Arc<dyn ReceiverLink>,
    cancel: CancellationToken,
    index: usize,
    message: ReceivedMessage,
    interval: Duration,
) -> JoinHandle<u64> {
    let span = tracing::debug_span!("renewal", message_id = %message.message_id);
    tokio::spawn(renew_message_lock(link, cancel, index, message, interval).instrument(span))
}

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;
