//! Processing deadline used when lock renewal is disabled.
//!
//! The deadline never interrupts a handler. It cancels a child token that the
//! handler may observe, and lets the dispatcher report handlers that ran past
//! the point where their lock could have expired.

use crate::message::ReceivedMessage;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A running processing deadline
#[derive(Debug)]
pub struct Deadline {
    token: CancellationToken,
    max_duration: Duration,
    started: Instant,
    timer: JoinHandle<()>,
}

impl Deadline {
    /// Start a deadline of `max_duration` under `parent`.
    ///
    /// The bound is shortened to whatever is left of the message's lock when
    /// that is less, so the deadline never outlives the lease.
    pub fn start(
        parent: &CancellationToken,
        max_duration: Duration,
        message: &ReceivedMessage,
    ) -> Self {
        let remaining_lock = (message.locked_until.as_datetime() - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let max_duration = max_duration.min(remaining_lock);

        debug!(
            message_id = %message.message_id,
            max_duration_ms = max_duration.as_millis() as u64,
            "Set processing deadline"
        );

        let token = parent.child_token();
        let timer_token = token.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(max_duration) => timer_token.cancel(),
                _ = timer_token.cancelled() => {}
            }
        });

        Self {
            token,
            max_duration,
            started: Instant::now(),
            timer,
        }
    }

    /// Token cancelled once the deadline passes or the parent is cancelled
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Time since the deadline started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Amount by which `elapsed` reaches past the deadline, if it does
    pub fn exceeded_by(&self, elapsed: Duration) -> Option<Duration> {
        (elapsed >= self.max_duration).then(|| elapsed - self.max_duration)
    }

    /// Release the deadline's resources
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
        self.token.cancel();
    }
}

#[cfg(test)]
#[path = "deadline_tests.rs"]
mod tests;
