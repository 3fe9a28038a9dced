//! Message dispositions and the resolver that applies them.
//!
//! A handler decides what happens to every message it was given by returning
//! a [`Disposition`]. [`dispose`] maps that decision onto a [`Disposer`].
//! Any decision other than [`Disposition::Unknown`] is considered delivered
//! even if the broker call behind it fails; the disposer logs such failures
//! and carries on.

use crate::error::BusError;
use crate::handler::HandlerError;
use crate::message::ReceivedMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// What to do with a message once its handler has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Disposition {
    /// Not a valid outcome; reported as an error
    #[default]
    Unknown,
    /// Release the lease so the message is redelivered immediately
    Abandon,
    /// Acknowledge and remove the message
    Complete,
    /// Move the message to the dead-letter sub-queue
    Deadletter,
    /// Do nothing and let the lease expire; the broker redelivers later
    Reschedule,
}

impl Disposition {
    /// All dispositions, in declaration order
    pub const ALL: [Disposition; 5] = [
        Disposition::Unknown,
        Disposition::Abandon,
        Disposition::Complete,
        Disposition::Deadletter,
        Disposition::Reschedule,
    ];

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Abandon => "Abandon",
            Self::Complete => "Complete",
            Self::Deadletter => "Deadletter",
            Self::Reschedule => "Reschedule",
        }
    }

    /// Parse a canonical name; anything unrecognised is `Unknown`
    pub fn from_name(name: &str) -> Self {
        match name {
            "Abandon" => Self::Abandon,
            "Complete" => Self::Complete,
            "Deadletter" => Self::Deadletter,
            "Reschedule" => Self::Reschedule,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

/// Applies a decided disposition to a leased message.
///
/// Implementations must not fail because the broker call failed; they log
/// and return `Ok(())`. Errors are reserved for callers misusing the disposer.
#[async_trait]
pub trait Disposer: Send + Sync {
    async fn abandon(
        &self,
        error: Option<&HandlerError>,
        message: &ReceivedMessage,
    ) -> Result<(), BusError>;

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BusError>;

    /// `error` supplies the dead-letter reason
    async fn dead_letter(
        &self,
        error: Option<&HandlerError>,
        message: &ReceivedMessage,
    ) -> Result<(), BusError>;

    async fn reschedule(
        &self,
        error: Option<&HandlerError>,
        message: &ReceivedMessage,
    ) -> Result<(), BusError>;
}

/// Apply `disposition` to `message`.
///
/// `Unknown` performs no queue operation and returns
/// [`BusError::UnknownDisposition`]; callers treat that as fatal.
pub async fn dispose<D>(
    disposer: &D,
    disposition: Disposition,
    error: Option<&HandlerError>,
    message: &ReceivedMessage,
) -> Result<(), BusError>
where
    D: Disposer + ?Sized,
{
    match disposition {
        Disposition::Abandon => disposer.abandon(error, message).await,
        Disposition::Complete => disposer.complete(message).await,
        Disposition::Deadletter => disposer.dead_letter(error, message).await,
        Disposition::Reschedule => disposer.reschedule(error, message).await,
        Disposition::Unknown => Err(BusError::UnknownDisposition {
            disposition: disposition.to_string(),
        }),
    }
}

/// Text recorded as the dead-letter reason for a handler error
pub fn dead_letter_reason(error: Option<&HandlerError>) -> String {
    match error {
        Some(error) => format!("{:#}", error),
        None => "dead-lettered by handler".to_string(),
    }
}

#[cfg(test)]
#[path = "disposition_tests.rs"]
mod tests;
