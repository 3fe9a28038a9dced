//! Running several receivers side by side.

use crate::error::BusError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A long-running consumer managed by [`Listeners`]
#[async_trait]
pub trait Listener: Send + Sync {
    /// Name used in logs
    fn name(&self) -> String;

    /// Run until shut down; an error is fatal
    async fn listen(&self) -> Result<(), BusError>;

    /// Stop listening and release resources; must be idempotent
    async fn shutdown(&self) -> Result<(), BusError>;
}

/// Supervises a group of listeners.
///
/// All listeners run concurrently. The first one to fail causes every
/// listener to be shut down, and its error is what [`Listeners::listen`]
/// returns once all of them have stopped.
#[derive(Default, Clone)]
pub struct Listeners {
    listeners: Vec<Arc<dyn Listener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn with(mut self, listener: Arc<dyn Listener>) -> Self {
        self.add(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Run every listener until all have stopped
    pub async fn listen(&self) -> Result<(), BusError> {
        let mut running = JoinSet::new();
        for listener in &self.listeners {
            let listener = listener.clone();
            running.spawn(async move {
                let name = listener.name();
                debug!(listener = %name, "Starting listener");
                (name, listener.listen().await)
            });
        }

        let mut first_error = None;
        while let Some(joined) = running.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    info!(listener = %name, "Listener stopped");
                    None
                }
                Ok((name, Err(e))) => {
                    error!(listener = %name, error = %e, "Listener failed");
                    Some(e)
                }
                Err(e) => {
                    error!(error = %e, "Listener task panicked");
                    Some(BusError::HandlerFailed {
                        message: format!("listener task panicked: {}", e),
                    })
                }
            };

            if let Some(e) = failure {
                if first_error.is_none() {
                    self.shutdown().await;
                    first_error = Some(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Shut down every listener, logging failures
    pub async fn shutdown(&self) {
        for listener in &self.listeners {
            if let Err(e) = listener.shutdown().await {
                warn!(listener = %listener.name(), error = %e, "Failed to shut down listener");
            }
        }
    }
}

#[cfg(test)]
#[path = "startup_tests.rs"]
mod tests;
