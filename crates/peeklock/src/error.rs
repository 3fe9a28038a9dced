//! Error types for receive, settle and send operations.

use thiserror::Error;

/// Error type shared by all broker-facing operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("Message lock lost for message {message_id}")]
    MessageLockLost { message_id: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Transport error during {operation}: {message}")]
    Transport { operation: String, message: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageOversized { size: usize, max_size: usize },

    #[error("Batch is full: adding {size} bytes would exceed {max_size}")]
    BatchFull { size: usize, max_size: usize },

    #[error("unknown disposition: {disposition}")]
    UnknownDisposition { disposition: String },

    #[error("Handler failure: {message}")]
    HandlerFailed { message: String },

    #[error("'{entity}' is closed")]
    Closed { entity: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl BusError {
    /// Build a transport error for the named operation
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if error is transient and the operation may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        match self {
            Self::EntityNotFound { .. } => false,
            Self::MessageLockLost { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::Transport { .. } => true,
            Self::MessageOversized { .. } => false,
            Self::BatchFull { .. } => false,
            Self::UnknownDisposition { .. } => false,
            Self::HandlerFailed { .. } => false,
            Self::Closed { .. } => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Check if the error reports that the peek lock on a message has expired
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, Self::MessageLockLost { .. })
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
