//! Worker settings loaded from files and environment variables.
//!
//! Sources, later ones overriding earlier ones:
//!  1. An optional settings file (YAML, TOML or JSON, chosen by extension)
//!  2. Environment variables prefixed `PEEKLOCK__`, with `__` between
//!     nested keys, e.g. `PEEKLOCK__RECEIVER__RENEW_MESSAGE_LOCK=true`
//!
//! Every field has a default, so an empty environment yields settings that
//! only lack an entity name.

use crate::error::ConfigurationError;
use crate::message::EntityName;
use crate::receiver::ReceiverConfig;
use crate::sender::SenderConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of the environment variables read by [`WorkerSettings::load`]
pub const ENV_PREFIX: &str = "PEEKLOCK";

/// Dispatch topology selected in settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Parallel,
    Serial,
    Batch,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Serial => "serial",
            Self::Batch => "batch",
        }
    }
}

/// Top-level settings for a worker process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub receiver: ReceiverSettings,

    /// Present when the worker also publishes messages
    pub sender: Option<SenderSettings>,

    pub logging: LoggingSettings,
}

/// Receiver section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    pub connection_string: String,

    pub topic_or_queue_name: String,

    /// Empty for queue mode
    pub subscription_name: String,

    /// Read the dead-letter sub-queue
    pub dead_letter: bool,

    pub renew_message_lock: bool,

    /// Interval between lock renewals, in seconds
    pub renew_message_time_seconds: u64,

    /// Processing bound when renewal is disabled, in seconds
    pub deadline_seconds: u64,

    pub mode: DispatchMode,

    /// Worker count in parallel mode
    pub handlers: usize,

    /// Messages fetched per cycle in serial and batch mode
    pub incoming_messages: usize,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            connection_string: "memory://".to_string(),
            topic_or_queue_name: String::new(),
            subscription_name: String::new(),
            dead_letter: false,
            renew_message_lock: false,
            renew_message_time_seconds: 50,
            deadline_seconds: 50,
            mode: DispatchMode::Parallel,
            handlers: 1,
            incoming_messages: 1,
        }
    }
}

/// Sender section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderSettings {
    pub connection_string: String,
    pub topic_or_queue_name: String,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            connection_string: "memory://".to_string(),
            topic_or_queue_name: String::new(),
        }
    }
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive, e.g. `info` or `peeklock=debug`
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

fn entity_name(field: &str, value: &str) -> Result<EntityName, ConfigurationError> {
    if value.is_empty() {
        return Err(ConfigurationError::Missing {
            key: field.to_string(),
        });
    }
    EntityName::new(value.to_string()).map_err(|e| ConfigurationError::Invalid {
        message: format!("{}: {}", field, e),
    })
}

impl WorkerSettings {
    /// Load from an optional file and `PEEKLOCK__` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Load using a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<WorkerSettings>())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        Ok(settings)
    }

    /// Check every section, including the derived receiver configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.receiver.validate()?;
        if let Some(sender) = &self.sender {
            sender.to_sender_config()?;
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "logging.level".to_string(),
            });
        }
        Ok(())
    }
}

impl ReceiverSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self.mode {
            DispatchMode::Parallel if self.handlers == 0 => {
                return Err(ConfigurationError::Invalid {
                    message: "parallel mode needs at least one handler".to_string(),
                });
            }
            DispatchMode::Serial | DispatchMode::Batch if self.incoming_messages == 0 => {
                return Err(ConfigurationError::Invalid {
                    message: "incoming_messages must be greater than zero".to_string(),
                });
            }
            _ => {}
        }
        self.to_receiver_config()?.validate()
    }

    /// Build the receiver configuration these settings describe
    pub fn to_receiver_config(&self) -> Result<ReceiverConfig, ConfigurationError> {
        let name = entity_name("receiver.topic_or_queue_name", &self.topic_or_queue_name)?;
        let mut config = if self.subscription_name.is_empty() {
            ReceiverConfig::queue(self.connection_string.clone(), name)
        } else {
            let subscription =
                entity_name("receiver.subscription_name", &self.subscription_name)?;
            ReceiverConfig::subscription(self.connection_string.clone(), name, subscription)
        };

        if self.dead_letter {
            config = config.with_dead_letter();
        }
        config = config.with_deadline(Duration::from_secs(self.deadline_seconds));
        if self.renew_message_lock {
            config =
                config.with_lock_renewal(Duration::from_secs(self.renew_message_time_seconds));
        }
        Ok(config)
    }
}

impl SenderSettings {
    pub fn to_sender_config(&self) -> Result<SenderConfig, ConfigurationError> {
        let name = entity_name("sender.topic_or_queue_name", &self.topic_or_queue_name)?;
        Ok(SenderConfig::new(self.connection_string.clone(), name))
    }
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
