//! Message types for receive and send paths including core domain identifiers.

use crate::error::{BusError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue, topic or subscription name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityName(String);

impl EntityName {
    /// Create new entity name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        // Validate length
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "entity_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // Validate characters (ASCII alphanumeric, hyphens, underscores, periods, slashes)
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
        {
            return Err(ValidationError::InvalidFormat {
                field: "entity_name".to_string(),
                message:
                    "only ASCII alphanumeric, hyphens, underscores, periods and slashes allowed"
                        .to_string(),
            });
        }

        if name.starts_with(['-', '.', '/']) || name.ends_with(['-', '.', '/']) {
            return Err(ValidationError::InvalidFormat {
                field: "entity_name".to_string(),
                message: "must start and end with a letter, digit or underscore".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get entity name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Unique identifier for messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque token identifying one peek lock held on a received message.
///
/// A new token is issued every time the broker hands the message out, so a
/// token from an earlier delivery cannot settle a later one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate new random lock token
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get token as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Received Messages
// ============================================================================

/// A message leased from the broker under a peek lock.
///
/// The consumer holds the lease, not the message: once the message has been
/// settled or its lock has expired the lock token is no longer valid.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub lock_token: LockToken,
    pub sequence_number: i64,
    /// Number of times this message has been handed out, including this one
    pub delivery_count: u32,
    /// Free-form properties; carries correlation and trace metadata
    pub application_properties: HashMap<String, String>,
    pub correlation_id: Option<String>,
    pub body: Bytes,
    pub enqueued_at: Timestamp,
    pub locked_until: Timestamp,
    /// Reason recorded when the message was dead-lettered (dead-letter receivers only)
    pub dead_letter_reason: Option<String>,
}

// ============================================================================
// Outgoing Messages
// ============================================================================

/// A message to be sent to a queue or topic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutMessage {
    /// Assigned by the sender immediately before transmission
    pub message_id: Option<MessageId>,
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    pub application_properties: HashMap<String, String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
}

/// Serialization for Bytes as a UTF-8 lossy string
mod bytes_serde {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        String::from_utf8_lossy(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Ok(Bytes::from(text))
    }
}

impl OutMessage {
    /// Create new message with body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Add application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set an application property in place
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.application_properties.insert(key.into(), value.into());
    }

    /// Size of the body in bytes; this is what the broker limit is checked against
    pub fn body_size(&self) -> usize {
        self.body.len()
    }

    /// Approximate encoded size: body plus property keys and values
    pub fn encoded_size(&self) -> usize {
        let properties: usize = self
            .application_properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        let ids = self.message_id.as_ref().map_or(0, |id| id.as_str().len())
            + self.correlation_id.as_ref().map_or(0, String::len)
            + self.content_type.as_ref().map_or(0, String::len);

        self.body.len() + properties + ids
    }
}

// ============================================================================
// Message Batch Accumulator
// ============================================================================

/// Accumulates outgoing messages for a single broker round trip.
///
/// Size accounting happens here, as messages are appended; the sender does
/// not re-check a batch when it is submitted.
#[derive(Debug, Clone)]
pub struct OutMessageBatch {
    max_size_in_bytes: usize,
    size_in_bytes: usize,
    messages: Vec<OutMessage>,
}

impl OutMessageBatch {
    /// Create an empty batch bounded by the broker's batch size limit
    pub fn new(max_size_in_bytes: usize) -> Self {
        Self {
            max_size_in_bytes,
            size_in_bytes: 0,
            messages: Vec::new(),
        }
    }

    /// Append a message, failing if it would push the batch over its limit.
    ///
    /// A message that can never fit, even in an empty batch, is reported as
    /// oversized rather than as a full batch.
    pub fn add_message(&mut self, message: OutMessage) -> Result<(), BusError> {
        let size = message.encoded_size();
        if size > self.max_size_in_bytes {
            return Err(BusError::MessageOversized {
                size,
                max_size: self.max_size_in_bytes,
            });
        }
        if self.size_in_bytes + size > self.max_size_in_bytes {
            return Err(BusError::BatchFull {
                size,
                max_size: self.max_size_in_bytes,
            });
        }

        self.size_in_bytes += size;
        self.messages.push(message);
        Ok(())
    }

    /// Number of messages in the batch
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the batch holds no messages
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Accumulated size in bytes
    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    /// Maximum size in bytes
    pub fn max_size_in_bytes(&self) -> usize {
        self.max_size_in_bytes
    }

    /// Messages accumulated so far, in append order
    pub fn messages(&self) -> &[OutMessage] {
        &self.messages
    }

    /// Consume the batch, yielding its messages
    pub fn into_messages(self) -> Vec<OutMessage> {
        self.messages
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
