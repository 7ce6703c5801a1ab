use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::ChannelId;

/// Unique message identifier, assigned by the core on publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
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

/// Delivery priority of a message.
///
/// Ordering matters: higher priorities drain first from offline queues and
/// survive outbound back-pressure longer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Priority {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Normal,
        })
    }
}

/// Message metadata carried alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Producer that originated the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Delivery priority.
    #[serde(default)]
    pub priority: Priority,
    /// Time-to-live in seconds, honored by the offline queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Correlates request/response message pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// A published message. Immutable once the dispatcher has assigned its id
/// and timestamp.
///
/// The serialized form is also the wire frame delivered to subscribers:
/// `{id, type, channel, data, timestamp, metadata}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID.
    pub id: MessageId,
    /// Message type string (`"message"` for plain publishes; producers may
    /// set domain-specific kinds).
    #[serde(rename = "type")]
    pub kind: String,
    /// Channel the message was published to.
    pub channel: ChannelId,
    /// Arbitrary JSON payload.
    #[serde(rename = "data")]
    pub payload: serde_json::Value,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Metadata.
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// Delivery priority shortcut.
    pub fn priority(&self) -> Priority {
        self.metadata.priority
    }
}

/// The producer-supplied part of a message, before the dispatcher assigns
/// id, channel, and timestamp.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    /// Message type string; defaults to `"message"`.
    pub kind: Option<String>,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Metadata.
    pub metadata: MessageMetadata,
}

impl MessageDraft {
    /// Create a draft with the given payload and default metadata.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            kind: None,
            payload,
            metadata: MessageMetadata::default(),
        }
    }

    /// Set the message type string.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Set the source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    /// Set the TTL in seconds.
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.metadata.ttl = Some(ttl_secs);
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    /// Finalize into an immutable message on the given channel.
    pub fn into_message(self, channel: ChannelId) -> Message {
        Message {
            id: MessageId::new(),
            kind: self.kind.unwrap_or_else(|| "message".to_string()),
            channel,
            payload: self.payload,
            timestamp: Utc::now(),
            metadata: self.metadata,
        }
    }
}
