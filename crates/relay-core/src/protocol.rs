use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::error::RelayError;
use crate::filter::SubscriptionFilter;
use crate::session::UserId;

/// Wire error codes (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationFailed,
    AuthorizationFailed,
    ChannelNotFound,
    ChannelAccessDenied,
    RateLimitExceeded,
    InvalidMessageFormat,
    ConnectionLimitExceeded,
    SubscriptionLimitExceeded,
    InternalError,
}

impl ErrorCode {
    /// Convert to the wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::AuthorizationFailed => "AUTHORIZATION_FAILED",
            Self::ChannelNotFound => "CHANNEL_NOT_FOUND",
            Self::ChannelAccessDenied => "CHANNEL_ACCESS_DENIED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InvalidMessageFormat => "INVALID_MESSAGE_FORMAT",
            Self::ConnectionLimitExceeded => "CONNECTION_LIMIT_EXCEEDED",
            Self::SubscriptionLimitExceeded => "SUBSCRIPTION_LIMIT_EXCEEDED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incoming frame from a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Present a bearer token.
    Authenticate { token: String },
    /// Subscribe to a channel, optionally with a payload filter.
    Subscribe {
        channel: ChannelId,
        #[serde(default)]
        filter: Option<SubscriptionFilter>,
    },
    /// Unsubscribe from a channel.
    Unsubscribe { channel: ChannelId },
    /// Keepalive.
    Ping,
    /// Publish a message to a channel.
    Message {
        channel: ChannelId,
        #[serde(default)]
        data: serde_json::Value,
        /// Message type string; defaults to `"message"`.
        #[serde(default)]
        kind: Option<String>,
    },
}

/// Outgoing control frame to a client.
///
/// Delivered messages are not represented here: the serialized
/// [`Message`](crate::message::Message) itself is the `message` frame, so the
/// fan-out path serializes exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Result of an authenticate frame.
    AuthenticationResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Result of a subscribe frame.
    SubscriptionResult {
        channel: ChannelId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCode>,
    },
    /// Result of an unsubscribe frame.
    UnsubscriptionResult { channel: ChannelId, success: bool },
    /// Keepalive response.
    Pong,
    /// Connection lifecycle notification.
    ConnectionStatus {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Subscription state changed server-side (e.g. channel removed).
    SubscriptionUpdate {
        channel: ChannelId,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Error report.
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
}

impl ServerFrame {
    /// Build an error frame from a core error, attaching a retry-after hint
    /// where one is computable.
    pub fn from_error(err: &RelayError) -> Self {
        let data = err
            .retry_after_ms()
            .map(|ms| serde_json::json!({ "retry_after_ms": ms }));
        Self::Error {
            code: err.code(),
            message: err.to_string(),
            data,
        }
    }
}
