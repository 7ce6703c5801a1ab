use std::time::Duration;

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Core error type for relay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Channel access denied: {0}")]
    ChannelAccessDenied(String),

    #[error("Channel already defined with a different spec: {0}")]
    ChannelConflict(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Connection limit exceeded: {0}")]
    ConnectionLimitExceeded(String),

    #[error("Subscription limit exceeded: {0}")]
    SubscriptionLimitExceeded(String),

    #[error("Rate limit exceeded: retry after {retry_after:?}")]
    RateLimitExceeded {
        retry_after: Duration,
        limit: u32,
        remaining: u32,
    },

    #[error("Invalid message format: {0}")]
    InvalidFrame(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Map this error onto the closed wire error-code set.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            Self::AuthorizationFailed(_) => ErrorCode::AuthorizationFailed,
            Self::ChannelNotFound(_) => ErrorCode::ChannelNotFound,
            Self::ChannelAccessDenied(_) => ErrorCode::ChannelAccessDenied,
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            Self::InvalidFrame(_) | Self::Serialization(_) => ErrorCode::InvalidMessageFormat,
            Self::ConnectionLimitExceeded(_) => ErrorCode::ConnectionLimitExceeded,
            Self::SubscriptionLimitExceeded(_) => ErrorCode::SubscriptionLimitExceeded,
            Self::Config(_)
            | Self::ChannelConflict(_)
            | Self::ConnectionNotFound(_)
            | Self::Io(_)
            | Self::Timeout(_)
            | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Retry-after hint in milliseconds, where computable.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(retry_after.as_millis() as u64),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

/// Result type alias using RelayError.
pub type Result<T> = std::result::Result<T, RelayError>;
