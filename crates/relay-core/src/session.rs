use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique connection identifier.
///
/// A 128-bit random value rendered as 32 hex characters. Uniqueness is by
/// generation, not lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new random connection ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identity of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a new user ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role tier of a connection, used to select rate limits and gate channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Not authenticated.
    Anonymous,
    /// Standard authenticated user.
    User,
    /// Institutional tier with elevated limits.
    Institutional,
    /// Administrative role with the highest limits.
    Admin,
}

impl Role {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::User => "user",
            Self::Institutional => "institutional",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "admin" => Self::Admin,
            "institutional" => Self::Institutional,
            "user" => Self::User,
            _ => Self::Anonymous,
        })
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity returned by the external token verifier.
///
/// The core consumes only this record; it never sees token secrets and does
/// not persist tokens.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    /// Authenticated user.
    pub user_id: UserId,
    /// Role tier.
    pub role: Role,
    /// Granted permission strings.
    pub permissions: Vec<String>,
    /// When the backing credential expires.
    pub expires_at: DateTime<Utc>,
}

impl VerifiedIdentity {
    /// Check whether a permission has been granted.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, no authentication yet.
    Accepted,
    /// Authentication required and pending.
    Authenticating,
    /// Authenticated, no subscriptions.
    Authenticated,
    /// At least one active subscription.
    Subscribed,
    /// Previously subscribed, currently no subscriptions.
    Idle,
    /// Shutting down.
    Disconnecting,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Subscribed => "subscribed",
            Self::Idle => "idle",
            Self::Disconnecting => "disconnecting",
            Self::Closed => "closed",
        }
    }

    /// Whether frames may still be processed in this state.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Disconnecting | Self::Closed)
    }
}

/// Why a connection was unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client closed the transport.
    ClientClosed,
    /// Transport write failed.
    TransportError,
    /// No activity past the inactivity threshold.
    Inactive,
    /// Authentication was required and not completed in time.
    AuthTimeout,
    /// Outbound queue could not admit a critical frame.
    SlowConsumer,
    /// Server is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::Inactive => "inactive",
            Self::AuthTimeout => "auth_timeout",
            Self::SlowConsumer => "slow_consumer",
            Self::Shutdown => "shutdown",
        }
    }
}
