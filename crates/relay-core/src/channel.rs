use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::session::Role;

/// Name of a topic channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create a new channel ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    MarketData,
    UserNotifications,
    PortfolioUpdates,
    Alerts,
    System,
    #[default]
    Custom,
}

impl ChannelKind {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketData => "market-data",
            Self::UserNotifications => "user-notifications",
            Self::PortfolioUpdates => "portfolio-updates",
            Self::Alerts => "alerts",
            Self::System => "system",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for ChannelKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "market-data" => Self::MarketData,
            "user-notifications" => Self::UserNotifications,
            "portfolio-updates" => Self::PortfolioUpdates,
            "alerts" => Self::Alerts,
            "system" => Self::System,
            _ => Self::Custom,
        })
    }
}

/// Lifecycle state of a channel.
///
/// defined -> open (accepting subscriptions) -> closed (rejecting new
/// subscriptions, existing preserved) -> removed (subscriptions
/// force-unsubscribed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Defined,
    Open,
    Closed,
    Removed,
}

impl ChannelState {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Defined => "defined",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Removed => "removed",
        }
    }

    /// Whether new subscriptions are accepted in this state.
    pub fn accepts_subscriptions(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Static definition of a channel.
///
/// Startup channels come from `[[channels.static]]` in the configuration;
/// dynamic channels may be defined at runtime with the same shape. `None`
/// caps fall back to the `[channels]` defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel name.
    pub id: ChannelId,

    /// Channel category.
    #[serde(default)]
    pub kind: ChannelKind,

    /// Whether the channel is discoverable by unauthenticated clients.
    #[serde(default = "default_public")]
    pub public: bool,

    /// Whether subscribing requires an authenticated connection.
    #[serde(default)]
    pub requires_auth: bool,

    /// Subscriber cap; `None` uses the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_subscribers: Option<usize>,

    /// History ring-buffer size; `None` uses the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_size: Option<usize>,

    /// Per-role publish rate overrides (messages per window) for this
    /// channel. Roles not listed use the global role limits.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub role_limits: BTreeMap<Role, u32>,
}

fn default_public() -> bool {
    true
}

impl ChannelSpec {
    /// Create a spec with defaults for everything but the name.
    pub fn new(id: impl Into<ChannelId>) -> Self {
        Self {
            id: id.into(),
            kind: ChannelKind::default(),
            public: true,
            requires_auth: false,
            max_subscribers: None,
            history_size: None,
            role_limits: BTreeMap::new(),
        }
    }

    /// Set the kind.
    pub fn with_kind(mut self, kind: ChannelKind) -> Self {
        self.kind = kind;
        self
    }

    /// Require authentication to subscribe.
    pub fn with_requires_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    /// Cap the subscriber count.
    pub fn with_max_subscribers(mut self, cap: usize) -> Self {
        self.max_subscribers = Some(cap);
        self
    }

    /// Set the history ring-buffer size.
    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = Some(size);
        self
    }

    /// Override the publish rate for a role on this channel.
    pub fn with_role_limit(mut self, role: Role, limit: u32) -> Self {
        self.role_limits.insert(role, limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_round_trip() {
        assert_eq!(
            "market-data".parse::<ChannelKind>(),
            Ok(ChannelKind::MarketData)
        );
        assert_eq!(ChannelKind::PortfolioUpdates.as_str(), "portfolio-updates");
        assert_eq!("bespoke".parse::<ChannelKind>(), Ok(ChannelKind::Custom));
    }

    #[test]
    fn test_channel_state_machine() {
        assert!(ChannelState::Open.accepts_subscriptions());
        assert!(!ChannelState::Defined.accepts_subscriptions());
        assert!(!ChannelState::Closed.accepts_subscriptions());
        assert!(!ChannelState::Removed.accepts_subscriptions());
    }

    #[test]
    fn test_spec_builder() {
        let spec = ChannelSpec::new("portfolio")
            .with_kind(ChannelKind::PortfolioUpdates)
            .with_requires_auth(true)
            .with_max_subscribers(500)
            .with_role_limit(Role::Institutional, 1000);

        assert_eq!(spec.id.as_str(), "portfolio");
        assert!(spec.requires_auth);
        assert_eq!(spec.max_subscribers, Some(500));
        assert_eq!(spec.role_limits.get(&Role::Institutional), Some(&1000));
    }

    #[test]
    fn test_spec_deserialization_defaults() {
        let toml = r#"
            id = "market-data"
            kind = "market-data"
        "#;
        let spec: ChannelSpec = toml::from_str(toml).unwrap();
        assert!(spec.public);
        assert!(!spec.requires_auth);
        assert!(spec.max_subscribers.is_none());
        assert!(spec.role_limits.is_empty());
    }
}
