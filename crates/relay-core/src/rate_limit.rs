use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelSpec;
use crate::error::RelayError;
use crate::session::Role;

/// Rate-limit configuration: fixed-window message limits keyed by role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Messages per window for unauthenticated and standard connections.
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,

    /// Global admission cap on concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-role overrides of `max_messages`.
    #[serde(default)]
    pub roles: BTreeMap<Role, u32>,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_messages() -> u32 {
    100
}

fn default_max_connections() -> usize {
    10_000
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        // No role overrides ship by default; unconfigured roles fall back
        // to `max_messages`.
        Self {
            window_ms: default_window_ms(),
            max_messages: default_max_messages(),
            max_connections: default_max_connections(),
            roles: BTreeMap::new(),
        }
    }
}

impl RateLimitSettings {
    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Messages-per-window limit for a role.
    pub fn limit_for(&self, role: Role) -> u32 {
        self.roles.get(&role).copied().unwrap_or(self.max_messages)
    }

    /// Limit for a role when publishing on a specific channel, honoring the
    /// channel's per-role policy table.
    pub fn limit_on_channel(&self, role: Role, spec: &ChannelSpec) -> u32 {
        spec.role_limits
            .get(&role)
            .copied()
            .unwrap_or_else(|| self.limit_for(role))
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// Accepted; `remaining` messages left in the current window.
    Allowed { remaining: u32 },
    /// Rejected; retry once the window turns over.
    Denied { retry_after: Duration, limit: u32 },
}

impl RateDecision {
    /// Whether the message was accepted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Convert a denial into the matching error.
    pub fn to_error(&self) -> Option<RelayError> {
        match self {
            Self::Allowed { .. } => None,
            Self::Denied { retry_after, limit } => Some(RelayError::RateLimitExceeded {
                retry_after: *retry_after,
                limit: *limit,
                remaining: 0,
            }),
        }
    }
}

/// Per-connection fixed rate window with lazy reset.
///
/// The window start only ever advances; a role change supplies its new limit
/// through `check`, which is picked up at the next reset rather than
/// retroactively.
#[derive(Debug, Clone)]
pub struct RateWindow {
    count: u32,
    window_start: DateTime<Utc>,
    limit: u32,
}

impl RateWindow {
    /// Open a fresh window with the given limit.
    pub fn new(limit: u32) -> Self {
        Self {
            count: 0,
            window_start: Utc::now(),
            limit,
        }
    }

    /// Current limit in force.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Window start, monotonically non-decreasing.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// Count a message against the window.
    pub fn check(&mut self, window: Duration, next_limit: u32) -> RateDecision {
        self.check_at(Utc::now(), window, next_limit)
    }

    /// Count a message against the window at an explicit instant.
    pub fn check_at(
        &mut self,
        now: DateTime<Utc>,
        window: Duration,
        next_limit: u32,
    ) -> RateDecision {
        let window_chrono = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        if now - self.window_start >= window_chrono && now > self.window_start {
            self.window_start = now;
            self.count = 0;
            self.limit = next_limit;
        }

        if self.count >= self.limit {
            let reset_at = self.window_start + window_chrono;
            let retry_after = (reset_at - now).to_std().unwrap_or(Duration::ZERO);
            RateDecision::Denied {
                retry_after,
                limit: self.limit,
            }
        } else {
            self.count += 1;
            RateDecision::Allowed {
                remaining: self.limit - self.count,
            }
        }
    }
}
