use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelSpec;
use crate::error::{RelayError, Result};
use crate::rate_limit::RateLimitSettings;

/// Root configuration for the relay service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Server and transport settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthSettings,

    /// Rate-limit settings.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Channel and subscription settings.
    #[serde(default)]
    pub channels: ChannelSettings,

    /// Offline queue settings.
    #[serde(default)]
    pub queue: QueueSettings,

    /// Monitoring settings.
    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);
        toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Server and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP port to accept on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable CORS on the HTTP surface.
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// CORS origin allow-list; `"*"` allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Per-connection outbound queue capacity in frames.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Budget for handling one inbound frame, in milliseconds.
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,

    /// Per-write timeout on the transport, in milliseconds.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Cadence of the inactivity sweep, in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Last-activity age past which a connection is swept, in milliseconds.
    #[serde(default = "default_inactivity_threshold_ms")]
    pub inactivity_threshold_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            outbound_capacity: default_outbound_capacity(),
            frame_timeout_ms: default_frame_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            inactivity_threshold_ms: default_inactivity_threshold_ms(),
        }
    }
}

impl ServerConfig {
    /// Frame handling budget as a `Duration`.
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Per-write timeout as a `Duration`.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Inactivity sweep cadence as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Inactivity threshold as a `Duration`.
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.inactivity_threshold_ms)
    }
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_frame_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_inactivity_threshold_ms() -> u64 {
    300_000
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// If true, unauthenticated connections may subscribe only to channels
    /// with `requires_auth = false` and are disconnected once the grace
    /// window expires without authentication.
    #[serde(default)]
    pub required: bool,

    /// Grace window for completing authentication, in milliseconds.
    #[serde(default = "default_auth_timeout_ms")]
    pub timeout_ms: u64,

    /// Budget for one token verification, in milliseconds.
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,

    /// Secret for the bundled JWT verifier. Substituted from the
    /// environment in deployments.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            required: false,
            timeout_ms: default_auth_timeout_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
            jwt_secret: None,
        }
    }
}

impl AuthSettings {
    /// Authentication grace window as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Verification budget as a `Duration`.
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

fn default_auth_timeout_ms() -> u64 {
    30_000
}

fn default_verify_timeout_ms() -> u64 {
    3_000
}

/// Channel and subscription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Per-connection cap across all channels.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,

    /// Default per-channel subscriber cap.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,

    /// Default history ring-buffer size per channel.
    #[serde(default = "default_history_size")]
    pub message_history_size: usize,

    /// Replay recent history to new subscribers. Replayed frames precede
    /// live frames for that subscription.
    #[serde(default)]
    pub replay_on_subscribe: bool,

    /// Number of history messages replayed when enabled.
    #[serde(default = "default_replay_count")]
    pub replay_count: usize,

    /// Channels defined at startup, already in the open state. Re-defining
    /// a name with an identical spec is a no-op; a differing spec is a
    /// conflict error.
    #[serde(default, rename = "static")]
    pub static_channels: Vec<ChannelSpec>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            max_subscriptions: default_max_subscriptions(),
            max_subscribers: default_max_subscribers(),
            message_history_size: default_history_size(),
            replay_on_subscribe: false,
            replay_count: default_replay_count(),
            static_channels: Vec::new(),
        }
    }
}

fn default_max_subscriptions() -> usize {
    50
}

fn default_max_subscribers() -> usize {
    1_000
}

fn default_history_size() -> usize {
    100
}

fn default_replay_count() -> usize {
    50
}

/// Offline queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Enable store-and-forward for offline users.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-user queue cap.
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    /// Default message TTL in the queue, in seconds.
    #[serde(default = "default_queue_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Messages processed per user per pass.
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,

    /// Processor cadence, in milliseconds.
    #[serde(default = "default_queue_interval_ms")]
    pub interval_ms: u64,

    /// Delivery attempts before a message is dropped.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,

    /// Minimum delay between attempts for one message, in milliseconds.
    #[serde(default = "default_queue_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Cleanup cadence, in milliseconds.
    #[serde(default = "default_queue_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: default_queue_max_size(),
            ttl_seconds: default_queue_ttl_seconds(),
            batch_size: default_queue_batch_size(),
            interval_ms: default_queue_interval_ms(),
            max_retries: default_queue_max_retries(),
            retry_delay_ms: default_queue_retry_delay_ms(),
            cleanup_interval_ms: default_queue_cleanup_interval_ms(),
        }
    }
}

impl QueueSettings {
    /// Processor cadence as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Cleanup cadence as a `Duration`.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Retry delay as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_queue_max_size() -> usize {
    1_000
}

fn default_queue_ttl_seconds() -> u64 {
    86_400
}

fn default_queue_batch_size() -> usize {
    100
}

fn default_queue_interval_ms() -> u64 {
    5_000
}

fn default_queue_max_retries() -> u32 {
    3
}

fn default_queue_retry_delay_ms() -> u64 {
    1_000
}

fn default_queue_cleanup_interval_ms() -> u64 {
    300_000
}

/// Monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    /// Cadence of metrics snapshot emission, in milliseconds.
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            metrics_interval_ms: default_metrics_interval_ms(),
        }
    }
}

impl MonitoringSettings {
    /// Metrics cadence as a `Duration`.
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

fn default_metrics_interval_ms() -> u64 {
    30_000
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.channels.max_subscriptions, 50);
        assert_eq!(config.queue.max_size, 1_000);
        assert!(config.queue.enabled);
        assert!(!config.auth.required);
        assert!(!config.channels.replay_on_subscribe);
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = RelayConfig::parse_toml("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.rate_limit.max_messages, 100);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            port = 3000
            cors_origins = ["https://app.example.com"]

            [auth]
            required = true
            timeout_ms = 10000

            [rate_limit]
            window_ms = 60000
            max_messages = 5
            [rate_limit.roles]
            institutional = 50
            admin = 100

            [channels]
            max_subscriptions = 25
            replay_on_subscribe = true

            [[channels.static]]
            id = "market-data"
            kind = "market-data"

            [[channels.static]]
            id = "portfolio"
            kind = "portfolio-updates"
            requires_auth = true
            max_subscribers = 500

            [queue]
            max_size = 200
            ttl_seconds = 3600

            [monitoring]
            metrics_interval_ms = 15000
        "#;

        let config = RelayConfig::parse_toml(toml).unwrap();
        assert_eq!(config.server.port, 3000);
        assert!(config.auth.required);
        assert_eq!(config.rate_limit.max_messages, 5);
        assert_eq!(config.rate_limit.limit_for(Role::Institutional), 50);
        assert_eq!(config.channels.max_subscriptions, 25);
        assert!(config.channels.replay_on_subscribe);
        assert_eq!(config.channels.static_channels.len(), 2);
        assert!(config.channels.static_channels[1].requires_auth);
        assert_eq!(config.queue.max_size, 200);
        assert_eq!(config.monitoring.metrics_interval_ms, 15_000);
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("RELAY_TEST_SECRET", "hunter2");

        let toml = r#"
            [auth]
            jwt_secret = "${RELAY_TEST_SECRET}"
        "#;

        let config = RelayConfig::parse_toml(toml).unwrap();
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("hunter2"));

        std::env::remove_var("RELAY_TEST_SECRET");
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        assert!(RelayConfig::parse_toml("[server]\nport = \"not a port\"").is_err());
    }
}
