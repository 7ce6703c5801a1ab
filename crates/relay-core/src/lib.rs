pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod filter;
pub mod message;
pub mod protocol;
pub mod rate_limit;
pub mod session;

pub use auth::{Claims, ClaimsBuilder, TokenVerifier};
pub use channel::{ChannelId, ChannelKind, ChannelSpec, ChannelState};
pub use config::{
    AuthSettings, ChannelSettings, MonitoringSettings, QueueSettings, RelayConfig, ServerConfig,
};
pub use error::{RelayError, Result};
pub use filter::SubscriptionFilter;
pub use message::{Message, MessageDraft, MessageId, MessageMetadata, Priority};
pub use protocol::{ClientFrame, ErrorCode, ServerFrame};
pub use rate_limit::{RateDecision, RateLimitSettings, RateWindow};
pub use session::{
    ConnectionId, DisconnectReason, Role, SessionState, UserId, VerifiedIdentity,
};
