//! relay - a real-time WebSocket fan-out service.
//!
//! Long-lived client connections are organized into named topic channels
//! and receive ordered JSON message streams: at-most-once to online
//! subscribers, store-and-forward for recently-offline users.

pub use relay_core::{
    ChannelId, ChannelKind, ChannelSpec, ClientFrame, ErrorCode, Message, MessageDraft, Priority,
    RelayConfig, RelayError, Result, Role, ServerFrame, SubscriptionFilter, TokenVerifier, UserId,
};
pub use relay_runtime::{
    Dispatcher, GatewayServer, JwtVerifier, RelayHooks, StaticTokenVerifier, Supervisor,
};

/// Prelude module for common imports.
pub mod prelude {
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;

    /// Timestamp type alias for convenience.
    pub type Timestamp = DateTime<Utc>;

    pub use relay_core::{
        ChannelId, ChannelSpec, Message, MessageDraft, Priority, RelayConfig, RelayError, Result,
        Role, SubscriptionFilter, UserId,
    };
    pub use relay_runtime::{RelayHooks, Supervisor};
}
