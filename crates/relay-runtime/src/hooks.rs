use std::sync::Arc;

use relay_core::channel::ChannelId;
use relay_core::message::Message;
use relay_core::session::{ConnectionId, DisconnectReason};

type ConnectFn = dyn Fn(ConnectionId) + Send + Sync;
type DisconnectFn = dyn Fn(ConnectionId, DisconnectReason) + Send + Sync;
type SubscribeFn = dyn Fn(ConnectionId, &ChannelId) + Send + Sync;
type PublishFn = dyn Fn(&Message, usize) + Send + Sync;

/// Fixed observer hook table passed to the supervisor at construction.
///
/// Components call into the table at well-defined points; no component holds
/// a reference back to its caller and there is no string-keyed event bus.
#[derive(Clone, Default)]
pub struct RelayHooks {
    on_connect: Option<Arc<ConnectFn>>,
    on_disconnect: Option<Arc<DisconnectFn>>,
    on_subscribe: Option<Arc<SubscribeFn>>,
    on_publish: Option<Arc<PublishFn>>,
}

impl RelayHooks {
    /// Empty hook table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe connection registration.
    pub fn on_connect(mut self, f: impl Fn(ConnectionId) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Observe connection teardown.
    pub fn on_disconnect(
        mut self,
        f: impl Fn(ConnectionId, DisconnectReason) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Observe successful subscriptions.
    pub fn on_subscribe(
        mut self,
        f: impl Fn(ConnectionId, &ChannelId) + Send + Sync + 'static,
    ) -> Self {
        self.on_subscribe = Some(Arc::new(f));
        self
    }

    /// Observe publishes with their delivered count.
    pub fn on_publish(mut self, f: impl Fn(&Message, usize) + Send + Sync + 'static) -> Self {
        self.on_publish = Some(Arc::new(f));
        self
    }

    pub(crate) fn connect(&self, conn: ConnectionId) {
        if let Some(f) = &self.on_connect {
            f(conn);
        }
    }

    pub(crate) fn disconnect(&self, conn: ConnectionId, reason: DisconnectReason) {
        if let Some(f) = &self.on_disconnect {
            f(conn, reason);
        }
    }

    pub(crate) fn subscribe(&self, conn: ConnectionId, channel: &ChannelId) {
        if let Some(f) = &self.on_subscribe {
            f(conn, channel);
        }
    }

    pub(crate) fn publish(&self, message: &Message, delivered: usize) {
        if let Some(f) = &self.on_publish {
            f(message, delivered);
        }
    }
}

impl std::fmt::Debug for RelayHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_subscribe", &self.on_subscribe.is_some())
            .field("on_publish", &self.on_publish.is_some())
            .finish()
    }
}
