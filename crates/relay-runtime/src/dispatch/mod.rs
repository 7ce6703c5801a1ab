use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;

use relay_core::channel::ChannelId;
use relay_core::error::{RelayError, Result};
use relay_core::message::{Message, MessageDraft};
use relay_core::session::{ConnectionId, UserId};

use crate::channels::{ChannelIndex, Subscription};
use crate::hooks::RelayHooks;
use crate::metrics::{incr, Metrics};
use crate::queue::OfflineQueue;
use crate::registry::{ConnectionRegistry, OutboundFrame};

/// Fan-out engine.
///
/// Resolves a publish to its target connections, serializes the message
/// exactly once into a shared buffer, and enqueues that buffer to each
/// target's outbound path. Per-recipient failures are counted, never raised.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    channels: Arc<ChannelIndex>,
    queue: Arc<OfflineQueue>,
    hooks: RelayHooks,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    /// Create a dispatcher over the given components.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        channels: Arc<ChannelIndex>,
        queue: Arc<OfflineQueue>,
        hooks: RelayHooks,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            channels,
            queue,
            hooks,
            metrics,
        }
    }

    /// Publish a message to every subscriber of a channel. Returns the
    /// number of connections the frame was enqueued to.
    pub fn publish(&self, channel: &ChannelId, draft: MessageDraft) -> Result<usize> {
        self.publish_inner(channel, draft, None)
    }

    /// Publish with an additional caller-supplied predicate, applied on top
    /// of each subscription's stored filter.
    pub fn publish_where<F>(
        &self,
        channel: &ChannelId,
        draft: MessageDraft,
        predicate: F,
    ) -> Result<usize>
    where
        F: Fn(&Message) -> bool,
    {
        self.publish_inner(channel, draft, Some(&predicate))
    }

    fn publish_inner(
        &self,
        channel: &ChannelId,
        draft: MessageDraft,
        predicate: Option<&dyn Fn(&Message) -> bool>,
    ) -> Result<usize> {
        let entry = self
            .channels
            .entry(channel)
            .ok_or_else(|| RelayError::ChannelNotFound(channel.to_string()))?;

        let message = draft.into_message(channel.clone());

        // Serialization, fan-out, and the history append all happen under
        // the channel's publish lock, which is what ties per-recipient
        // delivery order to publish order.
        let delivered = entry.with_publish_lock(|subscribers, history| {
            let buffer = match self.serialize(&message) {
                Ok(buffer) => buffer,
                Err(e) => {
                    incr(&self.metrics.errors);
                    tracing::error!(channel = %channel, error = %e, "serialize failed");
                    return Err(e);
                }
            };

            let mut delivered = 0;
            for subscription in subscribers {
                if !self.passes(subscription, &message, predicate) {
                    continue;
                }
                let frame = OutboundFrame::new(buffer.clone(), message.priority());
                if self.registry.send(subscription.conn_id, frame) {
                    delivered += 1;
                }
            }

            history.record(message.clone());
            Ok(delivered)
        })?;

        incr(&self.metrics.messages_published);
        self.hooks.publish(&message, delivered);
        tracing::trace!(channel = %channel, id = %message.id, delivered, "published");
        Ok(delivered)
    }

    /// Send a message directly to every live connection of a user. When no
    /// connection admits the frame, the message goes to the offline queue.
    pub fn send_to_user(
        &self,
        user_id: &UserId,
        channel: &ChannelId,
        draft: MessageDraft,
    ) -> Result<usize> {
        let message = draft.into_message(channel.clone());
        let buffer = self.serialize(&message)?;
        let frame = OutboundFrame::new(buffer, message.priority());

        let delivered = self.registry.send_to_user(user_id, frame);
        if delivered == 0 {
            self.queue
                .enqueue(user_id.clone(), channel.clone(), message);
        }
        Ok(delivered)
    }

    /// Send a message to one connection.
    pub fn send_to_connection(
        &self,
        conn_id: ConnectionId,
        channel: &ChannelId,
        draft: MessageDraft,
    ) -> Result<bool> {
        let message = draft.into_message(channel.clone());
        let buffer = self.serialize(&message)?;
        let frame = OutboundFrame::new(buffer, message.priority());
        Ok(self.registry.send(conn_id, frame))
    }

    /// Deliver an already-published message to a user's live subscriptions
    /// of its channel, honoring stored filters. Used by the offline queue
    /// processor; never re-enqueues.
    pub fn deliver_to_user(&self, user_id: &UserId, message: &Message) -> Result<usize> {
        let subscriptions = self.channels.subscribers(&message.channel);
        let connections = self.registry.connections_of_user(user_id);
        if connections.is_empty() {
            return Ok(0);
        }

        let buffer = self.serialize(message)?;
        let mut delivered = 0;
        for conn in &connections {
            let Some(subscription) = subscriptions.iter().find(|s| s.conn_id == conn.id()) else {
                continue;
            };
            if !self.passes(subscription, message, None) {
                continue;
            }
            let frame = OutboundFrame::new(buffer.clone(), message.priority());
            if self.registry.send_to_connection(conn, frame) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Whether a user currently subscribes to a channel on any live
    /// connection.
    pub fn user_subscribes(&self, user_id: &UserId, channel: &ChannelId) -> bool {
        self.registry
            .connections_of_user(user_id)
            .iter()
            .any(|conn| conn.subscribes(channel))
    }

    /// Serialize a message into the shared wire buffer. One pass per
    /// publish; every recipient path holds a reference to this buffer.
    fn serialize(&self, message: &Message) -> Result<Bytes> {
        let bytes = serde_json::to_vec(message)?;
        incr(&self.metrics.serializations);
        Ok(Bytes::from(bytes))
    }

    /// Evaluate the stored filter and the caller predicate. A predicate
    /// that panics counts as non-matching.
    fn passes(
        &self,
        subscription: &Subscription,
        message: &Message,
        predicate: Option<&dyn Fn(&Message) -> bool>,
    ) -> bool {
        if let Some(filter) = &subscription.filter {
            if !filter.matches(message) {
                return false;
            }
        }
        if let Some(pred) = predicate {
            return catch_unwind(AssertUnwindSafe(|| pred(message))).unwrap_or_else(|_| {
                incr(&self.metrics.errors);
                tracing::warn!(
                    conn = %subscription.conn_id,
                    channel = %message.channel,
                    "publish predicate panicked, treating as non-matching"
                );
                false
            });
        }
        true
    }
}
