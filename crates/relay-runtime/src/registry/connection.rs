use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use relay_core::channel::ChannelId;
use relay_core::rate_limit::{RateDecision, RateWindow};
use relay_core::session::{
    ConnectionId, DisconnectReason, Role, SessionState, UserId, VerifiedIdentity,
};

use super::outbound::OutboundQueue;

/// A live client session, owned exclusively by the [`ConnectionRegistry`].
///
/// The registry's maps are the only place connections are stored; everything
/// mutable on the connection itself sits behind small locks that are never
/// held across an await.
///
/// [`ConnectionRegistry`]: super::ConnectionRegistry
pub struct Connection {
    id: ConnectionId,
    outbound: Arc<OutboundQueue>,
    connected_at: DateTime<Utc>,
    identity: Mutex<Option<VerifiedIdentity>>,
    state: Mutex<SessionState>,
    last_activity: Mutex<DateTime<Utc>>,
    rate: Mutex<RateWindow>,
    channels: Mutex<HashSet<ChannelId>>,
    disconnect: Mutex<Option<DisconnectReason>>,
}

impl Connection {
    pub(crate) fn new(
        outbound: Arc<OutboundQueue>,
        initial_state: SessionState,
        initial_limit: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectionId::new(),
            outbound,
            connected_at: now,
            identity: Mutex::new(None),
            state: Mutex::new(initial_state),
            last_activity: Mutex::new(now),
            rate: Mutex::new(RateWindow::new(initial_limit)),
            channels: Mutex::new(HashSet::new()),
            disconnect: Mutex::new(None),
        }
    }

    /// Stable connection ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection's outbound queue.
    pub fn outbound(&self) -> &Arc<OutboundQueue> {
        &self.outbound
    }

    /// When the transport was accepted.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Last inbound frame or successful send.
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    /// Whether the connection has been idle past the threshold.
    pub fn idle_for(&self, threshold: Duration) -> bool {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
        self.last_activity() < cutoff
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Whether a user has been attached.
    pub fn is_authenticated(&self) -> bool {
        self.identity.lock().is_some()
    }

    /// Attached user, if authenticated.
    pub fn user_id(&self) -> Option<UserId> {
        self.identity.lock().as_ref().map(|i| i.user_id.clone())
    }

    /// Role tier; `Anonymous` until a user is attached.
    pub fn role(&self) -> Role {
        self.identity
            .lock()
            .as_ref()
            .map(|i| i.role)
            .unwrap_or(Role::Anonymous)
    }

    /// Whether the attached identity grants a permission.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.identity
            .lock()
            .as_ref()
            .is_some_and(|i| i.has_permission(permission))
    }

    pub(crate) fn attach(&self, identity: VerifiedIdentity) {
        *self.identity.lock() = Some(identity);
        self.set_state(SessionState::Authenticated);
        self.touch();
    }

    /// Count an inbound message against the rate window. `next_limit` takes
    /// effect at the next window reset.
    pub fn check_rate(&self, window: Duration, next_limit: u32) -> RateDecision {
        self.rate.lock().check(window, next_limit)
    }

    /// Start of the current rate window, for invariant checks.
    pub fn rate_window_start(&self) -> DateTime<Utc> {
        self.rate.lock().window_start()
    }

    /// Channels this connection subscribes to.
    pub fn channel_set(&self) -> HashSet<ChannelId> {
        self.channels.lock().clone()
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Whether this connection subscribes to a channel.
    pub fn subscribes(&self, channel: &ChannelId) -> bool {
        self.channels.lock().contains(channel)
    }

    pub(crate) fn add_channel(&self, channel: ChannelId) {
        let mut channels = self.channels.lock();
        channels.insert(channel);
        if self.is_authenticated() || self.state() == SessionState::Accepted {
            self.set_state(SessionState::Subscribed);
        }
    }

    pub(crate) fn remove_channel(&self, channel: &ChannelId) {
        let mut channels = self.channels.lock();
        channels.remove(channel);
        if channels.is_empty() && self.state() == SessionState::Subscribed {
            self.set_state(SessionState::Idle);
        }
    }

    pub(crate) fn clear_channels(&self) {
        self.channels.lock().clear();
    }

    /// Flag the connection for teardown and close its outbound path. The
    /// reader/writer tasks observe the closed queue and run the unregister
    /// path; flagging is idempotent and the first reason wins.
    pub fn flag_disconnect(&self, reason: DisconnectReason) {
        {
            let mut flag = self.disconnect.lock();
            if flag.is_some() {
                return;
            }
            *flag = Some(reason);
        }
        self.set_state(SessionState::Disconnecting);
        self.outbound.close();
    }

    /// The teardown reason, once flagged.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.disconnect.lock()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("user_id", &self.user_id())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
