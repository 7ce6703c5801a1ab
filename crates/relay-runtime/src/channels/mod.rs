mod history;

pub use history::History;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use relay_core::channel::{ChannelId, ChannelSpec, ChannelState};
use relay_core::config::ChannelSettings;
use relay_core::error::{RelayError, Result};
use relay_core::filter::SubscriptionFilter;
use relay_core::message::Message;
use relay_core::session::ConnectionId;

use crate::registry::Connection;

/// The (connection, channel, filter) relation.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscribing connection.
    pub conn_id: ConnectionId,
    /// Optional payload filter.
    pub filter: Option<SubscriptionFilter>,
    /// When the subscription was created.
    pub subscribed_at: DateTime<Utc>,
}

/// One channel: spec, lifecycle state, subscriber map, publish ordering
/// lock, and history ring.
pub(crate) struct ChannelEntry {
    pub(crate) spec: ChannelSpec,
    state: RwLock<ChannelState>,
    subscribers: RwLock<HashMap<ConnectionId, Subscription>>,
    // Exclusive across publishes on this channel: serialization, fan-out,
    // and the history append happen under it, which is what makes
    // per-channel delivery order equal publish order.
    publish_lock: Mutex<()>,
    history: Mutex<History>,
}

impl ChannelEntry {
    fn new(spec: ChannelSpec, default_history: usize) -> Self {
        let history_size = spec.history_size.unwrap_or(default_history);
        Self {
            spec,
            state: RwLock::new(ChannelState::Open),
            subscribers: RwLock::new(HashMap::new()),
            publish_lock: Mutex::new(()),
            history: Mutex::new(History::new(history_size)),
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.read()
    }

    /// Run `f` with the subscriber list and history ring under the
    /// channel's publish lock.
    ///
    /// `f` must not block or take channel locks; the dispatcher's enqueues
    /// and the history append are the only work done here.
    pub(crate) fn with_publish_lock<R>(
        &self,
        f: impl FnOnce(&[Subscription], &mut History) -> R,
    ) -> R {
        let _ordering = self.publish_lock.lock();
        let subscribers: Vec<Subscription> = self.subscribers.read().values().cloned().collect();
        f(&subscribers, &mut *self.history.lock())
    }

    pub(crate) fn record(&self, message: Message) {
        self.history.lock().record(message);
    }

    pub(crate) fn history_last(&self, n: usize) -> Vec<Message> {
        self.history.lock().last(n)
    }

    pub(crate) fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// Owner of channel definitions and the bi-directional subscription maps.
pub struct ChannelIndex {
    directory: RwLock<HashMap<ChannelId, Arc<ChannelEntry>>>,
    by_connection: RwLock<HashMap<ConnectionId, HashSet<ChannelId>>>,
    settings: ChannelSettings,
}

impl ChannelIndex {
    /// Create an index and define the configured startup channels.
    pub fn new(settings: ChannelSettings) -> Self {
        let index = Self {
            directory: RwLock::new(HashMap::new()),
            by_connection: RwLock::new(HashMap::new()),
            settings: settings.clone(),
        };
        for spec in settings.static_channels {
            // Startup specs come from config; duplicates there are a
            // config bug worth surfacing in logs, not a crash.
            if let Err(e) = index.define(spec) {
                tracing::warn!(error = %e, "skipping startup channel");
            }
        }
        index
    }

    /// Channel settings in force.
    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// Define a channel, opening it for subscriptions.
    ///
    /// Defining the same name with an identical spec is a no-op; a
    /// differing spec is a conflict error.
    pub fn define(&self, spec: ChannelSpec) -> Result<()> {
        let mut directory = self.directory.write();
        if let Some(existing) = directory.get(&spec.id) {
            if existing.spec == spec {
                return Ok(());
            }
            return Err(RelayError::ChannelConflict(spec.id.to_string()));
        }

        tracing::debug!(channel = %spec.id, kind = spec.kind.as_str(), "channel defined");
        directory.insert(
            spec.id.clone(),
            Arc::new(ChannelEntry::new(spec, self.settings.message_history_size)),
        );
        Ok(())
    }

    pub(crate) fn entry(&self, channel: &ChannelId) -> Option<Arc<ChannelEntry>> {
        self.directory.read().get(channel).cloned()
    }

    /// Spec of a defined channel.
    pub fn spec(&self, channel: &ChannelId) -> Option<ChannelSpec> {
        self.entry(channel).map(|e| e.spec.clone())
    }

    /// Subscribe a connection to a channel.
    pub fn subscribe(
        &self,
        conn: &Arc<Connection>,
        channel: &ChannelId,
        filter: Option<SubscriptionFilter>,
    ) -> Result<Subscription> {
        let entry = self
            .entry(channel)
            .ok_or_else(|| RelayError::ChannelNotFound(channel.to_string()))?;

        match entry.state() {
            ChannelState::Open => {}
            ChannelState::Removed => {
                return Err(RelayError::ChannelNotFound(channel.to_string()))
            }
            ChannelState::Defined | ChannelState::Closed => {
                return Err(RelayError::ChannelAccessDenied(format!(
                    "channel {} is not accepting subscriptions",
                    channel
                )))
            }
        }

        if entry.spec.requires_auth && !conn.is_authenticated() {
            return Err(RelayError::ChannelAccessDenied(format!(
                "channel {} requires authentication",
                channel
            )));
        }

        if conn.subscription_count() >= self.settings.max_subscriptions {
            return Err(RelayError::SubscriptionLimitExceeded(format!(
                "connection cap of {} subscriptions reached",
                self.settings.max_subscriptions
            )));
        }

        let subscription = Subscription {
            conn_id: conn.id(),
            filter,
            subscribed_at: Utc::now(),
        };

        {
            let mut subscribers = entry.subscribers.write();
            let cap = entry
                .spec
                .max_subscribers
                .unwrap_or(self.settings.max_subscribers);
            if !subscribers.contains_key(&conn.id()) && subscribers.len() >= cap {
                return Err(RelayError::SubscriptionLimitExceeded(format!(
                    "channel {} cap of {} subscribers reached",
                    channel, cap
                )));
            }
            subscribers.insert(conn.id(), subscription.clone());
        }

        self.by_connection
            .write()
            .entry(conn.id())
            .or_default()
            .insert(channel.clone());
        conn.add_channel(channel.clone());

        tracing::debug!(conn = %conn.id(), channel = %channel, "subscribed");
        Ok(subscription)
    }

    /// Unsubscribe a connection from a channel. Idempotent; returns whether
    /// a subscription was removed.
    pub fn unsubscribe(&self, conn: &Arc<Connection>, channel: &ChannelId) -> bool {
        let removed = self.detach(conn.id(), channel);
        if removed {
            conn.remove_channel(channel);
            tracing::debug!(conn = %conn.id(), channel = %channel, "unsubscribed");
        }
        removed
    }

    /// Remove the (connection, channel) relation from both indexes.
    fn detach(&self, conn_id: ConnectionId, channel: &ChannelId) -> bool {
        let Some(entry) = self.entry(channel) else {
            return false;
        };
        let removed = entry.subscribers.write().remove(&conn_id).is_some();

        if removed {
            let mut by_connection = self.by_connection.write();
            if let Some(channels) = by_connection.get_mut(&conn_id) {
                channels.remove(channel);
                if channels.is_empty() {
                    by_connection.remove(&conn_id);
                }
            }
        }
        removed
    }

    /// Current subscribers of a channel.
    pub fn subscribers(&self, channel: &ChannelId) -> Vec<Subscription> {
        self.entry(channel)
            .map(|e| e.subscribers.read().values().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels a connection subscribes to.
    pub fn subscriptions_of(&self, conn_id: ConnectionId) -> Vec<ChannelId> {
        self.by_connection
            .read()
            .get(&conn_id)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a (connection, channel) subscription exists.
    pub fn is_subscribed(&self, conn_id: ConnectionId, channel: &ChannelId) -> bool {
        self.by_connection
            .read()
            .get(&conn_id)
            .is_some_and(|channels| channels.contains(channel))
    }

    /// Remove every subscription of a connection, e.g. on disconnect.
    pub fn cleanup(&self, conn_id: ConnectionId) -> usize {
        let channels: Vec<ChannelId> = {
            let mut by_connection = self.by_connection.write();
            by_connection
                .remove(&conn_id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default()
        };

        let mut removed = 0;
        for channel in &channels {
            if let Some(entry) = self.entry(channel) {
                if entry.subscribers.write().remove(&conn_id).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Append a message to a channel's history ring.
    pub fn record(&self, channel: &ChannelId, message: Message) {
        if let Some(entry) = self.entry(channel) {
            entry.record(message);
        }
    }

    /// The last `min(n, len)` history messages, oldest first.
    pub fn history(&self, channel: &ChannelId, n: usize) -> Vec<Message> {
        self.entry(channel)
            .map(|e| e.history_last(n))
            .unwrap_or_default()
    }

    /// Messages currently in a channel's history ring.
    pub fn history_len(&self, channel: &ChannelId) -> usize {
        self.entry(channel).map(|e| e.history_len()).unwrap_or(0)
    }

    /// Close a channel: existing subscriptions survive, new ones are
    /// rejected.
    pub fn close(&self, channel: &ChannelId) -> Result<()> {
        let entry = self
            .entry(channel)
            .ok_or_else(|| RelayError::ChannelNotFound(channel.to_string()))?;
        *entry.state.write() = ChannelState::Closed;
        tracing::debug!(channel = %channel, "channel closed");
        Ok(())
    }

    /// Remove a channel, force-unsubscribing every subscriber. Returns the
    /// affected connection IDs so the caller can notify them.
    pub fn remove(&self, channel: &ChannelId) -> Result<Vec<ConnectionId>> {
        let entry = {
            let mut directory = self.directory.write();
            directory
                .remove(channel)
                .ok_or_else(|| RelayError::ChannelNotFound(channel.to_string()))?
        };
        *entry.state.write() = ChannelState::Removed;

        let conn_ids: Vec<ConnectionId> = {
            let mut subscribers = entry.subscribers.write();
            let ids = subscribers.keys().copied().collect();
            subscribers.clear();
            ids
        };

        let mut by_connection = self.by_connection.write();
        for conn_id in &conn_ids {
            if let Some(channels) = by_connection.get_mut(conn_id) {
                channels.remove(channel);
                if channels.is_empty() {
                    by_connection.remove(conn_id);
                }
            }
        }

        tracing::debug!(channel = %channel, evicted = conn_ids.len(), "channel removed");
        Ok(conn_ids)
    }

    /// Subscriber count of a channel.
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.entry(channel).map(|e| e.subscriber_count()).unwrap_or(0)
    }

    /// Total subscriptions across all channels.
    pub fn total_subscriptions(&self) -> usize {
        self.by_connection.read().values().map(|s| s.len()).sum()
    }

    /// Number of defined channels.
    pub fn channel_count(&self) -> usize {
        self.directory.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::message::MessageDraft;
    use relay_core::rate_limit::RateLimitSettings;
    use relay_core::session::{Role, UserId, VerifiedIdentity};
    use serde_json::json;

    use crate::metrics::Metrics;
    use crate::registry::ConnectionRegistry;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(
            RateLimitSettings::default(),
            16,
            false,
            Arc::new(Metrics::new()),
        )
    }

    fn index() -> ChannelIndex {
        let index = ChannelIndex::new(ChannelSettings::default());
        index.define(ChannelSpec::new("market-data")).unwrap();
        index
    }

    fn authenticate(registry: &ConnectionRegistry, conn: &Arc<Connection>, user: &str) {
        registry
            .attach_user(
                conn.id(),
                VerifiedIdentity {
                    user_id: UserId::new(user),
                    role: Role::User,
                    permissions: vec![],
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                },
            )
            .unwrap();
    }

    #[test]
    fn test_define_is_idempotent_for_identical_spec() {
        let index = index();
        assert!(index.define(ChannelSpec::new("market-data")).is_ok());
        assert_eq!(index.channel_count(), 1);

        let conflicting = ChannelSpec::new("market-data").with_requires_auth(true);
        assert!(matches!(
            index.define(conflicting),
            Err(RelayError::ChannelConflict(_))
        ));
    }

    #[test]
    fn test_subscribe_unknown_channel() {
        let registry = registry();
        let index = index();
        let conn = registry.register().unwrap();

        let err = index
            .subscribe(&conn, &ChannelId::new("nope"), None)
            .unwrap_err();
        assert!(matches!(err, RelayError::ChannelNotFound(_)));
    }

    #[test]
    fn test_subscribe_requires_auth() {
        let registry = registry();
        let index = index();
        index
            .define(ChannelSpec::new("portfolio").with_requires_auth(true))
            .unwrap();
        let conn = registry.register().unwrap();
        let portfolio = ChannelId::new("portfolio");

        let err = index.subscribe(&conn, &portfolio, None).unwrap_err();
        assert!(matches!(err, RelayError::ChannelAccessDenied(_)));

        // After authenticating, the same subscribe succeeds.
        authenticate(&registry, &conn, "u-1");
        assert!(index.subscribe(&conn, &portfolio, None).is_ok());
    }

    #[test]
    fn test_indexes_stay_symmetric() {
        let registry = registry();
        let index = index();
        let conn = registry.register().unwrap();
        let channel = ChannelId::new("market-data");

        index.subscribe(&conn, &channel, None).unwrap();
        assert!(index.is_subscribed(conn.id(), &channel));
        assert_eq!(index.subscribers(&channel).len(), 1);
        assert_eq!(index.subscriptions_of(conn.id()), vec![channel.clone()]);
        assert!(conn.subscribes(&channel));

        index.unsubscribe(&conn, &channel);
        assert!(!index.is_subscribed(conn.id(), &channel));
        assert!(index.subscribers(&channel).is_empty());
        assert!(index.subscriptions_of(conn.id()).is_empty());
        assert!(!conn.subscribes(&channel));
        assert_eq!(index.total_subscriptions(), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = registry();
        let index = index();
        let conn = registry.register().unwrap();
        let channel = ChannelId::new("market-data");

        index.subscribe(&conn, &channel, None).unwrap();
        assert!(index.unsubscribe(&conn, &channel));
        assert!(!index.unsubscribe(&conn, &channel));
    }

    #[test]
    fn test_per_connection_subscription_cap() {
        let registry = registry();
        let settings = ChannelSettings {
            max_subscriptions: 50,
            ..Default::default()
        };
        let index = ChannelIndex::new(settings);
        let conn = registry.register().unwrap();

        for n in 0..50 {
            let channel = ChannelId::new(format!("chan-{n}"));
            index.define(ChannelSpec::new(channel.clone())).unwrap();
            index.subscribe(&conn, &channel, None).unwrap();
        }

        let channel = ChannelId::new("chan-50");
        index.define(ChannelSpec::new(channel.clone())).unwrap();
        let before = index.total_subscriptions();
        let err = index.subscribe(&conn, &channel, None).unwrap_err();
        assert!(matches!(err, RelayError::SubscriptionLimitExceeded(_)));
        // Neither index changed.
        assert_eq!(index.total_subscriptions(), before);
        assert_eq!(index.subscriber_count(&channel), 0);
    }

    #[test]
    fn test_per_channel_subscriber_cap() {
        let registry = registry();
        let index = ChannelIndex::new(ChannelSettings::default());
        index
            .define(ChannelSpec::new("tight").with_max_subscribers(2))
            .unwrap();
        let channel = ChannelId::new("tight");

        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        let c = registry.register().unwrap();

        index.subscribe(&a, &channel, None).unwrap();
        index.subscribe(&b, &channel, None).unwrap();
        let err = index.subscribe(&c, &channel, None).unwrap_err();
        assert!(matches!(err, RelayError::SubscriptionLimitExceeded(_)));
        assert_eq!(index.subscriber_count(&channel), 2);
    }

    #[test]
    fn test_cleanup_removes_all_subscriptions() {
        let registry = registry();
        let index = index();
        index.define(ChannelSpec::new("alerts")).unwrap();
        let conn = registry.register().unwrap();

        index
            .subscribe(&conn, &ChannelId::new("market-data"), None)
            .unwrap();
        index
            .subscribe(&conn, &ChannelId::new("alerts"), None)
            .unwrap();

        assert_eq!(index.cleanup(conn.id()), 2);
        assert_eq!(index.total_subscriptions(), 0);
        assert!(index.subscribers(&ChannelId::new("alerts")).is_empty());
    }

    #[test]
    fn test_closed_channel_rejects_new_keeps_existing() {
        let registry = registry();
        let index = index();
        let channel = ChannelId::new("market-data");
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();

        index.subscribe(&a, &channel, None).unwrap();
        index.close(&channel).unwrap();

        assert!(matches!(
            index.subscribe(&b, &channel, None),
            Err(RelayError::ChannelAccessDenied(_))
        ));
        assert_eq!(index.subscriber_count(&channel), 1);
    }

    #[test]
    fn test_remove_force_unsubscribes() {
        let registry = registry();
        let index = index();
        let channel = ChannelId::new("market-data");
        let conn = registry.register().unwrap();
        index.subscribe(&conn, &channel, None).unwrap();

        let evicted = index.remove(&channel).unwrap();
        assert_eq!(evicted, vec![conn.id()]);
        assert_eq!(index.channel_count(), 0);
        assert!(index.subscriptions_of(conn.id()).is_empty());
        assert!(matches!(
            index.subscribe(&conn, &channel, None),
            Err(RelayError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn test_history_record_and_query() {
        let index = index();
        let channel = ChannelId::new("market-data");

        for n in 0..3 {
            index.record(
                &channel,
                MessageDraft::new(json!({ "n": n })).into_message(channel.clone()),
            );
        }

        assert_eq!(index.history_len(&channel), 3);
        let last_two = index.history(&channel, 2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].payload["n"], 1);
        assert_eq!(last_two[1].payload["n"], 2);
    }

    #[test]
    fn test_startup_channels_from_settings() {
        let settings = ChannelSettings {
            static_channels: vec![
                ChannelSpec::new("market-data"),
                ChannelSpec::new("system").with_requires_auth(true),
            ],
            ..Default::default()
        };
        let index = ChannelIndex::new(settings);
        assert_eq!(index.channel_count(), 2);
        assert!(index.spec(&ChannelId::new("system")).unwrap().requires_auth);
    }
}
