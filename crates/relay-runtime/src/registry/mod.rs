mod connection;
mod outbound;

pub use connection::Connection;
pub use outbound::{OutboundFrame, OutboundQueue, PushOutcome};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use relay_core::error::{RelayError, Result};
use relay_core::rate_limit::RateLimitSettings;
use relay_core::session::{ConnectionId, DisconnectReason, SessionState, UserId, VerifiedIdentity};

use crate::metrics::{incr, Metrics};

/// Owner of all live connections.
///
/// Indexes connections by ID with a secondary user index kept in lockstep.
/// Lookups take the read lock; register/unregister take the write lock. The
/// locks are never held across an await.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    by_user: RwLock<HashMap<UserId, HashSet<ConnectionId>>>,
    settings: RateLimitSettings,
    outbound_capacity: usize,
    auth_required: bool,
    metrics: Arc<Metrics>,
}

impl ConnectionRegistry {
    /// Create a registry.
    pub fn new(
        settings: RateLimitSettings,
        outbound_capacity: usize,
        auth_required: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            by_user: RwLock::new(HashMap::new()),
            settings,
            outbound_capacity,
            auth_required,
            metrics,
        }
    }

    /// Rate-limit settings in force.
    pub fn rate_settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Register a newly accepted transport.
    ///
    /// Fails with `ConnectionLimitExceeded` at the global admission cap.
    pub fn register(&self) -> Result<Arc<Connection>> {
        let mut connections = self.connections.write();
        if connections.len() >= self.settings.max_connections {
            return Err(RelayError::ConnectionLimitExceeded(format!(
                "connection cap of {} reached",
                self.settings.max_connections
            )));
        }

        let initial_state = if self.auth_required {
            SessionState::Authenticating
        } else {
            SessionState::Accepted
        };
        let conn = Arc::new(Connection::new(
            Arc::new(OutboundQueue::new(self.outbound_capacity)),
            initial_state,
            self.settings.limit_for(relay_core::session::Role::Anonymous),
        ));
        connections.insert(conn.id(), conn.clone());
        incr(&self.metrics.connections_opened);
        tracing::debug!(conn = %conn.id(), "connection registered");
        Ok(conn)
    }

    /// Attach an authenticated identity to a connection and index it by
    /// user. The new role's rate limit takes effect at the next window
    /// reset.
    pub fn attach_user(&self, conn_id: ConnectionId, identity: VerifiedIdentity) -> Result<()> {
        let conn = self
            .get(conn_id)
            .ok_or_else(|| RelayError::ConnectionNotFound(conn_id.to_string()))?;

        let user_id = identity.user_id.clone();
        conn.attach(identity);

        let mut by_user = self.by_user.write();
        by_user.entry(user_id.clone()).or_default().insert(conn_id);
        tracing::debug!(conn = %conn_id, user = %user_id, "user attached");
        Ok(())
    }

    /// Remove a connection from both indexes and close its outbound path.
    /// Returns the connection so the caller can clean up its subscriptions.
    pub fn unregister(
        &self,
        conn_id: ConnectionId,
        reason: DisconnectReason,
    ) -> Option<Arc<Connection>> {
        let conn = self.connections.write().remove(&conn_id)?;

        if let Some(user_id) = conn.user_id() {
            let mut by_user = self.by_user.write();
            if let Some(ids) = by_user.get_mut(&user_id) {
                ids.remove(&conn_id);
                if ids.is_empty() {
                    by_user.remove(&user_id);
                }
            }
        }

        conn.flag_disconnect(reason);
        conn.set_state(SessionState::Closed);
        incr(&self.metrics.connections_closed);
        tracing::debug!(conn = %conn_id, reason = reason.as_str(), "connection unregistered");
        Some(conn)
    }

    /// Look up a connection by ID.
    pub fn get(&self, conn_id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&conn_id).cloned()
    }

    /// Live connections for a user.
    pub fn connections_of_user(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let ids = match self.by_user.read().get(user_id) {
            Some(ids) => ids.iter().copied().collect::<Vec<_>>(),
            None => return Vec::new(),
        };
        let connections = self.connections.read();
        ids.iter()
            .filter_map(|id| connections.get(id).cloned())
            .collect()
    }

    /// Whether a user has at least one live connection.
    pub fn user_is_online(&self, user_id: &UserId) -> bool {
        self.by_user
            .read()
            .get(user_id)
            .is_some_and(|ids| !ids.is_empty())
    }

    /// Enqueue a frame to one connection. Returns whether the frame was
    /// admitted to the outbound path; failures never escape as errors.
    pub fn send(&self, conn_id: ConnectionId, frame: OutboundFrame) -> bool {
        let Some(conn) = self.get(conn_id) else {
            incr(&self.metrics.delivery_failures);
            return false;
        };
        self.send_to_connection(&conn, frame)
    }

    /// Enqueue a frame to an already-resolved connection.
    pub fn send_to_connection(&self, conn: &Arc<Connection>, frame: OutboundFrame) -> bool {
        match conn.outbound().push(frame) {
            PushOutcome::Queued => {
                conn.touch();
                incr(&self.metrics.frames_delivered);
                true
            }
            PushOutcome::QueuedEvictedOldest => {
                conn.touch();
                incr(&self.metrics.frames_delivered);
                incr(&self.metrics.frames_dropped);
                incr(&self.metrics.slow_consumers);
                tracing::warn!(conn = %conn.id(), "slow consumer: evicted oldest outbound frame");
                true
            }
            PushOutcome::Dropped => {
                incr(&self.metrics.frames_dropped);
                incr(&self.metrics.slow_consumers);
                false
            }
            PushOutcome::RejectedCritical => {
                incr(&self.metrics.frames_dropped);
                incr(&self.metrics.slow_consumers);
                tracing::warn!(
                    conn = %conn.id(),
                    "slow consumer: critical frame rejected, disconnecting"
                );
                conn.flag_disconnect(DisconnectReason::SlowConsumer);
                false
            }
            PushOutcome::Closed => {
                incr(&self.metrics.delivery_failures);
                false
            }
        }
    }

    /// Enqueue a frame to every live connection of a user. Returns the
    /// number of connections that admitted it.
    pub fn send_to_user(&self, user_id: &UserId, frame: OutboundFrame) -> usize {
        self.connections_of_user(user_id)
            .iter()
            .filter(|conn| self.send_to_connection(conn, frame.clone()))
            .count()
    }

    /// Visit every connection matching a predicate.
    pub fn for_each<P, F>(&self, pred: P, mut f: F)
    where
        P: Fn(&Arc<Connection>) -> bool,
        F: FnMut(&Arc<Connection>),
    {
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        for conn in connections.iter().filter(|c| pred(c)) {
            f(conn);
        }
    }

    /// Unregister connections idle past the threshold. Returns the removed
    /// connections so the caller can clean up their subscriptions.
    pub fn sweep_inactive(&self, threshold: Duration) -> Vec<Arc<Connection>> {
        let stale: Vec<ConnectionId> = {
            let connections = self.connections.read();
            connections
                .values()
                .filter(|c| c.idle_for(threshold))
                .map(|c| c.id())
                .collect()
        };

        stale
            .into_iter()
            .filter_map(|id| self.unregister(id, DisconnectReason::Inactive))
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
