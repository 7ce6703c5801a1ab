use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use relay_core::auth::TokenVerifier;
use relay_core::channel::{ChannelId, ChannelSpec};
use relay_core::config::RelayConfig;
use relay_core::error::Result;
use relay_core::message::MessageDraft;
use relay_core::protocol::ServerFrame;
use relay_core::session::{ConnectionId, DisconnectReason, UserId};

use crate::channels::ChannelIndex;
use crate::dispatch::Dispatcher;
use crate::gateway::{GatewayContext, GatewayServer};
use crate::hooks::RelayHooks;
use crate::metrics::Metrics;
use crate::queue::{DeliveryOutcome, OfflineQueue, QueueStats};
use crate::registry::ConnectionRegistry;

/// Top of the runtime: owns every component, accepts transport connections
/// through the gateway, runs the periodic tasks, and exposes the publish
/// API to producers.
///
/// Dependency arrows run strictly leaf to root; observers come in as a hook
/// table at construction.
pub struct Supervisor {
    config: Arc<RelayConfig>,
    registry: Arc<ConnectionRegistry>,
    channels: Arc<ChannelIndex>,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<OfflineQueue>,
    metrics: Arc<Metrics>,
    hooks: RelayHooks,
    context: Arc<GatewayContext>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl Supervisor {
    /// Assemble the runtime from configuration.
    pub fn new(
        config: RelayConfig,
        verifier: Option<Arc<dyn TokenVerifier>>,
        hooks: RelayHooks,
    ) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ConnectionRegistry::new(
            config.rate_limit.clone(),
            config.server.outbound_capacity,
            config.auth.required,
            metrics.clone(),
        ));
        let channels = Arc::new(ChannelIndex::new(config.channels.clone()));
        let queue = Arc::new(OfflineQueue::new(config.queue.clone(), metrics.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            channels.clone(),
            queue.clone(),
            hooks.clone(),
            metrics.clone(),
        ));
        let context = Arc::new(GatewayContext {
            config: config.clone(),
            registry: registry.clone(),
            channels: channels.clone(),
            dispatcher: dispatcher.clone(),
            hooks: hooks.clone(),
            metrics: metrics.clone(),
            verifier,
        });

        Self {
            config,
            registry,
            channels,
            dispatcher,
            queue,
            metrics,
            hooks,
            context,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Configuration in force.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The channel index.
    pub fn channels(&self) -> &Arc<ChannelIndex> {
        &self.channels
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The offline queue.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// The metrics registry.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Shared gateway state, e.g. for embedding the router elsewhere.
    pub fn gateway_context(&self) -> Arc<GatewayContext> {
        self.context.clone()
    }

    /// Spawn the periodic tasks. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = self.registry.clone();
        let channels = self.channels.clone();
        let hooks = self.hooks.clone();
        let threshold = self.config.server.inactivity_threshold();
        self.spawn_periodic(
            "inactivity-sweep",
            self.config.server.sweep_interval(),
            Arc::new(move || {
                let swept = sweep_pass(&registry, &channels, &hooks, threshold);
                if swept > 0 {
                    tracing::info!(swept, "inactivity sweep disconnected connections");
                }
            }),
        );

        if self.config.queue.enabled {
            let registry = self.registry.clone();
            let dispatcher = self.dispatcher.clone();
            let queue = self.queue.clone();
            self.spawn_periodic(
                "queue-processor",
                self.config.queue.interval(),
                Arc::new(move || {
                    queue_pass(&registry, &dispatcher, &queue);
                }),
            );

            let queue = self.queue.clone();
            self.spawn_periodic(
                "queue-cleanup",
                self.config.queue.cleanup_interval(),
                Arc::new(move || {
                    let dropped = queue.cleanup();
                    if dropped > 0 {
                        tracing::debug!(dropped, "queue cleanup dropped expired messages");
                    }
                }),
            );
        }

        let registry = self.registry.clone();
        let channels = self.channels.clone();
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();
        self.spawn_periodic(
            "metrics",
            self.config.monitoring.metrics_interval(),
            Arc::new(move || {
                metrics.emit(
                    registry.len(),
                    channels.total_subscriptions(),
                    queue.stats().messages,
                );
            }),
        );

        tracing::info!("supervisor started");
    }

    /// Serve the gateway until shutdown; starts the periodic tasks.
    pub async fn run(&self) -> Result<()> {
        self.start();
        let server = GatewayServer::new(self.context.clone());
        server
            .run(self.shutdown.clone())
            .await
            .map_err(relay_core::error::RelayError::from)
    }

    /// Stop the gateway and every periodic task.
    pub fn shutdown(&self) {
        tracing::info!("supervisor shutting down");
        self.shutdown.cancel();
    }

    /// Publish a message to a channel.
    pub fn publish(&self, channel: &ChannelId, draft: MessageDraft) -> Result<usize> {
        self.dispatcher.publish(channel, draft)
    }

    /// Send a message to a user, falling back to the offline queue.
    pub fn send_to_user(
        &self,
        user_id: &UserId,
        channel: &ChannelId,
        draft: MessageDraft,
    ) -> Result<usize> {
        self.dispatcher.send_to_user(user_id, channel, draft)
    }

    /// Send a message to one connection.
    pub fn send_to_connection(
        &self,
        conn_id: ConnectionId,
        channel: &ChannelId,
        draft: MessageDraft,
    ) -> Result<bool> {
        self.dispatcher.send_to_connection(conn_id, channel, draft)
    }

    /// Define a channel at runtime.
    pub fn define_channel(&self, spec: ChannelSpec) -> Result<()> {
        self.channels.define(spec)
    }

    /// Close a channel to new subscriptions.
    pub fn close_channel(&self, channel: &ChannelId) -> Result<()> {
        self.channels.close(channel)
    }

    /// Remove a channel, notifying force-unsubscribed connections.
    pub fn remove_channel(&self, channel: &ChannelId) -> Result<usize> {
        let evicted = self.channels.remove(channel)?;
        let count = evicted.len();
        for conn_id in evicted {
            if let Some(conn) = self.registry.get(conn_id) {
                conn.remove_channel(channel);
                self.context.send_frame(
                    &conn,
                    &ServerFrame::SubscriptionUpdate {
                        channel: channel.clone(),
                        status: "unsubscribed".to_string(),
                        reason: Some("channel removed".to_string()),
                    },
                );
            }
        }
        Ok(count)
    }

    /// One inactivity sweep pass; exposed for tests.
    pub fn sweep_pass(&self) -> usize {
        sweep_pass(
            &self.registry,
            &self.channels,
            &self.hooks,
            self.config.server.inactivity_threshold(),
        )
    }

    /// One offline-queue processor pass; exposed for tests.
    pub fn queue_pass(&self) -> usize {
        queue_pass(&self.registry, &self.dispatcher, &self.queue)
    }

    /// Offline queue statistics.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    fn spawn_periodic(
        &self,
        name: &'static str,
        period: Duration,
        tick: Arc<dyn Fn() + Send + Sync>,
    ) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let tick = tick.clone();
                        // A panicking tick is contained here; the task
                        // itself keeps running.
                        if let Err(e) = tokio::spawn(async move { tick() }).await {
                            if e.is_panic() {
                                tracing::error!(task = name, "periodic task tick panicked");
                            }
                        }
                    }
                }
            }
            tracing::debug!(task = name, "periodic task stopped");
        });
    }
}

/// Disconnect connections idle past the threshold and drop their
/// subscriptions.
fn sweep_pass(
    registry: &ConnectionRegistry,
    channels: &ChannelIndex,
    hooks: &RelayHooks,
    threshold: Duration,
) -> usize {
    let swept = registry.sweep_inactive(threshold);
    for conn in &swept {
        channels.cleanup(conn.id());
        hooks.disconnect(conn.id(), DisconnectReason::Inactive);
    }
    swept.len()
}

/// Drain offline queues toward users that are back online.
fn queue_pass(
    registry: &Arc<ConnectionRegistry>,
    dispatcher: &Arc<Dispatcher>,
    queue: &Arc<OfflineQueue>,
) -> usize {
    queue.process_all(
        |user| registry.user_is_online(user),
        |entry| {
            if !dispatcher.user_subscribes(&entry.user_id, &entry.channel_id) {
                return DeliveryOutcome::NotSubscribed;
            }
            match dispatcher.deliver_to_user(&entry.user_id, &entry.message) {
                Ok(n) if n > 0 => DeliveryOutcome::Delivered,
                Ok(_) => DeliveryOutcome::Failed,
                Err(_) => DeliveryOutcome::Failed,
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::config::{ChannelSettings, QueueSettings, ServerConfig};
    use relay_core::message::Priority;

    use serde_json::json;

    fn supervisor(config: RelayConfig) -> Supervisor {
        Supervisor::new(config, None, RelayHooks::new())
    }

    fn config_with_channels() -> RelayConfig {
        RelayConfig {
            channels: ChannelSettings {
                static_channels: vec![ChannelSpec::new("market-data")],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn attach(sup: &Supervisor, conn: &Arc<crate::registry::Connection>, user: &str) {
        sup.registry()
            .attach_user(
                conn.id(),
                relay_core::session::VerifiedIdentity {
                    user_id: UserId::new(user),
                    role: relay_core::session::Role::User,
                    permissions: vec![],
                    expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_delegates_to_dispatcher() {
        let sup = supervisor(config_with_channels());
        let conn = sup.registry().register().unwrap();
        sup.channels()
            .subscribe(&conn, &ChannelId::new("market-data"), None)
            .unwrap();

        let delivered = sup
            .publish(
                &ChannelId::new("market-data"),
                MessageDraft::new(json!({"symbol": "AAPL"})),
            )
            .unwrap();
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_queue_pass_drains_reconnected_user() {
        let sup = supervisor(config_with_channels());
        let user = UserId::new("u-1");
        let channel = ChannelId::new("market-data");

        // Queue three messages while the user is offline.
        for (n, priority) in [
            (0u64, Priority::Low),
            (1, Priority::High),
            (2, Priority::Normal),
        ] {
            sup.send_to_user(
                &user,
                &channel,
                MessageDraft::new(json!({ "n": n })).with_priority(priority),
            )
            .unwrap();
        }
        assert_eq!(sup.queue_stats().messages, 3);

        // Nothing to drain while offline.
        assert_eq!(sup.queue_pass(), 0);

        // Reconnect and subscribe; the pass drains in priority order.
        let conn = sup.registry().register().unwrap();
        attach(&sup, &conn, "u-1");
        sup.channels().subscribe(&conn, &channel, None).unwrap();

        assert_eq!(sup.queue_pass(), 3);
        assert_eq!(sup.queue_stats().messages, 0);

        let mut ns = Vec::new();
        while let Some(frame) = conn.outbound().try_recv() {
            let value: serde_json::Value = serde_json::from_slice(&frame.bytes).unwrap();
            ns.push(value["data"]["n"].as_u64().unwrap());
        }
        assert_eq!(ns, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_queue_pass_drops_unsubscribed_messages() {
        let sup = supervisor(config_with_channels());
        let user = UserId::new("u-1");
        let channel = ChannelId::new("market-data");

        sup.send_to_user(&user, &channel, MessageDraft::new(json!({})))
            .unwrap();

        // Back online but not subscribed to the channel: the message is
        // dropped without error.
        let conn = sup.registry().register().unwrap();
        attach(&sup, &conn, "u-1");

        assert_eq!(sup.queue_pass(), 0);
        assert_eq!(sup.queue_stats().messages, 0);
    }

    #[tokio::test]
    async fn test_sweep_pass_cleans_subscriptions() {
        let config = RelayConfig {
            server: ServerConfig {
                inactivity_threshold_ms: 0,
                ..Default::default()
            },
            ..config_with_channels()
        };
        let sup = supervisor(config);
        let conn = sup.registry().register().unwrap();
        sup.channels()
            .subscribe(&conn, &ChannelId::new("market-data"), None)
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(sup.sweep_pass(), 1);
        assert!(sup.registry().is_empty());
        assert_eq!(sup.channels().total_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_remove_channel_notifies_subscribers() {
        let sup = supervisor(config_with_channels());
        let conn = sup.registry().register().unwrap();
        let channel = ChannelId::new("market-data");
        sup.channels().subscribe(&conn, &channel, None).unwrap();

        let evicted = sup.remove_channel(&channel).unwrap();
        assert_eq!(evicted, 1);
        assert!(!conn.subscribes(&channel));

        let frame = conn.outbound().try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame.bytes).unwrap();
        assert_eq!(value["type"], "subscription_update");
        assert_eq!(value["status"], "unsubscribed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_queue_processor_runs() {
        let config = RelayConfig {
            queue: QueueSettings {
                interval_ms: 1_000,
                ..Default::default()
            },
            ..config_with_channels()
        };
        let sup = supervisor(config);
        let user = UserId::new("u-1");
        let channel = ChannelId::new("market-data");

        sup.send_to_user(&user, &channel, MessageDraft::new(json!({"n": 1})))
            .unwrap();
        let conn = sup.registry().register().unwrap();
        attach(&sup, &conn, "u-1");
        sup.channels().subscribe(&conn, &channel, None).unwrap();

        sup.start();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(sup.queue_stats().messages, 0);
        assert!(conn.outbound().try_recv().is_some());
        sup.shutdown();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let sup = supervisor(config_with_channels());
        sup.start();
        sup.start();
        sup.shutdown();
    }
}
