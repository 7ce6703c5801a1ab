mod store;

pub use store::{store_key, MemoryQueueStore, QueueStore};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use relay_core::channel::ChannelId;
use relay_core::config::QueueSettings;
use relay_core::message::{Message, MessageId, Priority};
use relay_core::session::UserId;

use crate::metrics::{incr, Metrics};

/// A message held for an offline user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// The message awaiting delivery.
    pub message: Message,
    /// Target user.
    pub user_id: UserId,
    /// Channel the message belongs to.
    pub channel_id: ChannelId,
    /// When the message was queued.
    pub queued_at: DateTime<Utc>,
    /// When the message expires.
    pub expires_at: DateTime<Utc>,
    /// Delivery priority, copied from the message metadata.
    pub priority: Priority,
    /// Attempts made so far.
    pub attempts: u32,
    /// Attempts allowed.
    pub max_attempts: u32,
    /// When the last attempt was made.
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    /// Whether the message has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn in_retry_delay(&self, now: DateTime<Utc>, delay: chrono::Duration) -> bool {
        self.last_attempt_at
            .is_some_and(|at| now - at < delay)
    }
}

/// Outcome of one delivery attempt, reported by the caller-supplied
/// delivery closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Delivered to at least one live subscription; the message is removed.
    Delivered,
    /// The user no longer subscribes to the channel on any live connection;
    /// the message is dropped without error.
    NotSubscribed,
    /// Delivery failed; the message is retried until `max_attempts`.
    Failed,
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    /// Users with pending messages.
    pub users: usize,
    /// Total pending messages.
    pub messages: usize,
}

/// Per-user bounded priority queue of messages awaiting reconnection.
///
/// Each user's list is kept sorted by (priority desc, queued_at asc); at the
/// per-user cap the oldest lowest-priority message is evicted. Sizes stay
/// small enough that a stable insertion position scan beats a heap.
pub struct OfflineQueue {
    queues: Mutex<HashMap<UserId, Vec<QueuedMessage>>>,
    settings: QueueSettings,
    store: Option<Arc<dyn QueueStore>>,
    metrics: Arc<Metrics>,
}

impl OfflineQueue {
    /// Create a queue with no durable mirror.
    pub fn new(settings: QueueSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            settings,
            store: None,
            metrics,
        }
    }

    /// Attach a durable store; writes are mirrored into it best-effort.
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Queue settings in force.
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Queue a message for an offline user.
    pub fn enqueue(&self, user_id: UserId, channel_id: ChannelId, message: Message) {
        if !self.settings.enabled {
            return;
        }

        let now = Utc::now();
        let ttl = message.metadata.ttl.unwrap_or(self.settings.ttl_seconds);
        let entry = QueuedMessage {
            priority: message.priority(),
            user_id: user_id.clone(),
            channel_id,
            queued_at: now,
            expires_at: now + chrono::Duration::seconds(ttl as i64),
            attempts: 0,
            max_attempts: self.settings.max_retries,
            last_attempt_at: None,
            message,
        };

        self.mirror_put(&entry);
        incr(&self.metrics.offline_enqueued);

        let mut queues = self.queues.lock();
        let queue = queues.entry(user_id.clone()).or_default();
        insert_sorted(queue, entry);

        while queue.len() > self.settings.max_size {
            if let Some(evicted) = evict_lowest_oldest(queue) {
                tracing::debug!(
                    user = %user_id,
                    message = %evicted.message.id,
                    "offline queue overflow, evicted"
                );
                self.mirror_delete(&evicted);
            }
        }
    }

    /// Drain up to one batch for a user through the delivery closure.
    /// Returns the number of messages delivered.
    pub fn process_user<F>(&self, user_id: &UserId, mut deliver: F) -> usize
    where
        F: FnMut(&QueuedMessage) -> DeliveryOutcome,
    {
        let now = Utc::now();
        let retry_delay = chrono::Duration::milliseconds(self.settings.retry_delay_ms as i64);

        // Pull one batch out under the lock; delivery runs without it.
        let batch: Vec<QueuedMessage> = {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(user_id) else {
                return 0;
            };

            let mut batch = Vec::new();
            let mut kept = Vec::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if entry.is_expired(now) {
                    incr(&self.metrics.offline_expired);
                    self.mirror_delete(&entry);
                    continue;
                }
                if batch.len() < self.settings.batch_size
                    && !entry.in_retry_delay(now, retry_delay)
                {
                    batch.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *queue = kept;
            batch
        };

        let mut delivered = 0;
        let mut retry = Vec::new();
        for mut entry in batch {
            match deliver(&entry) {
                DeliveryOutcome::Delivered => {
                    delivered += 1;
                    incr(&self.metrics.offline_delivered);
                    self.mirror_delete(&entry);
                }
                DeliveryOutcome::NotSubscribed => {
                    tracing::debug!(
                        user = %user_id,
                        channel = %entry.channel_id,
                        "dropping queued message, user no longer subscribed"
                    );
                    self.mirror_delete(&entry);
                }
                DeliveryOutcome::Failed => {
                    entry.attempts += 1;
                    entry.last_attempt_at = Some(Utc::now());
                    if entry.attempts >= entry.max_attempts {
                        tracing::warn!(
                            user = %user_id,
                            message = %entry.message.id,
                            attempts = entry.attempts,
                            "delivery-failed, dropping queued message"
                        );
                        incr(&self.metrics.offline_failed);
                        self.mirror_delete(&entry);
                    } else {
                        retry.push(entry);
                    }
                }
            }
        }

        if !retry.is_empty() {
            let mut queues = self.queues.lock();
            let queue = queues.entry(user_id.clone()).or_default();
            for entry in retry {
                insert_sorted(queue, entry);
            }
        }

        delivered
    }

    /// Run one processor pass over every user with pending messages.
    /// `online` reports whether a user has at least one live connection.
    pub fn process_all<O, F>(&self, online: O, mut deliver: F) -> usize
    where
        O: Fn(&UserId) -> bool,
        F: FnMut(&QueuedMessage) -> DeliveryOutcome,
    {
        let users: Vec<UserId> = {
            let queues = self.queues.lock();
            queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(u, _)| u.clone())
                .collect()
        };

        users
            .into_iter()
            .filter(|user| online(user))
            .map(|user| self.process_user(&user, &mut deliver))
            .sum()
    }

    /// Remove one message by ID wherever it is queued.
    pub fn remove(&self, message_id: MessageId) -> bool {
        let removed = {
            let mut queues = self.queues.lock();
            queues.values_mut().find_map(|queue| {
                queue
                    .iter()
                    .position(|e| e.message.id == message_id)
                    .map(|idx| queue.remove(idx))
            })
        };

        match removed {
            Some(entry) => {
                self.mirror_delete(&entry);
                true
            }
            None => false,
        }
    }

    /// Drop every queued message for a user.
    pub fn clear_user(&self, user_id: &UserId) -> usize {
        let removed = self.queues.lock().remove(user_id);
        match removed {
            Some(entries) => {
                for entry in &entries {
                    self.mirror_delete(entry);
                }
                entries.len()
            }
            None => 0,
        }
    }

    /// Drop expired messages and empty user queues.
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut dropped = 0;
        let mut queues = self.queues.lock();
        queues.retain(|_, queue| {
            queue.retain(|entry| {
                if entry.is_expired(now) {
                    incr(&self.metrics.offline_expired);
                    self.mirror_delete(entry);
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
            !queue.is_empty()
        });
        dropped
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> QueueStats {
        let queues = self.queues.lock();
        QueueStats {
            users: queues.len(),
            messages: queues.values().map(|q| q.len()).sum(),
        }
    }

    /// Pending messages for one user, for inspection.
    pub fn pending(&self, user_id: &UserId) -> Vec<QueuedMessage> {
        self.queues.lock().get(user_id).cloned().unwrap_or_default()
    }

    fn mirror_put(&self, entry: &QueuedMessage) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put(entry) {
                tracing::warn!(error = %e, "queue store put failed");
            }
        }
    }

    fn mirror_delete(&self, entry: &QueuedMessage) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&entry.user_id, entry.message.id) {
                tracing::warn!(error = %e, "queue store delete failed");
            }
        }
    }
}

/// Insert keeping (priority desc, queued_at asc) order; stable, so equal
/// priorities stay FIFO.
fn insert_sorted(queue: &mut Vec<QueuedMessage>, entry: QueuedMessage) {
    let idx = queue
        .iter()
        .position(|e| e.priority < entry.priority)
        .unwrap_or(queue.len());
    queue.insert(idx, entry);
}

/// Evict the oldest message of the lowest priority present.
fn evict_lowest_oldest(queue: &mut Vec<QueuedMessage>) -> Option<QueuedMessage> {
    let min_priority = queue.iter().map(|e| e.priority).min()?;
    let idx = queue.iter().position(|e| e.priority == min_priority)?;
    Some(queue.remove(idx))
}
