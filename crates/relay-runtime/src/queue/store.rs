use relay_core::error::Result;
use relay_core::message::MessageId;
use relay_core::session::UserId;

use super::QueuedMessage;

/// Storage key for a queued message: `ws:queue:{userId}:{messageId}`.
pub fn store_key(user_id: &UserId, message_id: MessageId) -> String {
    format!("ws:queue:{}:{}", user_id, message_id)
}

/// Durable backend seam for the offline queue.
///
/// The queue itself is in-memory; when a store is attached, writes are
/// mirrored into it so a restart can recover pending messages. Backends map
/// `expires_at` to a native TTL. Implementations against external key-value
/// stores are collaborators; the bundled one is in-memory.
pub trait QueueStore: Send + Sync + 'static {
    /// Persist a queued message under its storage key.
    fn put(&self, entry: &QueuedMessage) -> Result<()>;

    /// Delete one queued message.
    fn delete(&self, user_id: &UserId, message_id: MessageId) -> Result<()>;

    /// Load every pending message for a user, in no particular order.
    fn load_user(&self, user_id: &UserId) -> Result<Vec<QueuedMessage>>;
}

/// In-memory [`QueueStore`], used as the default mirror target in tests.
#[derive(Default)]
pub struct MemoryQueueStore {
    entries: parking_lot::Mutex<std::collections::HashMap<String, QueuedMessage>>,
}

impl MemoryQueueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl QueueStore for MemoryQueueStore {
    fn put(&self, entry: &QueuedMessage) -> Result<()> {
        let key = store_key(&entry.user_id, entry.message.id);
        self.entries.lock().insert(key, entry.clone());
        Ok(())
    }

    fn delete(&self, user_id: &UserId, message_id: MessageId) -> Result<()> {
        self.entries.lock().remove(&store_key(user_id, message_id));
        Ok(())
    }

    fn load_user(&self, user_id: &UserId) -> Result<Vec<QueuedMessage>> {
        let prefix = format!("ws:queue:{}:", user_id);
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }
}
