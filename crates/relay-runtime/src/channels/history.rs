use std::collections::VecDeque;

use relay_core::message::Message;

/// Bounded ring buffer of the most recent messages on a channel.
///
/// Post-subscribe replay and debugging only; not an offline-delivery
/// mechanism.
#[derive(Debug)]
pub struct History {
    messages: VecDeque<Message>,
    capacity: usize,
}

impl History {
    /// Create a ring bounded at `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a message, evicting the oldest at capacity.
    pub fn record(&mut self, message: Message) {
        if self.capacity == 0 {
            return;
        }
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// The last `min(n, len)` messages, oldest first.
    pub fn last(&self, n: usize) -> Vec<Message> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).cloned().collect()
    }

    /// Messages currently held.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::channel::ChannelId;
    use relay_core::message::MessageDraft;
    use serde_json::json;

    fn message(n: u64) -> Message {
        MessageDraft::new(json!({ "n": n })).into_message(ChannelId::new("test"))
    }

    #[test]
    fn test_record_and_last_in_order() {
        let mut history = History::new(10);
        for n in 0..5 {
            history.record(message(n));
        }

        assert_eq!(history.len(), 5);
        let last = history.last(3);
        assert_eq!(last.len(), 3);
        assert_eq!(last[0].payload["n"], 2);
        assert_eq!(last[2].payload["n"], 4);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let mut history = History::new(3);
        for n in 0..5 {
            history.record(message(n));
        }

        assert_eq!(history.len(), 3);
        let all = history.last(10);
        assert_eq!(all[0].payload["n"], 2);
        assert_eq!(all[2].payload["n"], 4);
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let mut history = History::new(0);
        history.record(message(1));
        assert!(history.is_empty());
    }
}
