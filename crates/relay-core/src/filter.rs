use serde::{Deserialize, Serialize};

use crate::message::{Message, Priority};

/// Declarative per-subscription filter evaluated against message payloads.
///
/// All present criteria must match; an empty filter matches everything. A
/// criterion whose payload field is missing or of the wrong type does not
/// match, so malformed payloads are filtered out rather than delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Deliver only payloads whose `symbol` field is in this set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,

    /// Deliver only payloads whose `price` field is at least this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_price: Option<f64>,

    /// Deliver only payloads whose `price` field is at most this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,

    /// Deliver only messages at or above this priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_priority: Option<Priority>,
}

impl SubscriptionFilter {
    /// Whether no criteria are set.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_none()
            && self.min_price.is_none()
            && self.max_price.is_none()
            && self.min_priority.is_none()
    }

    /// Evaluate the filter against a message.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(ref symbols) = self.symbols {
            match message.payload.get("symbol").and_then(|v| v.as_str()) {
                Some(symbol) if symbols.iter().any(|s| s == symbol) => {}
                _ => return false,
            }
        }

        if self.min_price.is_some() || self.max_price.is_some() {
            let price = match message.payload.get("price").and_then(|v| v.as_f64()) {
                Some(p) => p,
                None => return false,
            };
            if self.min_price.is_some_and(|min| price < min) {
                return false;
            }
            if self.max_price.is_some_and(|max| price > max) {
                return false;
            }
        }

        if let Some(floor) = self.min_priority {
            if message.priority() < floor {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::message::MessageDraft;
    use serde_json::json;

    fn message(payload: serde_json::Value) -> Message {
        MessageDraft::new(payload).into_message(ChannelId::new("market-data"))
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = SubscriptionFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches(&message(json!({"symbol": "AAPL"}))));
        assert!(filter.matches(&message(json!(null))));
    }

    #[test]
    fn test_symbol_filter() {
        let filter = SubscriptionFilter {
            symbols: Some(vec!["GOOGL".to_string()]),
            ..Default::default()
        };
        assert!(filter.matches(&message(json!({"symbol": "GOOGL"}))));
        assert!(!filter.matches(&message(json!({"symbol": "AAPL"}))));
        // Missing field fails the criterion instead of erroring.
        assert!(!filter.matches(&message(json!({"price": 10.0}))));
    }

    #[test]
    fn test_price_range_filter() {
        let filter = SubscriptionFilter {
            min_price: Some(100.0),
            max_price: Some(200.0),
            ..Default::default()
        };
        assert!(filter.matches(&message(json!({"price": 150.25}))));
        assert!(!filter.matches(&message(json!({"price": 99.0}))));
        assert!(!filter.matches(&message(json!({"price": 201.0}))));
        assert!(!filter.matches(&message(json!({"price": "not a number"}))));
    }

    #[test]
    fn test_priority_floor() {
        let filter = SubscriptionFilter {
            min_priority: Some(Priority::High),
            ..Default::default()
        };
        let high = MessageDraft::new(json!({}))
            .with_priority(Priority::Critical)
            .into_message(ChannelId::new("alerts"));
        let low = MessageDraft::new(json!({}))
            .with_priority(Priority::Normal)
            .into_message(ChannelId::new("alerts"));
        assert!(filter.matches(&high));
        assert!(!filter.matches(&low));
    }

    #[test]
    fn test_combined_criteria() {
        let filter = SubscriptionFilter {
            symbols: Some(vec!["AAPL".to_string()]),
            min_price: Some(100.0),
            ..Default::default()
        };
        assert!(filter.matches(&message(json!({"symbol": "AAPL", "price": 150.0}))));
        assert!(!filter.matches(&message(json!({"symbol": "AAPL", "price": 50.0}))));
        assert!(!filter.matches(&message(json!({"symbol": "GOOGL", "price": 150.0}))));
    }
}
