//! Per-channel subscriber table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value as JsonValue;

use conduit_events::{MessageFilter, MessageHandler, SubscribeOptions};

pub(crate) struct Subscription {
    pub(crate) channel: String,
    pub(crate) subscriber_id: String,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) filter: Option<MessageFilter>,
    pub(crate) is_async: bool,
    pub(crate) priority: i32,
    message_count: AtomicU64,
}

impl Subscription {
    pub(crate) fn new(
        channel: impl Into<String>,
        subscriber_id: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Self {
        Self {
            channel: channel.into(),
            subscriber_id: subscriber_id.into(),
            handler,
            filter: options.filter,
            is_async: options.is_async,
            priority: options.priority,
            message_count: AtomicU64::new(0),
        }
    }

    /// `false` when a filter rejects the payload.
    pub(crate) fn accepts(&self, payload: &JsonValue) -> bool {
        self.filter.as_ref().is_none_or(|f| f(payload))
    }

    pub(crate) fn record_delivery(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            channel: self.channel.clone(),
            subscriber_id: self.subscriber_id.clone(),
            is_async: self.is_async,
            priority: self.priority,
            has_filter: self.filter.is_some(),
            message_count: self.message_count.load(Ordering::Relaxed),
        }
    }
}

/// Public view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub channel: String,
    pub subscriber_id: String,
    pub is_async: bool,
    pub priority: i32,
    pub has_filter: bool,
    /// Successful deliveries to this subscriber.
    pub message_count: u64,
}

/// `(channel, subscriber_id)` is unique. Subscribing again with the same id replaces
/// the handler and options but keeps the original subscription position.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    by_channel: RwLock<HashMap<String, Vec<Arc<Subscription>>>>,
}

impl SubscriptionTable {
    pub(crate) fn insert(&self, subscription: Subscription) -> Arc<Subscription> {
        let subscription = Arc::new(subscription);
        let mut map = self.by_channel.write().unwrap_or_else(PoisonError::into_inner);
        let subs = map.entry(subscription.channel.clone()).or_default();
        match subs
            .iter_mut()
            .find(|s| s.subscriber_id == subscription.subscriber_id)
        {
            Some(slot) => *slot = subscription.clone(),
            None => subs.push(subscription.clone()),
        }
        subscription
    }

    pub(crate) fn remove(&self, channel: &str, subscriber_id: &str) -> bool {
        let mut map = self.by_channel.write().unwrap_or_else(PoisonError::into_inner);
        let Some(subs) = map.get_mut(channel) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.subscriber_id != subscriber_id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            map.remove(channel);
        }
        removed
    }

    pub(crate) fn remove_channel(&self, channel: &str) -> usize {
        self.by_channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel)
            .map_or(0, |subs| subs.len())
    }

    /// Subscribers in delivery order: priority descending, ties in subscription order.
    pub(crate) fn ordered(&self, channel: &str) -> Vec<Arc<Subscription>> {
        let mut subs = self
            .by_channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
            .unwrap_or_default();
        // `sort_by_key` is stable.
        subs.sort_by_key(|s| std::cmp::Reverse(s.priority));
        subs
    }

    pub(crate) fn count(&self, channel: &str) -> usize {
        self.by_channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }

    pub(crate) fn info(&self, channel: &str) -> Vec<SubscriptionInfo> {
        self.ordered(channel).iter().map(|s| s.info()).collect()
    }
}
