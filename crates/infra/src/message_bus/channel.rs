//! Channel registry and per-channel statistics.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conduit_events::Envelope;

use super::BusError;

/// Per-channel delivery options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelOptions {
    /// Persist the channel definition and its undelivered envelopes in the store.
    pub persistent: bool,
    /// Delivery passes allowed before an envelope is dead-lettered.
    pub max_retries: u32,
    /// Base for linear backoff: a retry waits `retry_delay_ms * attempts`.
    pub retry_delay_ms: u64,
    /// Default TTL for envelopes that do not carry one.
    pub ttl_ms: Option<u64>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            persistent: false,
            max_retries: 3,
            retry_delay_ms: 1_000,
            ttl_ms: None,
        }
    }
}

impl ChannelOptions {
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

/// Point-in-time copy of a channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub sent: u64,
    /// Successful deliveries, counted once per subscriber.
    pub received: u64,
    pub errors: u64,
}

/// Public view of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub options: ChannelOptions,
    pub stats: ChannelStats,
    /// Envelopes waiting for a first subscriber.
    pub queued: usize,
}

#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) name: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) options: ChannelOptions,
    /// Request/reply channels; never persisted.
    pub(crate) ephemeral: bool,
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
    /// Envelopes published while the channel had no subscribers, FIFO.
    ///
    /// Also serializes "are there subscribers?" decisions between publish and
    /// subscribe so that nothing is queued after the drain.
    pub(crate) pending: tokio::sync::Mutex<VecDeque<Envelope>>,
    /// Set while a task is working through `pending`. Only read or written with the
    /// `pending` lock held; publishes append behind the backlog while it is set.
    pub(crate) draining: AtomicBool,
}

impl Channel {
    pub(crate) fn new(name: impl Into<String>, options: ChannelOptions) -> Self {
        Self::restore(name, options, Utc::now())
    }

    pub(crate) fn restore(name: impl Into<String>, options: ChannelOptions, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            created_at,
            options,
            ephemeral: false,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            pending: tokio::sync::Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub(crate) fn ephemeral(name: impl Into<String>) -> Self {
        let mut channel = Self::new(name, ChannelOptions::default().with_max_retries(1));
        channel.ephemeral = true;
        channel
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        ChannelStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.options.persistent && !self.ephemeral
    }

    pub(crate) async fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name.clone(),
            created_at: self.created_at,
            options: self.options.clone(),
            stats: self.stats(),
            queued: self.pending.lock().await.len(),
        }
    }
}

/// Persisted form of a channel definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChannelRecord {
    pub(crate) name: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) options: ChannelOptions,
}

impl From<&Channel> for ChannelRecord {
    fn from(channel: &Channel) -> Self {
        Self {
            name: channel.name.clone(),
            created_at: channel.created_at,
            options: channel.options.clone(),
        }
    }
}

/// Name → channel map. Channels are never removed implicitly.
#[derive(Debug, Default)]
pub(crate) struct ChannelRegistry {
    channels: RwLock<BTreeMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub(crate) fn create(&self, channel: Channel) -> Result<Arc<Channel>, BusError> {
        let mut map = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&channel.name) {
            return Err(BusError::ChannelExists(channel.name));
        }
        let channel = Arc::new(channel);
        map.insert(channel.name.clone(), channel.clone());
        Ok(channel)
    }

    /// Returns the channel and whether it was created by this call.
    pub(crate) fn get_or_create(&self, name: &str, options: &ChannelOptions) -> (Arc<Channel>, bool) {
        if let Some(existing) = self.get(name) {
            return (existing, false);
        }
        let mut map = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(name) {
            return (existing.clone(), false);
        }
        let channel = Arc::new(Channel::new(name, options.clone()));
        map.insert(name.to_string(), channel.clone());
        (channel, true)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Sorted channel names.
    pub(crate) fn names(&self) -> Vec<String> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
