//! In-process asynchronous message bus.
//!
//! Channel-based publish/subscribe with priority delivery, retry with linear backoff,
//! dead-lettering, request/reply and topic fan-out. The bus is an explicit instance:
//! build it once, `start()` it, hand clones to consumers, `stop()` it on shutdown.
//!
//! ## Guarantees
//!
//! - **At-least-once** per subscriber: a retried envelope may reach a handler again.
//! - Per-publish delivery follows subscriber priority; there is no ordering across
//!   channels or across concurrent publishes.
//! - A publish that exhausts its retries always leaves an entry in the dead letter
//!   queue.
//!
//! Handlers that capture a clone of the bus keep it alive; derived channels created by
//! [`MessageBus::filter`] and [`MessageBus::map`] hold a weak reference instead.

mod channel;
mod dead_letter;
mod delivery;
mod subscription;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use conduit_core::{CorrelationId, MessageId};
use conduit_events::{
    Envelope, MessageHandler, Middleware, PublishOptions, SubscribeOptions, TopicPattern, handler_fn,
};

use crate::config::BusConfig;
use crate::storage::{KeyValueStore, StorageError};

pub use channel::{ChannelInfo, ChannelOptions, ChannelStats};
pub use dead_letter::DeadLetterEntry;
pub use delivery::DeliveryError;
pub use subscription::SubscriptionInfo;

use channel::{Channel, ChannelRecord, ChannelRegistry};
use dead_letter::DeadLetterQueue;
use delivery::{DeliveryEngine, MESSAGE_PREFIX, message_key};
use subscription::{Subscription, SubscriptionTable};

const CHANNEL_PREFIX: &str = "channels/";
const REPLY_CHANNEL_PREFIX: &str = "reply_";
const REPLY_SUBSCRIBER: &str = "request-reply";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("channel '{0}' already exists")]
    ChannelExists(String),

    #[error("channel '{0}' not found")]
    ChannelNotFound(String),

    #[error("request on '{channel}' timed out after {timeout_ms}ms")]
    RequestTimeout { channel: String, timeout_ms: u64 },

    #[error("middleware rejected publish to '{channel}': {reason}")]
    Middleware { channel: String, reason: String },

    #[error("message bus is not running")]
    Stopped,

    #[error("dead letter '{0}' not found")]
    DeadLetterNotFound(MessageId),

    #[error("envelope '{0}' has no reply address")]
    MissingReplyTo(MessageId),

    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidTopic { pattern: String, reason: String },

    #[error("bus storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("bus serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of one channel in a fan-out. Channels succeed or fail independently.
#[derive(Debug)]
pub struct FanoutResult {
    pub channel: String,
    pub result: Result<MessageId, BusError>,
}

impl FanoutResult {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.result.as_ref().ok().copied()
    }
}

/// Returned by [`MessageBus::subscribe`]. Dropping it does **not** unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    channel: String,
    subscriber_id: String,
    bus: Weak<BusInner>,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Returns whether the subscription still existed.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.subscriptions.remove(&self.channel, &self.subscriber_id),
            None => false,
        }
    }
}

struct BusInner {
    config: BusConfig,
    channels: Arc<ChannelRegistry>,
    subscriptions: Arc<SubscriptionTable>,
    dead_letters: Arc<DeadLetterQueue>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    engine: DeliveryEngine,
    store: Option<Arc<dyn KeyValueStore>>,
    restored: AtomicBool,
}

impl core::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.config)
            .field("channels", &self.channels.names())
            .field("running", &self.engine.is_running())
            .finish()
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.engine.cancel_all();
    }
}

/// Cloneable handle to one bus instance.
#[derive(Debug, Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// In-memory bus: nothing is persisted.
    pub fn new(config: BusConfig) -> Self {
        Self::build(config, None)
    }

    /// Bus backed by a key/value store: definitions and undelivered envelopes of
    /// persistent channels and dead letters survive a restart.
    pub fn with_store(config: BusConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: BusConfig, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        let channels = Arc::new(ChannelRegistry::default());
        let subscriptions = Arc::new(SubscriptionTable::default());
        let dead_letters = Arc::new(DeadLetterQueue::new(config.dead_letter_capacity, store.clone()));
        let engine = DeliveryEngine::new(
            channels.clone(),
            subscriptions.clone(),
            dead_letters.clone(),
            store.clone(),
        );
        Self {
            inner: Arc::new(BusInner {
                config,
                channels,
                subscriptions,
                dead_letters,
                middlewares: RwLock::new(Vec::new()),
                engine,
                store,
                restored: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.engine.is_running()
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Start accepting publishes. With a store attached, persisted channels, their
    /// undelivered envelopes and the dead letter queue are reloaded on the first start.
    /// Queued envelopes of channels that already have subscribers are delivered.
    pub async fn start(&self) -> Result<(), BusError> {
        if self.is_running() {
            debug!("message bus already running");
            return Ok(());
        }
        if let Some(store) = &self.inner.store {
            if !self.inner.restored.swap(true, Ordering::SeqCst) {
                let channels = self.reload_channels(store.as_ref()).await?;
                let queued = self.reload_messages(store.as_ref()).await?;
                let dead = self.inner.dead_letters.reload().await?;
                info!(channels, queued, dead_letters = dead, "message bus state restored");
            }
        }
        self.inner.engine.set_running(true);
        info!("message bus started");
        self.flush_pending().await;
        Ok(())
    }

    async fn flush_pending(&self) {
        for channel in self.inner.channels.all() {
            self.drain_pending(&channel).await;
        }
    }

    /// Deliver the channel's backlog in FIFO order.
    ///
    /// Only one task drains a channel at a time. Publishes that arrive meanwhile are
    /// appended behind the backlog and picked up by the same loop, so a fresh envelope
    /// never overtakes an older queued one. Nothing is drained while the bus is
    /// stopped or the channel has no subscribers; `start()` and the next `subscribe`
    /// resume it.
    async fn drain_pending(&self, channel: &Arc<Channel>) {
        {
            let pending = channel.pending.lock().await;
            if pending.is_empty()
                || !self.is_running()
                || self.inner.subscriptions.count(&channel.name) == 0
                || channel.draining.swap(true, Ordering::SeqCst)
            {
                return;
            }
        }
        self.drain_loop(channel).await;
    }

    /// Caller must have set `channel.draining`.
    async fn drain_loop(&self, channel: &Arc<Channel>) {
        let mut delivered = 0usize;
        loop {
            let next = {
                let mut pending = channel.pending.lock().await;
                let stalled = !self.is_running() || self.inner.subscriptions.count(&channel.name) == 0;
                match pending.pop_front() {
                    Some(envelope) if !stalled => envelope,
                    Some(envelope) => {
                        pending.push_front(envelope);
                        channel.draining.store(false, Ordering::SeqCst);
                        debug!(channel = %channel.name, delivered, left = pending.len(), "drain paused");
                        return;
                    }
                    None => {
                        channel.draining.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            };
            self.inner.engine.deliver(channel.clone(), next, None).await;
            delivered += 1;
        }
        if delivered > 0 {
            debug!(channel = %channel.name, delivered, "backlog drained");
        }
    }

    /// Stop accepting publishes and cancel scheduled retries and detached handlers.
    pub fn stop(&self) {
        self.inner.engine.set_running(false);
        let cancelled = self.inner.engine.cancel_all();
        info!(cancelled_tasks = cancelled, "message bus stopped");
    }

    fn ensure_running(&self) -> Result<(), BusError> {
        if self.is_running() { Ok(()) } else { Err(BusError::Stopped) }
    }

    async fn reload_channels(&self, store: &dyn KeyValueStore) -> Result<usize, BusError> {
        let mut restored = 0;
        for key in store.list_keys(CHANNEL_PREFIX).await? {
            let Some(value) = store.read(&key).await? else {
                continue;
            };
            let record: ChannelRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unreadable channel definition");
                    continue;
                }
            };
            let channel = Channel::restore(record.name, record.options, record.created_at);
            if self.inner.channels.create(channel).is_ok() {
                restored += 1;
            }
        }
        Ok(restored)
    }

    async fn reload_messages(&self, store: &dyn KeyValueStore) -> Result<usize, BusError> {
        let mut restored = 0;
        for key in store.list_keys(MESSAGE_PREFIX).await? {
            let Some(value) = store.read(&key).await? else {
                continue;
            };
            let envelope: Envelope = match serde_json::from_value(value) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unreadable envelope");
                    continue;
                }
            };
            let Some(channel) = self.inner.channels.get(envelope.channel()) else {
                warn!(key = %key, channel = %envelope.channel(), "envelope for unknown channel; skipping");
                continue;
            };
            channel.pending.lock().await.push_back(envelope);
            restored += 1;
        }
        Ok(restored)
    }

    async fn persist_channel(&self, channel: &Channel) -> Result<(), BusError> {
        if !channel.is_persistent() {
            return Ok(());
        }
        if let Some(store) = &self.inner.store {
            let record = serde_json::to_value(ChannelRecord::from(channel))?;
            store.write(&format!("{CHANNEL_PREFIX}{}", channel.name), record).await?;
        }
        Ok(())
    }

    async fn channel_or_create(&self, name: &str) -> Result<Arc<Channel>, BusError> {
        let (channel, created) = self
            .inner
            .channels
            .get_or_create(name, &self.inner.config.default_channel_options);
        if created {
            debug!(channel = %name, "channel created implicitly");
            self.persist_channel(&channel).await?;
        }
        Ok(channel)
    }

    // ---------------------------------------------------------------------
    // Channels
    // ---------------------------------------------------------------------

    /// Create a channel explicitly.
    pub async fn create_channel(&self, name: &str, options: ChannelOptions) -> Result<ChannelInfo, BusError> {
        let channel = self.inner.channels.create(Channel::new(name, options))?;
        self.persist_channel(&channel).await?;
        info!(channel = %name, persistent = channel.options.persistent, "channel created");
        Ok(channel.info().await)
    }

    pub async fn get_channel(&self, name: &str) -> Option<ChannelInfo> {
        match self.inner.channels.get(name) {
            Some(channel) => Some(channel.info().await),
            None => None,
        }
    }

    /// Sorted channel names, including ephemeral reply channels.
    pub fn channel_names(&self) -> Vec<String> {
        self.inner.channels.names()
    }

    /// Remove a channel, its subscriptions and its queued envelopes.
    pub async fn delete_channel(&self, name: &str) -> Result<(), BusError> {
        let channel = self
            .inner
            .channels
            .remove(name)
            .ok_or_else(|| BusError::ChannelNotFound(name.to_string()))?;
        let subscribers = self.inner.subscriptions.remove_channel(name);
        let dropped = {
            let mut pending = channel.pending.lock().await;
            let n = pending.len();
            pending.clear();
            n
        };
        if let Some(store) = &self.inner.store {
            store.delete(&format!("{CHANNEL_PREFIX}{name}")).await?;
            for key in store.list_keys(&format!("{MESSAGE_PREFIX}{name}/")).await? {
                store.delete(&key).await?;
            }
        }
        info!(channel = %name, subscribers, dropped_envelopes = dropped, "channel deleted");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Subscribe `handler` to `channel` (created if missing). Envelopes queued while
    /// the channel had no subscribers are delivered FIFO before this returns. On a
    /// stopped bus they stay queued until `start()`.
    ///
    /// Subscribing again with the same `subscriber_id` replaces the handler.
    pub async fn subscribe<H>(
        &self,
        channel: &str,
        subscriber_id: impl Into<String>,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BusError>
    where
        H: MessageHandler,
    {
        let channel = self.channel_or_create(channel).await?;
        let subscriber_id = subscriber_id.into();
        let subscription = Subscription::new(&channel.name, subscriber_id.clone(), Arc::new(handler), options);

        let queued = {
            let pending = channel.pending.lock().await;
            self.inner.subscriptions.insert(subscription);
            pending.len()
        };
        debug!(
            channel = %channel.name,
            subscriber_id = %subscriber_id,
            queued,
            "subscribed"
        );
        self.drain_pending(&channel).await;

        Ok(SubscriptionHandle {
            channel: channel.name.clone(),
            subscriber_id,
            bus: Arc::downgrade(&self.inner),
        })
    }

    pub fn unsubscribe(&self, channel: &str, subscriber_id: &str) -> bool {
        let removed = self.inner.subscriptions.remove(channel, subscriber_id);
        if removed {
            debug!(channel = %channel, subscriber_id = %subscriber_id, "unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner.subscriptions.count(channel)
    }

    /// Subscriptions of a channel in delivery order.
    pub fn subscriptions(&self, channel: &str) -> Vec<SubscriptionInfo> {
        self.inner.subscriptions.info(channel)
    }

    // ---------------------------------------------------------------------
    // Publishing
    // ---------------------------------------------------------------------

    /// Append a middleware to the publish pipeline. Middlewares run in registration
    /// order on every publish.
    pub fn use_middleware<M: Middleware>(&self, middleware: M) {
        self.inner
            .middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(middleware));
    }

    fn run_middlewares(&self, channel: &str, payload: JsonValue) -> Result<JsonValue, BusError> {
        let middlewares = self
            .inner
            .middlewares
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        middlewares
            .iter()
            .try_fold(payload, |payload, m| m.process(channel, payload))
            .map_err(|err| BusError::Middleware {
                channel: channel.to_string(),
                reason: format!("{err:#}"),
            })
    }

    /// Publish `payload` on `channel` (created if missing) and return the envelope id.
    ///
    /// Awaits non-detached subscribers. Subscriber failures are retried in the
    /// background and never returned here.
    #[instrument(skip(self, payload, options), err)]
    pub async fn publish(
        &self,
        channel: &str,
        payload: JsonValue,
        options: PublishOptions,
    ) -> Result<MessageId, BusError> {
        self.ensure_running()?;
        let channel = self.channel_or_create(channel).await?;
        self.publish_on(channel, payload, options).await
    }

    async fn publish_on(
        &self,
        channel: Arc<Channel>,
        payload: JsonValue,
        options: PublishOptions,
    ) -> Result<MessageId, BusError> {
        let payload = self.run_middlewares(&channel.name, payload)?;
        let mut envelope = Envelope::new(&channel.name, payload, options);
        envelope.apply_default_ttl(channel.options.ttl_ms);
        let id = envelope.id();

        if channel.is_persistent() {
            if let Some(store) = &self.inner.store {
                store.write(&message_key(&envelope), serde_json::to_value(&envelope)?).await?;
            }
        }
        channel.record_sent();

        let envelope = {
            let mut pending = channel.pending.lock().await;
            if self.inner.subscriptions.count(&channel.name) == 0 {
                debug!(channel = %channel.name, envelope_id = %id, "no subscribers; envelope queued");
                pending.push_back(envelope);
                return Ok(id);
            }
            if pending.is_empty() && !channel.draining.load(Ordering::SeqCst) {
                Some(envelope)
            } else {
                // A backlog is ahead of this envelope; keep FIFO by queueing behind it.
                pending.push_back(envelope);
                None
            }
        };

        match envelope {
            Some(envelope) => self.inner.engine.deliver(channel, envelope, None).await,
            None => self.drain_pending(&channel).await,
        }
        Ok(id)
    }

    /// Publish to every channel independently. One channel's failure does not affect
    /// the others.
    pub async fn fanout<I, S>(&self, channels: I, payload: JsonValue) -> Vec<FanoutResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let publishes = channels.into_iter().map(Into::into).map(|channel: String| {
            let payload = payload.clone();
            async move {
                let result = self.publish(&channel, payload, PublishOptions::new()).await;
                FanoutResult { channel, result }
            }
        });
        join_all(publishes).await
    }

    /// Fan out to every known channel whose name matches the glob `pattern`.
    /// Ephemeral reply channels are never matched.
    pub async fn publish_to_topic(&self, pattern: &str, payload: JsonValue) -> Result<Vec<FanoutResult>, BusError> {
        let topic = TopicPattern::new(pattern).map_err(|err| BusError::InvalidTopic {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        let names = self.inner.channels.names();
        let targets: Vec<String> = topic
            .filter(names.iter().map(String::as_str))
            .into_iter()
            .filter(|name| !name.starts_with(REPLY_CHANNEL_PREFIX))
            .map(str::to_string)
            .collect();
        debug!(pattern, matched = targets.len(), "publishing to topic");
        Ok(self.fanout(targets, payload).await)
    }

    // ---------------------------------------------------------------------
    // Request / reply
    // ---------------------------------------------------------------------

    /// Publish `payload` and wait for the first reply on an ephemeral
    /// `reply_<correlation id>` channel. The reply subscription and channel are removed
    /// whether a reply arrives or the request times out.
    pub async fn request(&self, channel: &str, payload: JsonValue, timeout: Duration) -> Result<Envelope, BusError> {
        self.ensure_running()?;
        let correlation_id = CorrelationId::new();
        let reply_channel = format!("{REPLY_CHANNEL_PREFIX}{correlation_id}");
        self.inner.channels.create(Channel::ephemeral(&reply_channel))?;

        let (tx, rx) = oneshot::channel::<Envelope>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let on_reply = handler_fn(move |envelope: Envelope| {
            let slot = slot.clone();
            async move {
                if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(envelope);
                }
                anyhow::Ok(())
            }
        });
        let subscribed = self
            .subscribe(&reply_channel, REPLY_SUBSCRIBER, on_reply, SubscribeOptions::new())
            .await;
        if let Err(err) = subscribed {
            self.inner.channels.remove(&reply_channel);
            return Err(err);
        }

        // The publish runs as its own task so that a timeout never cancels delivery to
        // the remaining subscribers.
        let bus = self.clone();
        let target = channel.to_string();
        let options = PublishOptions::new().with_reply(correlation_id, reply_channel.clone());
        let publish = tokio::spawn(async move { bus.publish(&target, payload, options).await });

        let outcome = tokio::time::timeout(timeout, async {
            match publish.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(BusError::Stopped),
            }
            rx.await.map_err(|_| BusError::Stopped)
        })
        .await;

        self.inner.subscriptions.remove(&reply_channel, REPLY_SUBSCRIBER);
        self.inner.channels.remove(&reply_channel);

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(channel = %channel, correlation_id = %correlation_id, timeout_ms, "request timed out");
                Err(BusError::RequestTimeout {
                    channel: channel.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// [`MessageBus::request`] with the configured default timeout.
    pub async fn request_default(&self, channel: &str, payload: JsonValue) -> Result<Envelope, BusError> {
        self.request(channel, payload, self.inner.config.request_timeout).await
    }

    /// Answer a request envelope. Returns `None` when the requester has already given
    /// up (its reply channel is gone).
    pub async fn reply(&self, request: &Envelope, payload: JsonValue) -> Result<Option<MessageId>, BusError> {
        self.ensure_running()?;
        let reply_to = request.reply_to().ok_or(BusError::MissingReplyTo(request.id()))?;
        let Some(channel) = self.inner.channels.get(reply_to) else {
            debug!(reply_to, envelope_id = %request.id(), "reply channel gone; dropping reply");
            return Ok(None);
        };
        let mut options = PublishOptions::new();
        if let Some(correlation_id) = request.correlation_id() {
            options = options.with_correlation_id(correlation_id);
        }
        self.publish_on(channel, payload, options).await.map(Some)
    }

    // ---------------------------------------------------------------------
    // Derived channels
    // ---------------------------------------------------------------------

    /// Forward every message of `source` accepted by `predicate` to `target`.
    pub async fn filter<F>(&self, source: &str, target: &str, predicate: F) -> Result<SubscriptionHandle, BusError>
    where
        F: Fn(&JsonValue) -> bool + Send + Sync + 'static,
    {
        self.derive(source, target, "filter", SubscribeOptions::new().with_filter(predicate), |p| p)
            .await
    }

    /// Forward every message of `source` to `target` after applying `transform`.
    pub async fn map<F>(&self, source: &str, target: &str, transform: F) -> Result<SubscriptionHandle, BusError>
    where
        F: Fn(JsonValue) -> JsonValue + Send + Sync + 'static,
    {
        self.derive(source, target, "map", SubscribeOptions::new(), transform)
            .await
    }

    async fn derive<F>(
        &self,
        source: &str,
        target: &str,
        kind: &str,
        options: SubscribeOptions,
        transform: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        F: Fn(JsonValue) -> JsonValue + Send + Sync + 'static,
    {
        if self.inner.channels.get(source).is_none() {
            return Err(BusError::ChannelNotFound(source.to_string()));
        }
        self.channel_or_create(target).await?;

        let weak = Arc::downgrade(&self.inner);
        let transform = Arc::new(transform);
        let target_name = target.to_string();
        let source_name = source.to_string();
        let forward = handler_fn(move |envelope: Envelope| {
            let weak = weak.clone();
            let transform = transform.clone();
            let target = target_name.clone();
            let source = source_name.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return anyhow::Ok(());
                };
                let bus = MessageBus { inner };
                let payload = transform(envelope.into_payload());
                bus.publish(&target, payload, PublishOptions::new().with_publisher(source))
                    .await?;
                anyhow::Ok(())
            }
        });

        let subscriber_id = format!("{kind}->{target}");
        self.subscribe(source, subscriber_id, forward, options).await
    }

    // ---------------------------------------------------------------------
    // Dead letters
    // ---------------------------------------------------------------------

    /// Dead letter entries in placement order.
    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner.dead_letters.entries().await
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.inner.dead_letters.len().await
    }

    /// Publish a dead-lettered payload again as a new envelope with a fresh attempt
    /// budget. The entry itself stays in the queue.
    pub async fn redeliver_dead_letter(&self, id: MessageId) -> Result<MessageId, BusError> {
        let entry = self
            .inner
            .dead_letters
            .find(id)
            .await
            .ok_or(BusError::DeadLetterNotFound(id))?;
        let metadata = entry.envelope.metadata();
        let mut options = PublishOptions::new().with_priority(metadata.priority);
        if let Some(publisher) = &metadata.publisher {
            options = options.with_publisher(publisher.clone());
        }
        options.correlation_id = metadata.correlation_id;
        options.reply_to = metadata.reply_to.clone();

        let channel = entry.envelope.channel().to_string();
        let new_id = self.publish(&channel, entry.envelope.into_payload(), options).await?;
        info!(channel = %channel, dead_letter = %id, envelope_id = %new_id, "dead letter redelivered");
        Ok(new_id)
    }
}
