use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use conduit_core::{Aggregate, AggregateId, EventId, ExpectedVersion};
use conduit_events::{
    DomainEvent, EventSubscriber, EventTopic, NewEvent, ReplayOutcome, Snapshot, StoredEvent,
    replay_from, subscriber_fn,
};

use super::EventLogError;
use super::locks::AggregateLocks;
use super::query::{EventFilter, merge_streams, sort_by_occurred_at};
use crate::config::EventLogConfig;
use crate::storage::{InMemoryKeyValueStore, KeyValueStore};

/// Handle returned by [`EventLog::subscribe`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EventSubscriptionId(u64);

struct Registration {
    id: EventSubscriptionId,
    topic: EventTopic,
    subscriber: Arc<dyn EventSubscriber>,
}

/// Append-only, per-aggregate event log.
///
/// ## Versioning
///
/// `append` assigns `version = current + 1` while holding a per-aggregate lock, so two
/// concurrent appends to one aggregate can never observe the same current version.
/// Appends to different aggregates run concurrently.
///
/// ## Notification
///
/// After the write, subscribers registered for the event's name and for `"*"` are
/// awaited one by one in registration order. A failing subscriber is logged and skipped.
/// Notification runs while the aggregate's lock is still held, so subscribers observe
/// each aggregate's events in version order. A subscriber must therefore not append to
/// the aggregate it is being notified about.
///
/// ## Storage layout
///
/// - `{events_prefix}{aggregate_id}/{version:020}` → `StoredEvent`
/// - `{snapshots_prefix}{aggregate_id}` → `Snapshot`
pub struct EventLog {
    store: Arc<dyn KeyValueStore>,
    config: EventLogConfig,
    locks: AggregateLocks,
    /// Current version per aggregate, filled on first append or lookup. Holds one
    /// `u64` per aggregate ever touched, the same cardinality as the streams in the
    /// store; it is rebuilt from `list_keys` after a restart.
    versions: Mutex<HashMap<AggregateId, u64>>,
    subscribers: RwLock<Vec<Registration>>,
    next_subscription: AtomicU64,
}

impl EventLog {
    pub fn new(store: Arc<dyn KeyValueStore>, config: EventLogConfig) -> Self {
        Self {
            store,
            config,
            locks: AggregateLocks::default(),
            versions: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Log backed by a fresh in-memory store (tests/dev).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryKeyValueStore::new()), EventLogConfig::default())
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    fn stream_prefix(&self, aggregate_id: &AggregateId) -> String {
        format!("{}{}/", self.config.events_prefix, aggregate_id)
    }

    fn event_key(&self, aggregate_id: &AggregateId, version: u64) -> String {
        format!("{}{:020}", self.stream_prefix(aggregate_id), version)
    }

    fn snapshot_key(&self, aggregate_id: &AggregateId) -> String {
        format!("{}{}", self.config.snapshots_prefix, aggregate_id)
    }

    // ---------------------------------------------------------------------
    // Append
    // ---------------------------------------------------------------------

    /// Append an event at the next version of its aggregate.
    pub async fn append(&self, event: NewEvent) -> Result<StoredEvent, EventLogError> {
        self.append_expected(event, ExpectedVersion::Any).await
    }

    /// Append an event only if the aggregate is at the expected version.
    #[instrument(
        skip(self, event),
        fields(event_name = %event.event_name, aggregate_id = %event.aggregate_id),
        err
    )]
    pub async fn append_expected(
        &self,
        event: NewEvent,
        expected: ExpectedVersion,
    ) -> Result<StoredEvent, EventLogError> {
        event
            .validate()
            .map_err(|e| EventLogError::InvalidEvent(e.to_string()))?;

        let NewEvent {
            event_name,
            aggregate_id,
            occurred_at,
            payload,
        } = event;
        let (Some(occurred_at), Some(payload)) = (occurred_at, payload) else {
            return Err(EventLogError::InvalidEvent(
                "occurredAt and payload are required".to_string(),
            ));
        };

        let _guard = self.locks.acquire(&aggregate_id).await;

        let current = self.load_current_version(&aggregate_id).await?;
        if !expected.matches(current) {
            return Err(EventLogError::Concurrency {
                aggregate_id,
                expected,
                actual: current,
            });
        }

        let stored = StoredEvent {
            event_id: EventId::new(),
            event_name,
            aggregate_id,
            version: current + 1,
            occurred_at,
            stored_at: Utc::now(),
            payload,
        };

        let key = self.event_key(&stored.aggregate_id, stored.version);
        self.store.write(&key, serde_json::to_value(&stored)?).await?;
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stored.aggregate_id.clone(), stored.version);

        debug!(version = stored.version, event_id = %stored.event_id, "event appended");

        self.notify(&stored).await;
        Ok(stored)
    }

    /// Current version of an aggregate (0 when it has no events).
    pub async fn current_version(&self, aggregate_id: &AggregateId) -> Result<u64, EventLogError> {
        self.load_current_version(aggregate_id).await
    }

    async fn load_current_version(&self, aggregate_id: &AggregateId) -> Result<u64, EventLogError> {
        if let Some(v) = self
            .versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(aggregate_id)
        {
            return Ok(*v);
        }

        let versions = self.stream_versions(aggregate_id).await?;
        let current = versions.last().map(|(v, _)| *v).unwrap_or(0);
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(aggregate_id.clone())
            .or_insert(current);
        Ok(current)
    }

    /// `(version, key)` pairs of one stream, ascending.
    ///
    /// Keys of other aggregates sharing the prefix (ids containing `/`) are skipped
    /// because their suffix is not a bare version number.
    async fn stream_versions(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<(u64, String)>, EventLogError> {
        let prefix = self.stream_prefix(aggregate_id);
        let keys = self.store.list_keys(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                let version = key[prefix.len()..].parse::<u64>().ok()?;
                Some((version, key))
            })
            .collect())
    }

    async fn read_event(&self, key: &str) -> Result<Option<StoredEvent>, EventLogError> {
        match self.store.read(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Events of one aggregate with `version > from_version`, ascending by version.
    pub async fn get_events(
        &self,
        aggregate_id: &AggregateId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        let mut events = Vec::new();
        for (version, key) in self.stream_versions(aggregate_id).await? {
            if version <= from_version {
                continue;
            }
            if let Some(event) = self.read_event(&key).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Cross-aggregate scan, ordered by `occurred_at` ascending.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, EventLogError> {
        let mut events = self.scan(filter).await?;
        sort_by_occurred_at(&mut events);
        Ok(events)
    }

    /// Cross-aggregate scan in replay order: ascending `occurred_at` between
    /// aggregates, ascending version within each aggregate even when a later event
    /// carries an earlier `occurred_at`. Projection rebuilds read through this.
    pub async fn query_for_rebuild(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, EventLogError> {
        Ok(merge_streams(self.scan(filter).await?))
    }

    async fn scan(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, EventLogError> {
        let mut events = match &filter.aggregate_id {
            Some(id) => self.get_events(id, 0).await?,
            None => {
                let keys = self.store.list_keys(&self.config.events_prefix).await?;
                let mut all = Vec::with_capacity(keys.len());
                for key in keys {
                    if let Some(event) = self.read_event(&key).await? {
                        all.push(event);
                    }
                }
                all
            }
        };
        events.retain(|e| filter.matches(e));
        Ok(events)
    }

    pub async fn get_events_by_name(&self, event_name: &str) -> Result<Vec<StoredEvent>, EventLogError> {
        self.query(&EventFilter::named(event_name)).await
    }

    /// Events with `start <= occurred_at <= end`.
    pub async fn get_events_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        self.query(&EventFilter::between(start, end)).await
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Store folded state at `version`, replacing any previous snapshot.
    pub async fn save_snapshot(
        &self,
        aggregate_id: &AggregateId,
        state: JsonValue,
        version: u64,
    ) -> Result<Snapshot, EventLogError> {
        let current = self.load_current_version(aggregate_id).await?;
        if version > current {
            return Err(EventLogError::InvalidSnapshot(format!(
                "snapshot version {version} is ahead of '{aggregate_id}' (current: {current})"
            )));
        }

        let snapshot = Snapshot {
            aggregate_id: aggregate_id.clone(),
            state,
            version,
            created_at: Utc::now(),
        };
        self.store
            .write(&self.snapshot_key(aggregate_id), serde_json::to_value(&snapshot)?)
            .await?;
        debug!(aggregate_id = %aggregate_id, version, "snapshot saved");
        Ok(snapshot)
    }

    /// Typed variant of [`EventLog::save_snapshot`].
    pub async fn save_state<S: Serialize>(
        &self,
        aggregate_id: &AggregateId,
        state: &S,
        version: u64,
    ) -> Result<Snapshot, EventLogError> {
        self.save_snapshot(aggregate_id, serde_json::to_value(state)?, version)
            .await
    }

    pub async fn get_snapshot(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>, EventLogError> {
        match self.store.read(&self.snapshot_key(aggregate_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Drop the snapshot; the next replay starts from zero.
    pub async fn delete_snapshot(&self, aggregate_id: &AggregateId) -> Result<bool, EventLogError> {
        Ok(self.store.delete(&self.snapshot_key(aggregate_id)).await?)
    }

    // ---------------------------------------------------------------------
    // Replay
    // ---------------------------------------------------------------------

    /// Fold `reducer` over the aggregate's history, starting from its snapshot (or
    /// `initial` when there is none).
    pub async fn replay<S, F>(
        &self,
        aggregate_id: &AggregateId,
        initial: S,
        reducer: F,
    ) -> Result<S, EventLogError>
    where
        S: DeserializeOwned + Send,
        F: FnMut(S, &StoredEvent) -> S + Send,
    {
        Ok(self.replay_outcome(aggregate_id, initial, reducer).await?.state)
    }

    /// Like [`EventLog::replay`], also reporting the version reached.
    pub async fn replay_outcome<S, F>(
        &self,
        aggregate_id: &AggregateId,
        initial: S,
        reducer: F,
    ) -> Result<ReplayOutcome<S>, EventLogError>
    where
        S: DeserializeOwned + Send,
        F: FnMut(S, &StoredEvent) -> S + Send,
    {
        let (base, base_version) = match self.get_snapshot(aggregate_id).await? {
            Some(snapshot) => (serde_json::from_value(snapshot.state)?, snapshot.version),
            None => (initial, 0),
        };
        let events = self.get_events(aggregate_id, base_version).await?;
        Ok(replay_from(base, base_version, &events, reducer)?)
    }

    /// Replay, then store a snapshot if `snapshot_every` events were folded on top of
    /// the previous one.
    pub async fn replay_and_snapshot<S, F>(
        &self,
        aggregate_id: &AggregateId,
        initial: S,
        reducer: F,
    ) -> Result<ReplayOutcome<S>, EventLogError>
    where
        S: Serialize + DeserializeOwned + Send,
        F: FnMut(S, &StoredEvent) -> S + Send,
    {
        let outcome = self.replay_outcome(aggregate_id, initial, reducer).await?;
        if let Some(every) = self.config.snapshot_every {
            if outcome.events_applied as u64 >= every {
                self.save_state(aggregate_id, &outcome.state, outcome.version)
                    .await?;
            }
        }
        Ok(outcome)
    }

    /// Rehydrate a typed aggregate.
    pub async fn load_aggregate<A>(&self, aggregate_id: &AggregateId) -> Result<ReplayOutcome<A>, EventLogError>
    where
        A: Aggregate<Event = StoredEvent>,
    {
        self.replay_outcome(aggregate_id, A::default(), |state: A, event| state.apply(event))
            .await
    }

    // ---------------------------------------------------------------------
    // Subscribers
    // ---------------------------------------------------------------------

    /// Register a notification handler for an event name, or `"*"` for every event.
    pub fn subscribe<S>(&self, topic: impl Into<EventTopic>, subscriber: S) -> EventSubscriptionId
    where
        S: EventSubscriber,
    {
        let id = EventSubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let topic = topic.into();
        debug!(subscription = id.0, topic = %topic, "event subscriber registered");
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                topic,
                subscriber: Arc::new(subscriber),
            });
        id
    }

    /// Register a handler for a typed event; the payload is decoded before the call.
    pub fn subscribe_typed<E, F, Fut>(&self, handler: F) -> EventSubscriptionId
    where
        E: DomainEvent,
        F: Fn(StoredEvent, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(
            E::NAME,
            subscriber_fn(move |event: StoredEvent| {
                let call = event
                    .decode::<E>()
                    .map(|decoded| handler(event.clone(), decoded));
                async move {
                    match call {
                        Ok(fut) => fut.await,
                        Err(e) => Err(anyhow::Error::new(e)
                            .context(format!("failed to decode '{}' payload", E::NAME))),
                    }
                }
            }),
        )
    }

    pub fn unsubscribe(&self, id: EventSubscriptionId) -> bool {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|r| r.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn notify(&self, event: &StoredEvent) {
        let targets: Vec<(EventSubscriptionId, Arc<dyn EventSubscriber>)> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.topic.matches(&event.event_name))
            .map(|r| (r.id, r.subscriber.clone()))
            .collect();

        for (id, subscriber) in targets {
            if let Err(err) = subscriber.on_event(event).await {
                warn!(
                    subscription = id.0,
                    event_name = %event.event_name,
                    aggregate_id = %event.aggregate_id,
                    version = event.version,
                    error = ?err,
                    "event subscriber failed"
                );
            }
        }
    }
}

impl core::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventLog")
            .field("config", &self.config)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
