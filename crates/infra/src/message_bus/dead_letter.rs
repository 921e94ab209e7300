//! Dead letter queue: terminal store for envelopes that exhausted their retries.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, warn};

use conduit_core::MessageId;
use conduit_events::Envelope;

use crate::storage::{KeyValueStore, StorageError};

pub(crate) const DEAD_LETTER_PREFIX: &str = "dead_letters/";

/// A dead-lettered envelope. Entries are never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub envelope: Envelope,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn id(&self) -> MessageId {
        self.envelope.id()
    }

    fn key(&self) -> String {
        format!(
            "{DEAD_LETTER_PREFIX}{:020}-{}",
            self.failed_at.timestamp_millis().max(0),
            self.envelope.id()
        )
    }
}

/// Append-only, optionally bounded. When full, the oldest entry is evicted (and its
/// persisted copy deleted) with a warning.
pub(crate) struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    capacity: Option<usize>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl DeadLetterQueue {
    pub(crate) fn new(capacity: Option<usize>, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            store,
        }
    }

    pub(crate) async fn push(&self, envelope: Envelope, error: String) {
        let entry = DeadLetterEntry {
            envelope,
            error,
            failed_at: Utc::now(),
        };
        error!(
            channel = %entry.envelope.channel(),
            envelope_id = %entry.envelope.id(),
            attempts = entry.envelope.attempts(),
            error = %entry.error,
            "envelope moved to dead letter queue"
        );

        if let Some(store) = &self.store {
            if let Err(err) = persist(store.as_ref(), &entry).await {
                // The in-memory entry still makes the envelope discoverable.
                warn!(envelope_id = %entry.envelope.id(), error = %err, "failed to persist dead letter");
            }
        }

        let mut entries = self.entries.lock().await;
        entries.push_back(entry);
        self.evict_overflow(&mut entries).await;
    }

    async fn evict_overflow(&self, entries: &mut VecDeque<DeadLetterEntry>) {
        let Some(capacity) = self.capacity else {
            return;
        };
        while entries.len() > capacity {
            let Some(evicted) = entries.pop_front() else {
                break;
            };
            warn!(
                envelope_id = %evicted.envelope.id(),
                channel = %evicted.envelope.channel(),
                capacity,
                "dead letter queue full; evicting oldest entry"
            );
            if let Some(store) = &self.store {
                if let Err(err) = store.delete(&evicted.key()).await {
                    warn!(envelope_id = %evicted.envelope.id(), error = %err, "failed to delete evicted dead letter");
                }
            }
        }
    }

    /// Entries in placement order.
    pub(crate) async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub(crate) async fn find(&self, id: MessageId) -> Option<DeadLetterEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.envelope.id() == id)
            .cloned()
    }

    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Replace the in-memory queue with the persisted entries.
    pub(crate) async fn reload(&self) -> Result<usize, StorageError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut restored = VecDeque::new();
        for key in store.list_keys(DEAD_LETTER_PREFIX).await? {
            let Some(value) = store.read(&key).await? else {
                continue;
            };
            match serde_json::from_value::<DeadLetterEntry>(value) {
                Ok(entry) => restored.push_back(entry),
                Err(err) => warn!(key = %key, error = %err, "skipping unreadable dead letter"),
            }
        }
        let count = restored.len();
        let mut entries = self.entries.lock().await;
        *entries = restored;
        self.evict_overflow(&mut entries).await;
        Ok(count)
    }
}

async fn persist(store: &dyn KeyValueStore, entry: &DeadLetterEntry) -> Result<(), StorageError> {
    let value = serde_json::to_value(entry)?;
    store.write(&entry.key(), value).await
}
