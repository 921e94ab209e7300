use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use conduit_core::AggregateId;

/// One async mutex per aggregate id.
///
/// Appends to the same aggregate queue up behind each other; appends to different
/// aggregates never contend. The guard may be held across awaits (storage writes,
/// subscriber notification); the outer map lock never is.
///
/// An entry lives only while a guard for it is held or awaited, so the map is bounded
/// by the number of in-flight appends.
#[derive(Debug, Default)]
pub(crate) struct AggregateLocks {
    inner: Mutex<HashMap<AggregateId, Arc<AsyncMutex<()>>>>,
}

impl AggregateLocks {
    pub(crate) async fn acquire(&self, aggregate_id: &AggregateId) -> AggregateGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(aggregate_id.clone()).or_default().clone()
        };
        AggregateGuard {
            locks: self,
            aggregate_id: aggregate_id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn release(&self, aggregate_id: &AggregateId) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters clone the Arc under this map lock, so a count of 1 means nobody
        // else holds or waits for it.
        if map.get(aggregate_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(aggregate_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Held for the duration of one append.
pub(crate) struct AggregateGuard<'a> {
    locks: &'a AggregateLocks,
    aggregate_id: AggregateId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AggregateGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex (and its Arc) before checking whether the entry is idle.
        drop(self.guard.take());
        self.locks.release(&self.aggregate_id);
    }
}
