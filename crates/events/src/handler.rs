use std::collections::BTreeMap;

use crate::{DomainEvent, ProjectionError, StoredEvent};

type ErasedHandler<S> = Box<dyn Fn(&S, &StoredEvent) -> Result<(), ProjectionError> + Send + Sync>;

/// Dispatch table mapping an event name to its ordered, typed handlers.
///
/// Built once at registration time. `S` is whatever the handlers mutate, typically
/// the projection's read-model store.
///
/// ```ignore
/// let table = HandlerTable::new()
///     .on::<OrderPlaced, _>(|store, meta, ev| { store.upsert(...); Ok(()) })
///     .on::<OrderCancelled, _>(|store, meta, ev| { ... });
/// ```
pub struct HandlerTable<S: ?Sized> {
    handlers: BTreeMap<String, Vec<ErasedHandler<S>>>,
}

impl<S: ?Sized> Default for HandlerTable<S> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }
}

impl<S: ?Sized> HandlerTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a typed event. The payload is decoded before the call.
    pub fn on<E, F>(self, handler: F) -> Self
    where
        E: DomainEvent,
        F: Fn(&S, &StoredEvent, E) -> Result<(), ProjectionError> + Send + Sync + 'static,
    {
        self.on_raw(E::NAME, move |state, event| {
            let decoded = event.decode::<E>().map_err(|e| ProjectionError::Deserialize {
                event_name: event.event_name.clone(),
                reason: e.to_string(),
            })?;
            handler(state, event, decoded)
        })
    }

    /// Register a handler that works on the raw JSON payload.
    pub fn on_raw<F>(mut self, event_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&S, &StoredEvent) -> Result<(), ProjectionError> + Send + Sync + 'static,
    {
        self.handlers
            .entry(event_name.into())
            .or_default()
            .push(Box::new(handler));
        self
    }

    pub fn event_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn handles(&self, event_name: &str) -> bool {
        self.handlers.contains_key(event_name)
    }

    /// Run every handler registered for the event's name, in registration order.
    ///
    /// Returns `Ok(false)` when nothing is registered for that name.
    pub fn dispatch(&self, state: &S, event: &StoredEvent) -> Result<bool, ProjectionError> {
        let Some(handlers) = self.handlers.get(&event.event_name) else {
            return Ok(false);
        };
        for handler in handlers {
            handler(state, event)?;
        }
        Ok(true)
    }
}

impl<S: ?Sized> core::fmt::Debug for HandlerTable<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("event_names", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use conduit_core::EventId;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    impl DomainEvent for Deposited {
        const NAME: &'static str = "account.deposited";
    }

    fn stored(name: &str, payload: serde_json::Value) -> StoredEvent {
        StoredEvent {
            event_id: EventId::new(),
            event_name: name.to_string(),
            aggregate_id: "acc-1".into(),
            version: 1,
            occurred_at: Utc::now(),
            stored_at: Utc::now(),
            payload,
        }
    }

    #[test]
    fn dispatches_typed_handlers_in_order() {
        let table = HandlerTable::<Mutex<Vec<i64>>>::new()
            .on::<Deposited, _>(|log, _meta, ev| {
                log.lock().unwrap().push(ev.amount);
                Ok(())
            })
            .on::<Deposited, _>(|log, _meta, ev| {
                log.lock().unwrap().push(ev.amount * 10);
                Ok(())
            });

        let log = Mutex::new(Vec::new());
        assert!(table.dispatch(&log, &stored("account.deposited", json!({"amount": 3}))).unwrap());
        assert!(!table.dispatch(&log, &stored("account.closed", json!({}))).unwrap());
        assert_eq!(*log.lock().unwrap(), vec![3, 30]);
        assert_eq!(table.event_names(), vec!["account.deposited".to_string()]);
    }

    #[test]
    fn undecodable_payload_is_reported() {
        let table = HandlerTable::<()>::new().on::<Deposited, _>(|_, _, _| Ok(()));
        let err = table
            .dispatch(&(), &stored("account.deposited", json!({"amount": "many"})))
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Deserialize { .. }));
    }
}
