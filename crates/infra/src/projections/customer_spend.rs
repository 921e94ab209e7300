//! Spend per customer across all of their orders.
//!
//! Each document keeps the per-order amounts it is built from, so placing the same
//! order twice or cancelling it twice cannot double count.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use conduit_core::AggregateId;
use conduit_events::{HandlerTable, Projection, ProjectionError, StoredEvent};

use super::orders::{OrderCancelled, OrderPlaced};
use crate::read_model::DocumentStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSpend {
    pub customer_id: String,
    /// Live (not cancelled) orders and their totals.
    pub orders: BTreeMap<AggregateId, i64>,
    pub total_cents: i64,
}

impl CustomerSpend {
    fn recompute(&mut self) {
        self.total_cents = self.orders.values().sum();
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}

pub type CustomerSpendStore = dyn DocumentStore<String, CustomerSpend>;

struct SpendState {
    store: Arc<CustomerSpendStore>,
    /// order → customer, for events that do not carry the customer.
    owners: RwLock<HashMap<AggregateId, String>>,
}

pub struct CustomerSpendProjection {
    state: SpendState,
    handlers: HandlerTable<SpendState>,
}

impl CustomerSpendProjection {
    pub const NAME: &'static str = "customers.spend";

    pub fn new(store: Arc<CustomerSpendStore>) -> Self {
        let handlers = HandlerTable::new()
            .on::<OrderPlaced, _>(|state: &SpendState, event, placed| {
                state
                    .owners
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(event.aggregate_id.clone(), placed.customer_id.clone());
                let customer_id = placed.customer_id.clone();
                state.store.update(placed.customer_id, &mut |current| {
                    let mut doc = current.cloned().unwrap_or_else(|| CustomerSpend {
                        customer_id: customer_id.clone(),
                        ..CustomerSpend::default()
                    });
                    doc.orders.insert(event.aggregate_id.clone(), placed.total_cents);
                    doc.recompute();
                    Some(doc)
                });
                Ok(())
            })
            .on::<OrderCancelled, _>(|state: &SpendState, event, _cancelled| {
                let owner = state
                    .owners
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&event.aggregate_id)
                    .cloned();
                let Some(customer_id) = owner else {
                    return Err(ProjectionError::handler(format!(
                        "cancellation for unknown order '{}'",
                        event.aggregate_id
                    )));
                };
                state.store.update(customer_id, &mut |current| {
                    let mut doc = current?.clone();
                    doc.orders.remove(&event.aggregate_id)?;
                    doc.recompute();
                    Some(doc)
                });
                Ok(())
            });

        Self {
            state: SpendState {
                store,
                owners: RwLock::new(HashMap::new()),
            },
            handlers,
        }
    }

    pub fn get(&self, customer_id: &str) -> Option<CustomerSpend> {
        self.state.store.get(&customer_id.to_string())
    }

    pub fn list(&self) -> Vec<CustomerSpend> {
        self.state.store.list()
    }
}

impl Projection for CustomerSpendProjection {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn event_names(&self) -> Vec<String> {
        self.handlers.event_names()
    }

    fn reset(&self) {
        self.state.store.clear();
        self.state
            .owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        self.handlers.dispatch(&self.state, event).map(|_| ())
    }
}
