//! Order summaries read model: one document per order.
//!
//! Idempotent through `last_version`: an event at or below the document's version
//! has already been applied and is skipped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use conduit_core::AggregateId;
use conduit_events::{HandlerTable, Projection, ProjectionError, StoredEvent};

use super::orders::{OrderCancelled, OrderPlaced, OrderShipped, OrderStatus};
use crate::read_model::DocumentStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub order_id: AggregateId,
    pub customer_id: String,
    pub total_cents: i64,
    pub status: OrderStatus,
    pub carrier: Option<String>,
    pub cancel_reason: Option<String>,
    pub placed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_version: u64,
}

pub type OrderSummaryStore = dyn DocumentStore<AggregateId, OrderSummary>;

pub struct OrderSummariesProjection {
    store: Arc<OrderSummaryStore>,
    handlers: HandlerTable<OrderSummaryStore>,
}

impl OrderSummariesProjection {
    pub const NAME: &'static str = "orders.summaries";

    pub fn new(store: Arc<OrderSummaryStore>) -> Self {
        let handlers = HandlerTable::new()
            .on::<OrderPlaced, _>(|store: &OrderSummaryStore, event, placed| {
                if is_stale(store, event) {
                    return Ok(());
                }
                store.upsert(
                    event.aggregate_id.clone(),
                    OrderSummary {
                        order_id: event.aggregate_id.clone(),
                        customer_id: placed.customer_id,
                        total_cents: placed.total_cents,
                        status: OrderStatus::Placed,
                        carrier: None,
                        cancel_reason: None,
                        placed_at: event.occurred_at,
                        updated_at: event.occurred_at,
                        last_version: event.version,
                    },
                );
                Ok(())
            })
            .on::<OrderShipped, _>(|store: &OrderSummaryStore, event, shipped| {
                let mut shipped = Some(shipped);
                transition(store, event, |summary| {
                    summary.status = OrderStatus::Shipped;
                    summary.carrier = shipped.take().map(|s| s.carrier);
                })
            })
            .on::<OrderCancelled, _>(|store: &OrderSummaryStore, event, cancelled| {
                let mut cancelled = Some(cancelled);
                transition(store, event, |summary| {
                    summary.status = OrderStatus::Cancelled;
                    summary.cancel_reason = cancelled.take().map(|c| c.reason);
                })
            });

        Self { store, handlers }
    }

    pub fn get(&self, order_id: &AggregateId) -> Option<OrderSummary> {
        self.store.get(order_id)
    }

    pub fn list(&self) -> Vec<OrderSummary> {
        self.store.list()
    }
}

fn is_stale(store: &OrderSummaryStore, event: &StoredEvent) -> bool {
    store
        .get(&event.aggregate_id)
        .is_some_and(|s| event.version <= s.last_version)
}

/// Update an existing summary; the order must have been placed first.
fn transition(
    store: &OrderSummaryStore,
    event: &StoredEvent,
    mut change: impl FnMut(&mut OrderSummary),
) -> Result<(), ProjectionError> {
    let mut missing = false;
    store.update(event.aggregate_id.clone(), &mut |current| {
        let Some(current) = current else {
            missing = true;
            return None;
        };
        if event.version <= current.last_version {
            return None;
        }
        let mut next = current.clone();
        change(&mut next);
        next.updated_at = event.occurred_at;
        next.last_version = event.version;
        Some(next)
    });
    if missing {
        return Err(ProjectionError::handler(format!(
            "'{}' for unknown order '{}'",
            event.event_name, event.aggregate_id
        )));
    }
    Ok(())
}

impl Projection for OrderSummariesProjection {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn event_names(&self) -> Vec<String> {
        self.handlers.event_names()
    }

    fn reset(&self) {
        self.store.clear();
    }

    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        self.handlers.dispatch(self.store.as_ref(), event).map(|_| ())
    }
}
