//! Order events used by the bundled projections and the node demo.
//!
//! The aggregate is a pure fold over stored events so it can be rehydrated with
//! `EventLog::load_aggregate`.

use serde::{Deserialize, Serialize};

use conduit_core::Aggregate;
use conduit_events::{DomainEvent, StoredEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlaced {
    pub customer_id: String,
    /// Amount in smallest currency unit (e.g. cents).
    pub total_cents: i64,
}

impl DomainEvent for OrderPlaced {
    const NAME: &'static str = "order.placed";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderShipped {
    pub carrier: String,
}

impl DomainEvent for OrderShipped {
    const NAME: &'static str = "order.shipped";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub reason: String,
}

impl DomainEvent for OrderCancelled {
    const NAME: &'static str = "order.cancelled";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Draft,
    Placed,
    Shipped,
    Cancelled,
}

/// Order aggregate state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub status: OrderStatus,
    pub customer_id: Option<String>,
    pub total_cents: i64,
    pub carrier: Option<String>,
}

impl Aggregate for Order {
    type Event = StoredEvent;

    fn apply(mut self, event: &StoredEvent) -> Self {
        // Undecodable payloads leave the state unchanged.
        match event.event_name.as_str() {
            OrderPlaced::NAME => {
                if let Ok(placed) = event.decode::<OrderPlaced>() {
                    self.status = OrderStatus::Placed;
                    self.customer_id = Some(placed.customer_id);
                    self.total_cents = placed.total_cents;
                }
            }
            OrderShipped::NAME => {
                if let Ok(shipped) = event.decode::<OrderShipped>() {
                    self.status = OrderStatus::Shipped;
                    self.carrier = Some(shipped.carrier);
                }
            }
            OrderCancelled::NAME => self.status = OrderStatus::Cancelled,
            _ => {}
        }
        self
    }
}
