use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use conduit_core::{AggregateId, DomainError, DomainResult, EventId};

/// A typed domain event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **named** (the name is the routing key for subscribers and projections)
/// - designed to be **append-only**
///
/// The payload stored in the log is the serde representation of the implementing type.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable event name (e.g. "order.placed").
    const NAME: &'static str;
}

/// An event ready to be appended to an aggregate stream (no version assigned yet).
///
/// Every field is required by the log; `occurred_at` and `payload` are optional here
/// only so that the log can report which one is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_name: String,
    pub aggregate_id: AggregateId,
    pub occurred_at: Option<DateTime<Utc>>,
    pub payload: Option<JsonValue>,
}

impl NewEvent {
    /// Build an event that occurred now.
    pub fn new(
        event_name: impl Into<String>,
        aggregate_id: impl Into<AggregateId>,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            aggregate_id: aggregate_id.into(),
            occurred_at: Some(Utc::now()),
            payload: Some(payload),
        }
    }

    /// Build an event from a typed domain event.
    pub fn from_domain<E: DomainEvent>(
        aggregate_id: impl Into<AggregateId>,
        event: &E,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(E::NAME, aggregate_id, serde_json::to_value(event)?))
    }

    /// Override the business time of the event.
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    /// Check that every required field is present.
    pub fn validate(&self) -> DomainResult<()> {
        if self.event_name.trim().is_empty() {
            return Err(DomainError::validation("eventName is required"));
        }
        if self.aggregate_id.is_empty() {
            return Err(DomainError::validation("aggregateId is required"));
        }
        if self.occurred_at.is_none() {
            return Err(DomainError::validation("occurredAt is required"));
        }
        match &self.payload {
            None | Some(JsonValue::Null) => Err(DomainError::validation("payload is required")),
            Some(_) => Ok(()),
        }
    }
}

/// An event persisted in the log.
///
/// `version` is assigned by the log: per `aggregate_id` it starts at 1 and grows by
/// exactly 1 per append, with no gaps and no duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub event_id: EventId,
    pub event_name: String,
    pub aggregate_id: AggregateId,
    pub version: u64,
    pub occurred_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl StoredEvent {
    /// Decode the payload into a typed domain event.
    pub fn decode<E: DomainEvent>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn is<E: DomainEvent>(&self) -> bool {
        self.event_name == E::NAME
    }
}

/// Folded aggregate state at a given version. At most one per aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub state: JsonValue,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// What an event-log subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventTopic {
    /// Every event (`"*"`).
    All,
    /// Events with exactly this name.
    Named(String),
}

impl EventTopic {
    pub fn matches(&self, event_name: &str) -> bool {
        match self {
            EventTopic::All => true,
            EventTopic::Named(name) => name == event_name,
        }
    }
}

impl From<&str> for EventTopic {
    fn from(value: &str) -> Self {
        if value == "*" {
            EventTopic::All
        } else {
            EventTopic::Named(value.to_string())
        }
    }
}

impl From<String> for EventTopic {
    fn from(value: String) -> Self {
        EventTopic::from(value.as_str())
    }
}

impl core::fmt::Display for EventTopic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EventTopic::All => f.write_str("*"),
            EventTopic::Named(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        total: i64,
    }

    impl DomainEvent for OrderPlaced {
        const NAME: &'static str = "order.placed";
    }

    #[test]
    fn validation_reports_missing_fields() {
        let ok = NewEvent::new("order.placed", "o-1", json!({"total": 5}));
        assert!(ok.validate().is_ok());

        let mut missing_name = ok.clone();
        missing_name.event_name = String::new();
        assert!(missing_name.validate().is_err());

        let mut missing_aggregate = ok.clone();
        missing_aggregate.aggregate_id = AggregateId::from("");
        assert!(missing_aggregate.validate().is_err());

        let mut missing_time = ok.clone();
        missing_time.occurred_at = None;
        assert!(missing_time.validate().is_err());

        let mut null_payload = ok.clone();
        null_payload.payload = Some(JsonValue::Null);
        assert!(null_payload.validate().is_err());
    }

    #[test]
    fn typed_events_use_their_name() {
        let ev = NewEvent::from_domain("o-1", &OrderPlaced { total: 12 }).unwrap();
        assert_eq!(ev.event_name, "order.placed");
        assert_eq!(ev.payload, Some(json!({"total": 12})));
    }

    #[test]
    fn wildcard_topic_matches_everything() {
        assert_eq!(EventTopic::from("*"), EventTopic::All);
        assert!(EventTopic::All.matches("anything"));
        assert!(EventTopic::from("a.b").matches("a.b"));
        assert!(!EventTopic::from("a.b").matches("a.c"));
    }
}
