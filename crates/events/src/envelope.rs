use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use conduit_core::{CorrelationId, MessageId};

/// Delivery metadata carried by every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub published_at: DateTime<Utc>,
    pub publisher: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
    pub priority: i32,
    pub ttl_ms: Option<u64>,
}

/// Caller-supplied options for a single publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub publisher: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
    pub priority: i32,
    /// Overrides the channel's default TTL.
    pub ttl_ms: Option<u64>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_reply(mut self, correlation_id: CorrelationId, reply_to: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id);
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// A message in flight through the bus.
///
/// Created at publish time; gone once delivered to every subscriber or placed in the
/// dead letter queue. `attempts` counts delivery passes that saw a handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    id: MessageId,
    channel: String,
    payload: JsonValue,
    metadata: MessageMetadata,
    attempts: u32,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, payload: JsonValue, options: PublishOptions) -> Self {
        Self {
            id: MessageId::new(),
            channel: channel.into(),
            payload,
            metadata: MessageMetadata {
                published_at: Utc::now(),
                publisher: options.publisher,
                correlation_id: options.correlation_id,
                reply_to: options.reply_to,
                priority: options.priority,
                ttl_ms: options.ttl_ms,
            },
            attempts: 0,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.metadata.correlation_id
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.metadata.reply_to.as_deref()
    }

    /// Record a failed delivery pass and return the new attempt count.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Start over with a fresh attempt budget (dead-letter redelivery).
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Fill in a TTL when the publisher did not set one.
    pub fn apply_default_ttl(&mut self, ttl_ms: Option<u64>) {
        if self.metadata.ttl_ms.is_none() {
            self.metadata.ttl_ms = ttl_ms;
        }
    }

    pub fn replace_payload(&mut self, payload: JsonValue) {
        self.payload = payload;
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = i64::try_from(self.metadata.ttl_ms?).unwrap_or(i64::MAX);
        self.metadata
            .published_at
            .checked_add_signed(Duration::milliseconds(ttl))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}
