//! Append-only event log with snapshots, replay and subscriber notification.
//!
//! The log is the **source of truth**. Events are durably written before subscribers
//! are notified, so a failed notification never loses an event: projections can always
//! be rebuilt from the log.

pub mod locks;
pub mod log;
pub mod query;

use thiserror::Error;

use conduit_core::{AggregateId, ExpectedVersion};
use conduit_events::ReplayError;

use crate::storage::StorageError;

pub use log::{EventLog, EventSubscriptionId};
pub use query::EventFilter;

/// Event log operation error.
///
/// Every variant propagates to the caller: an append that fails is not durable.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("optimistic concurrency check failed for '{aggregate_id}' (expected: {expected:?}, actual: {actual})")]
    Concurrency {
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("event storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("replay failed: {0}")]
    Replay(#[from] ReplayError),
}
