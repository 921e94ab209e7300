//! Foundation building blocks shared by the bus and the event log.
//!
//! This crate contains **pure** primitives (no IO, no async).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, CorrelationId, EventId, MessageId};
