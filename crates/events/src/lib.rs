//! Event and message mechanics (no IO, no async runtime).
//!
//! - **Event log side**: `NewEvent` → `StoredEvent`, snapshots, the `Projection` contract,
//!   typed handler tables and pure replay folding.
//! - **Message bus side**: `Envelope`, publish/subscribe options, handler and middleware
//!   contracts, topic pattern matching.
//!
//! Runtimes (the event log, the bus, projection runners) live in `conduit-infra`.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod projection;
pub mod replay;
pub mod topic;

pub use bus::{
    EventSubscriber, HandlerFn, MessageFilter, MessageHandler, Middleware, MiddlewareFn,
    SubscribeOptions, SubscriberFn, handler_fn, middleware_fn, subscriber_fn,
};
pub use envelope::{Envelope, MessageMetadata, PublishOptions};
pub use event::{DomainEvent, EventTopic, NewEvent, Snapshot, StoredEvent};
pub use handler::HandlerTable;
pub use projection::{Projection, ProjectionError};
pub use replay::{ReplayError, ReplayOutcome, fold_events, replay_from};
pub use topic::TopicPattern;
