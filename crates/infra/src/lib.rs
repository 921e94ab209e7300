//! Runtime layer: event log, message bus, projections, persistence boundary, config.

pub mod config;
pub mod event_store;
pub mod message_bus;
pub mod projections;
pub mod read_model;
pub mod storage;

mod integration_tests;

pub use config::{BusConfig, EventLogConfig};
pub use event_store::{EventFilter, EventLog, EventLogError, EventSubscriptionId};
pub use message_bus::{BusError, ChannelOptions, MessageBus};
pub use storage::{InMemoryKeyValueStore, KeyValueStore, StorageError};
