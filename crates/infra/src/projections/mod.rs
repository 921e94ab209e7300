//! Projections (read model builders) and the runner that keeps them current.
//!
//! Projections consume events from the log and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: reconstructed from the event log at any time
//! - **Idempotent**: safe for at-least-once delivery

pub mod customer_spend;
pub mod order_summaries;
pub mod orders;
pub mod runner;

pub use customer_spend::{CustomerSpend, CustomerSpendProjection};
pub use order_summaries::{OrderSummariesProjection, OrderSummary};
pub use orders::{Order, OrderCancelled, OrderPlaced, OrderShipped, OrderStatus};
pub use runner::{ProjectionRunner, ProjectionRunnerError, ProjectionStats, ProjectionStatus, RebuildReport};
