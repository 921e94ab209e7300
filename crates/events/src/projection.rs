use thiserror::Error;

use crate::StoredEvent;

/// A projection builds a read model from the event log.
///
/// Projections implement the **CQRS read model pattern**: they transform events (write
/// model) into queryable state (read model).
///
/// ## Lifecycle
///
/// 1. **Subscribe**: the runner subscribes to every name in `event_names()`
/// 2. **Rebuild**: `reset()` clears the read model, then every historical event of
///    interest is applied in ascending `occurred_at` order
/// 3. **Live**: new notifications are applied as they arrive
///
/// The same `apply` is used for rebuild and live feed, so a projection rebuilt at any
/// time converges to the state a live-fed projection reaches.
///
/// ## Idempotency
///
/// Applying the same event twice must not corrupt the read model. Key documents by the
/// event's business id and upsert.
///
/// ## Side effects
///
/// A projection never appends events or publishes bus messages from `apply`. Read-only
/// calls to other services are fine.
pub trait Projection: Send + Sync + 'static {
    /// Stable name used in logs and status reports.
    fn name(&self) -> &str;

    /// Event names this projection subscribes to.
    fn event_names(&self) -> Vec<String>;

    /// Drop every read-model document (rebuild support).
    fn reset(&self);

    /// Apply a single event to the read model.
    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("failed to decode '{event_name}' payload: {reason}")]
    Deserialize { event_name: String, reason: String },

    #[error("projection handler failed: {0}")]
    Handler(String),
}

impl ProjectionError {
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}
