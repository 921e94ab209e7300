//! Aggregate fold contract and optimistic versioning.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Optimistic concurrency expectation for an aggregate stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require that the stream has no events yet.
    NoStream,
    /// Require the aggregate to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => actual == 0,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}

/// Event-sourced aggregate state expressed as a pure fold.
///
/// `apply` takes the state by value and returns the next state. It must not perform
/// IO or depend on anything but its inputs, so that replaying the same history always
/// produces the same result.
///
/// The state is serde-serializable so it can be stored as a snapshot.
pub trait Aggregate: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Event representation the aggregate folds over.
    type Event;

    fn apply(self, event: &Self::Event) -> Self;
}
