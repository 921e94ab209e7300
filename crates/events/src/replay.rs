//! Pure replay folding.
//!
//! State is rebuilt by folding a reducer `(state, event) -> state` over an aggregate's
//! events in ascending version order. Nothing here performs IO, so replaying the same
//! history twice from the same starting point always yields the same state.

use thiserror::Error;

use crate::StoredEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("non-monotonic version (last={last}, found={found})")]
    NonMonotonic { last: u64, found: u64 },

    #[error("version gap (expected={expected}, found={found})")]
    Gap { expected: u64, found: u64 },
}

/// Result of a replay: the folded state and the version it represents.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome<S> {
    pub state: S,
    pub version: u64,
    pub events_applied: usize,
}

/// Fold `reducer` over `events` without any ordering checks.
pub fn fold_events<'a, S, I, F>(initial: S, events: I, mut reducer: F) -> S
where
    I: IntoIterator<Item = &'a StoredEvent>,
    F: FnMut(S, &StoredEvent) -> S,
{
    events.into_iter().fold(initial, |state, event| reducer(state, event))
}

/// Fold events on top of a base state at `base_version`.
///
/// Events at or below `base_version` are skipped (they are already in the base state).
/// The remaining events must continue the stream exactly: `base_version + 1`,
/// `base_version + 2`, ... Anything else is reported instead of silently folded.
pub fn replay_from<'a, S, I, F>(
    base: S,
    base_version: u64,
    events: I,
    mut reducer: F,
) -> Result<ReplayOutcome<S>, ReplayError>
where
    I: IntoIterator<Item = &'a StoredEvent>,
    F: FnMut(S, &StoredEvent) -> S,
{
    let mut state = base;
    let mut version = base_version;
    let mut events_applied = 0;
    let mut last_seen = 0;

    for event in events {
        if event.version <= last_seen {
            return Err(ReplayError::NonMonotonic {
                last: last_seen,
                found: event.version,
            });
        }
        last_seen = event.version;

        if event.version <= base_version {
            continue;
        }
        if event.version != version + 1 {
            return Err(ReplayError::Gap {
                expected: version + 1,
                found: event.version,
            });
        }

        state = reducer(state, event);
        version = event.version;
        events_applied += 1;
    }

    Ok(ReplayOutcome {
        state,
        version,
        events_applied,
    })
}
