//! Cross-aggregate event queries.
//!
//! Results of filtered scans are ordered by `occurred_at` ascending. Events sharing a
//! timestamp keep storage order (aggregate id, then version), so the order is stable.
//!
//! Rebuilds use [`merge_streams`] instead: `occurred_at` is caller-supplied and may go
//! backwards within one aggregate, and a projection must still see each aggregate's
//! events in version order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conduit_core::AggregateId;
use conduit_events::StoredEvent;

/// Filter criteria for event scans. Empty criteria match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub aggregate_id: Option<AggregateId>,
    /// Match any of these names (empty = all names).
    pub event_names: Vec<String>,
    /// Inclusive lower bound on `occurred_at`.
    pub occurred_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `occurred_at`.
    pub occurred_to: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(event_name: impl Into<String>) -> Self {
        Self {
            event_names: vec![event_name.into()],
            ..Self::default()
        }
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_names: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            occurred_from: Some(start),
            occurred_to: Some(end),
            ..Self::default()
        }
    }

    pub fn for_aggregate(mut self, aggregate_id: impl Into<AggregateId>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn matches(&self, event: &StoredEvent) -> bool {
        if let Some(id) = &self.aggregate_id {
            if &event.aggregate_id != id {
                return false;
            }
        }
        if !self.event_names.is_empty() && !self.event_names.iter().any(|n| n == &event.event_name) {
            return false;
        }
        if self.occurred_from.is_some_and(|from| event.occurred_at < from) {
            return false;
        }
        if self.occurred_to.is_some_and(|to| event.occurred_at > to) {
            return false;
        }
        true
    }
}

/// Sort scan results by business time. Ties are broken by aggregate, then version.
pub(crate) fn sort_by_occurred_at(events: &mut [StoredEvent]) {
    events.sort_by(|a, b| {
        a.occurred_at
            .cmp(&b.occurred_at)
            .then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
            .then_with(|| a.version.cmp(&b.version))
    });
}

/// Interleave per-aggregate streams by `occurred_at` without reordering any stream.
///
/// A k-way merge over the stream heads: each aggregate's events stay in version
/// order, and between aggregates the earliest head goes first (ties by aggregate id).
pub(crate) fn merge_streams(events: Vec<StoredEvent>) -> Vec<StoredEvent> {
    let total = events.len();
    let mut grouped: BTreeMap<AggregateId, VecDeque<StoredEvent>> = BTreeMap::new();
    for event in events {
        grouped.entry(event.aggregate_id.clone()).or_default().push_back(event);
    }

    let mut streams: Vec<VecDeque<StoredEvent>> = grouped.into_values().collect();
    for stream in &mut streams {
        stream.make_contiguous().sort_by_key(|e| e.version);
    }

    let mut heads: BinaryHeap<Reverse<(DateTime<Utc>, usize)>> = streams
        .iter()
        .enumerate()
        .filter_map(|(i, stream)| stream.front().map(|e| Reverse((e.occurred_at, i))))
        .collect();

    let mut merged = Vec::with_capacity(total);
    while let Some(Reverse((_, i))) = heads.pop() {
        let Some(event) = streams[i].pop_front() else {
            continue;
        };
        if let Some(next) = streams[i].front() {
            heads.push(Reverse((next.occurred_at, i)));
        }
        merged.push(event);
    }
    merged
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use conduit_core::EventId;
    use serde_json::json;

    use super::*;

    fn event(name: &str, aggregate: &str, at: DateTime<Utc>) -> StoredEvent {
        versioned(name, aggregate, 1, at)
    }

    fn versioned(name: &str, aggregate: &str, version: u64, at: DateTime<Utc>) -> StoredEvent {
        StoredEvent {
            event_id: EventId::new(),
            event_name: name.to_string(),
            aggregate_id: aggregate.into(),
            version,
            occurred_at: at,
            stored_at: at,
            payload: json!({}),
        }
    }

    #[test]
    fn filter_combines_criteria() {
        let now = Utc::now();
        let ev = event("order.placed", "o-1", now);

        assert!(EventFilter::all().matches(&ev));
        assert!(EventFilter::named("order.placed").matches(&ev));
        assert!(!EventFilter::named("order.cancelled").matches(&ev));
        assert!(EventFilter::names(["a", "order.placed"]).matches(&ev));
        assert!(!EventFilter::all().for_aggregate("o-2").matches(&ev));
        assert!(EventFilter::between(now, now).matches(&ev));
        assert!(!EventFilter::between(now + Duration::seconds(1), now + Duration::seconds(2)).matches(&ev));
    }

    #[test]
    fn sort_is_stable_for_equal_timestamps() {
        let t = Utc::now();
        let mut events = vec![
            event("b", "x", t + Duration::seconds(1)),
            event("first", "a", t),
            event("second", "b", t),
        ];
        sort_by_occurred_at(&mut events);
        let names: Vec<_> = events.iter().map(|e| e.event_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "b"]);
    }

    #[test]
    fn merge_keeps_each_stream_in_version_order() {
        let t = Utc::now();
        let events = vec![
            // o-1 was shipped with a business time before it was placed.
            versioned("o1.placed", "o-1", 1, t),
            versioned("o1.shipped", "o-1", 2, t - Duration::seconds(5)),
            versioned("o2.placed", "o-2", 1, t - Duration::seconds(1)),
            versioned("o2.shipped", "o-2", 2, t + Duration::seconds(1)),
        ];
        let names: Vec<_> = merge_streams(events)
            .into_iter()
            .map(|e| e.event_name)
            .collect();
        assert_eq!(names, vec!["o2.placed", "o1.placed", "o1.shipped", "o2.shipped"]);
    }

    #[test]
    fn merge_matches_sort_when_times_follow_versions() {
        let t = Utc::now();
        let mut events = vec![
            versioned("c", "b", 1, t + Duration::seconds(2)),
            versioned("a", "a", 1, t),
            versioned("b", "b", 2, t + Duration::seconds(3)),
            versioned("d", "a", 2, t + Duration::seconds(2)),
        ];
        let merged = merge_streams(events.clone());
        sort_by_occurred_at(&mut events);
        assert_eq!(merged, events);
    }
}
