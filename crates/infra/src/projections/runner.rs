//! Drives one projection: live feed from the event log plus full rebuilds.
//!
//! ## State machine
//!
//! `Stopped → Rebuilding → Live`. `start()` subscribes first and rebuilds second, so
//! no event can fall between the historical scan and the live feed. An event appended
//! during a rebuild may be applied twice (once by the scan, once live); projections are
//! idempotent, so this is harmless.
//!
//! Rebuilds and live applies take the same gate, so a live event never interleaves
//! with a half-finished rebuild.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use conduit_events::{EventSubscriber, Projection, StoredEvent};

use crate::event_store::{EventFilter, EventLog, EventLogError, EventSubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    Stopped,
    Rebuilding,
    Live,
}

#[derive(Debug, Error)]
pub enum ProjectionRunnerError {
    #[error("event log error: {0}")]
    Log(#[from] EventLogError),
}

/// Outcome of one rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub replayed: u64,
    pub failed: u64,
    pub elapsed_ms: u64,
}

/// Point-in-time view of a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectionStats {
    pub name: String,
    pub status: ProjectionStatus,
    /// Events applied successfully (rebuild and live) since the runner was created.
    pub applied: u64,
    pub failed: u64,
    pub last_rebuild_at: Option<DateTime<Utc>>,
}

struct RunnerState {
    status: Mutex<ProjectionStatus>,
    last_rebuild_at: Mutex<Option<DateTime<Utc>>>,
    gate: tokio::sync::Mutex<()>,
    applied: AtomicU64,
    failed: AtomicU64,
}

impl RunnerState {
    fn status(&self) -> ProjectionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ProjectionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Apply one event, logging and counting failures. Returns whether it succeeded.
    fn apply<P: Projection>(&self, projection: &P, event: &StoredEvent) -> bool {
        match projection.apply(event) {
            Ok(()) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    projection = projection.name(),
                    event_name = %event.event_name,
                    aggregate_id = %event.aggregate_id,
                    version = event.version,
                    error = %err,
                    "projection handler failed"
                );
                false
            }
        }
    }
}

/// Event-log subscriber feeding live notifications into the projection.
struct LiveFeed<P> {
    projection: Arc<P>,
    state: Arc<RunnerState>,
}

#[async_trait]
impl<P: Projection> EventSubscriber for LiveFeed<P> {
    async fn on_event(&self, event: &StoredEvent) -> anyhow::Result<()> {
        let _gate = self.state.gate.lock().await;
        if self.state.status() == ProjectionStatus::Stopped {
            return Ok(());
        }
        // Failures are counted and logged here so the log's other subscribers are
        // unaffected.
        self.state.apply(self.projection.as_ref(), event);
        Ok(())
    }
}

pub struct ProjectionRunner<P: Projection> {
    log: Arc<EventLog>,
    projection: Arc<P>,
    state: Arc<RunnerState>,
    subscriptions: Mutex<Vec<EventSubscriptionId>>,
}

impl<P: Projection> ProjectionRunner<P> {
    pub fn new(log: Arc<EventLog>, projection: Arc<P>) -> Self {
        Self {
            log,
            projection,
            state: Arc::new(RunnerState {
                status: Mutex::new(ProjectionStatus::Stopped),
                last_rebuild_at: Mutex::new(None),
                gate: tokio::sync::Mutex::new(()),
                applied: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn projection(&self) -> &Arc<P> {
        &self.projection
    }

    pub fn status(&self) -> ProjectionStatus {
        self.state.status()
    }

    pub fn stats(&self) -> ProjectionStats {
        ProjectionStats {
            name: self.projection.name().to_string(),
            status: self.state.status(),
            applied: self.state.applied.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
            last_rebuild_at: *self
                .state
                .last_rebuild_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn is_subscribed(&self) -> bool {
        !self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Subscribe to the projection's events, then rebuild. Calling `start` on a
    /// running projection only rebuilds.
    pub async fn start(&self) -> Result<RebuildReport, ProjectionRunnerError> {
        if !self.is_subscribed() {
            let ids: Vec<EventSubscriptionId> = self
                .projection
                .event_names()
                .into_iter()
                .map(|name| {
                    self.log.subscribe(
                        name,
                        LiveFeed {
                            projection: self.projection.clone(),
                            state: self.state.clone(),
                        },
                    )
                })
                .collect();
            debug!(projection = self.projection.name(), subscriptions = ids.len(), "projection subscribed");
            *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = ids;
        }
        self.rebuild().await
    }

    /// Clear the read model and replay every historical event of interest in
    /// `occurred_at` order, never reordering one aggregate's versions. Ends `Live`
    /// when subscribed, `Stopped` otherwise.
    pub async fn rebuild(&self) -> Result<RebuildReport, ProjectionRunnerError> {
        let _gate = self.state.gate.lock().await;
        let previous = self.state.status();
        self.state.set_status(ProjectionStatus::Rebuilding);
        let started = Instant::now();
        info!(projection = self.projection.name(), "projection rebuild started");

        let names = self.projection.event_names();
        let events = if names.is_empty() {
            Vec::new()
        } else {
            match self.log.query_for_rebuild(&EventFilter::names(names)).await {
                Ok(events) => events,
                Err(err) => {
                    self.state.set_status(previous);
                    return Err(err.into());
                }
            }
        };

        self.projection.reset();
        let mut report = RebuildReport::default();
        for event in &events {
            if self.state.apply(self.projection.as_ref(), event) {
                report.replayed += 1;
            } else {
                report.failed += 1;
            }
        }
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        *self
            .state
            .last_rebuild_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        let next = if self.is_subscribed() {
            ProjectionStatus::Live
        } else {
            ProjectionStatus::Stopped
        };
        self.state.set_status(next);
        info!(
            projection = self.projection.name(),
            replayed = report.replayed,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            status = ?next,
            "projection rebuild finished"
        );
        Ok(report)
    }

    /// Unsubscribe from the log. The read model is kept as is.
    pub async fn stop(&self) {
        let _gate = self.state.gate.lock().await;
        let ids = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        for id in ids {
            self.log.unsubscribe(id);
        }
        self.state.set_status(ProjectionStatus::Stopped);
        info!(projection = self.projection.name(), "projection stopped");
    }
}

impl<P: Projection> core::fmt::Debug for ProjectionRunner<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionRunner")
            .field("projection", &self.projection.name())
            .field("status", &self.state.status())
            .finish()
    }
}
