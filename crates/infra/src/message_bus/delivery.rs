//! Delivery engine: runs delivery passes, schedules retries, dead-letters.
//!
//! ## One delivery pass
//!
//! 1. An expired envelope (`published_at + ttl` in the past) is dropped.
//! 2. Subscribers are visited in priority order (descending, ties in subscription
//!    order). A subscriber whose filter rejects the payload is skipped: it is neither
//!    counted as delivered nor retried.
//! 3. Detached (`is_async`) subscribers are spawned and not awaited. Their failures are
//!    counted and logged but never retried.
//! 4. Other subscribers are awaited one by one. A failure is counted on the channel and
//!    the pass continues with the next subscriber.
//!
//! If any awaited subscriber failed, `attempts` is incremented. Below `max_retries`,
//! a retry for the failed subscribers only is scheduled after
//! `retry_delay_ms * attempts`; otherwise the envelope goes to the dead letter queue.
//!
//! Retries are spawned tasks. No lock is held across the backoff sleep, and the
//! channel is looked up again by name when the retry fires.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use conduit_events::Envelope;

use super::channel::{Channel, ChannelRegistry};
use super::dead_letter::DeadLetterQueue;
use super::subscription::SubscriptionTable;
use crate::storage::KeyValueStore;

pub(crate) const MESSAGE_PREFIX: &str = "messages/";

/// Per-subscriber delivery failures. Recovered by the engine; never returned to the
/// publisher.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber '{subscriber_id}' failed on attempt {attempt}: {reason}")]
    DeliveryFailed {
        subscriber_id: String,
        attempt: u32,
        reason: String,
    },

    #[error("delivery failed after {attempts} attempt(s): {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },
}

pub(crate) fn message_key(envelope: &Envelope) -> String {
    format!("{MESSAGE_PREFIX}{}/{}", envelope.channel(), envelope.id())
}

#[derive(Clone)]
pub(crate) struct DeliveryEngine {
    channels: Arc<ChannelRegistry>,
    subscriptions: Arc<SubscriptionTable>,
    dead_letters: Arc<DeadLetterQueue>,
    store: Option<Arc<dyn KeyValueStore>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    running: Arc<AtomicBool>,
}

impl DeliveryEngine {
    pub(crate) fn new(
        channels: Arc<ChannelRegistry>,
        subscriptions: Arc<SubscriptionTable>,
        dead_letters: Arc<DeadLetterQueue>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        Self {
            channels,
            subscriptions,
            dead_letters,
            store,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Abort scheduled retries and in-flight detached handlers.
    pub(crate) fn cancel_all(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let outstanding = tasks.len();
        tasks.abort_all();
        outstanding
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Run one delivery pass. `only` restricts the pass to the named subscribers
    /// (retries target the subscribers that failed).
    pub(crate) fn deliver(
        &self,
        channel: Arc<Channel>,
        envelope: Envelope,
        only: Option<HashSet<String>>,
    ) -> BoxFuture<'static, ()> {
        let engine = self.clone();
        async move { engine.run_pass(channel, envelope, only).await }.boxed()
    }

    async fn run_pass(&self, channel: Arc<Channel>, mut envelope: Envelope, only: Option<HashSet<String>>) {
        if envelope.is_expired_at(Utc::now()) {
            warn!(
                channel = %channel.name,
                envelope_id = %envelope.id(),
                ttl_ms = ?envelope.metadata().ttl_ms,
                "envelope expired before delivery; dropping"
            );
            self.forget(&channel, &envelope).await;
            return;
        }

        let attempt = envelope.attempts() + 1;
        let mut failed = HashSet::new();
        let mut last_error = None;

        for sub in self.subscriptions.ordered(&channel.name) {
            if only.as_ref().is_some_and(|ids| !ids.contains(&sub.subscriber_id)) {
                continue;
            }
            if !sub.accepts(envelope.payload()) {
                continue;
            }

            if sub.is_async {
                let channel = channel.clone();
                let envelope = envelope.clone();
                self.spawn(async move {
                    let envelope_id = envelope.id();
                    match sub.handler.handle(envelope).await {
                        Ok(()) => {
                            sub.record_delivery();
                            channel.record_received();
                        }
                        Err(err) => {
                            channel.record_error();
                            warn!(
                                channel = %channel.name,
                                subscriber_id = %sub.subscriber_id,
                                envelope_id = %envelope_id,
                                error = ?err,
                                "detached subscriber failed"
                            );
                        }
                    }
                });
                continue;
            }

            match sub.handler.handle(envelope.clone()).await {
                Ok(()) => {
                    sub.record_delivery();
                    channel.record_received();
                }
                Err(err) => {
                    channel.record_error();
                    let failure = DeliveryError::DeliveryFailed {
                        subscriber_id: sub.subscriber_id.clone(),
                        attempt,
                        reason: format!("{err:#}"),
                    };
                    warn!(
                        channel = %channel.name,
                        envelope_id = %envelope.id(),
                        error = %failure,
                        "delivery failed"
                    );
                    last_error = Some(failure.to_string());
                    failed.insert(sub.subscriber_id.clone());
                }
            }
        }

        let Some(last_error) = last_error else {
            self.forget(&channel, &envelope).await;
            return;
        };

        let attempts = envelope.record_attempt();
        if attempts < channel.options.max_retries {
            self.schedule_retry(&channel, envelope, failed, attempts);
        } else {
            let exhausted = DeliveryError::ExhaustedRetries { attempts, last_error };
            self.dead_letter(&channel, envelope, exhausted).await;
        }
    }

    fn schedule_retry(&self, channel: &Channel, envelope: Envelope, failed: HashSet<String>, attempts: u32) {
        if !self.is_running() {
            debug!(channel = %channel.name, envelope_id = %envelope.id(), "bus stopped; retry not scheduled");
            return;
        }

        let delay = Duration::from_millis(channel.options.retry_delay_ms.saturating_mul(u64::from(attempts)));
        debug!(
            channel = %channel.name,
            envelope_id = %envelope.id(),
            attempts,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        let engine = self.clone();
        let name = channel.name.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            match engine.channels.get(&name) {
                Some(channel) => engine.deliver(channel, envelope, Some(failed)).await,
                None => {
                    let attempts = envelope.attempts();
                    let reason = DeliveryError::ExhaustedRetries {
                        attempts,
                        last_error: format!("channel '{name}' was deleted before retry"),
                    };
                    engine.dead_letters.push(envelope, reason.to_string()).await;
                }
            }
        });
    }

    async fn dead_letter(&self, channel: &Channel, envelope: Envelope, reason: DeliveryError) {
        self.forget(channel, &envelope).await;
        self.dead_letters.push(envelope, reason.to_string()).await;
    }

    /// Drop the persisted copy of a finished envelope.
    async fn forget(&self, channel: &Channel, envelope: &Envelope) {
        if !channel.is_persistent() {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.delete(&message_key(envelope)).await {
            warn!(envelope_id = %envelope.id(), error = %err, "failed to delete persisted envelope");
        }
    }
}
