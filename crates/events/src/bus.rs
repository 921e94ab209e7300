//! Handler contracts for the message bus and the event log (mechanics only).
//!
//! Both sides deliver **at-least-once**: a message handler may see the same envelope
//! again after a retry, and a projection may see an event once live and once more during
//! a rebuild. Handlers must be idempotent.
//!
//! Handlers return `anyhow::Result` so callers can use `?` on any error type. A failed
//! handler never fails the publish or append that triggered it: the bus retries and
//! dead-letters, the event log logs and moves on to the next subscriber.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{Envelope, StoredEvent};

/// Receives envelopes published on a channel.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (**self).handle(envelope).await
    }
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a message handler.
///
/// ```ignore
/// bus.subscribe("orders", "audit", handler_fn(|env| async move {
///     tracing::info!(id = %env.id(), "order seen");
///     anyhow::Ok(())
/// }), SubscribeOptions::default()).await;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self.0)(envelope).await
    }
}

/// Predicate deciding whether a subscriber wants a payload.
pub type MessageFilter = Arc<dyn Fn(&JsonValue) -> bool + Send + Sync>;

/// Per-subscription delivery options.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub filter: Option<MessageFilter>,
    /// Detached delivery: the publisher does not wait for this handler and its
    /// failures are neither retried nor dead-lettered.
    pub is_async: bool,
    /// Higher priorities are delivered first.
    pub priority: i32,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&JsonValue) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn detached(mut self) -> Self {
        self.is_async = true;
        self
    }
}

impl core::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("filter", &self.filter.is_some())
            .field("is_async", &self.is_async)
            .field("priority", &self.priority)
            .finish()
    }
}

/// A step in the publish pipeline. May transform the payload; an error aborts the
/// publish and is returned to the publisher.
pub trait Middleware: Send + Sync + 'static {
    fn process(&self, channel: &str, payload: JsonValue) -> anyhow::Result<JsonValue>;
}

/// Adapter turning a closure into a [`Middleware`].
pub struct MiddlewareFn<F>(F);

pub fn middleware_fn<F>(f: F) -> MiddlewareFn<F>
where
    F: Fn(&str, JsonValue) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
{
    MiddlewareFn(f)
}

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(&str, JsonValue) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
{
    fn process(&self, channel: &str, payload: JsonValue) -> anyhow::Result<JsonValue> {
        (self.0)(channel, payload)
    }
}

/// Receives notifications for events appended to the log.
#[async_trait]
pub trait EventSubscriber: Send + Sync + 'static {
    async fn on_event(&self, event: &StoredEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<S> EventSubscriber for Arc<S>
where
    S: EventSubscriber + ?Sized,
{
    async fn on_event(&self, event: &StoredEvent) -> anyhow::Result<()> {
        (**self).on_event(event).await
    }
}

/// Adapter turning an async closure into an [`EventSubscriber`].
pub struct SubscriberFn<F>(F);

pub fn subscriber_fn<F, Fut>(f: F) -> SubscriberFn<F>
where
    F: Fn(StoredEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    SubscriberFn(f)
}

#[async_trait]
impl<F, Fut> EventSubscriber for SubscriberFn<F>
where
    F: Fn(StoredEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_event(&self, event: &StoredEvent) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}
