//! Integration tests for the full pipeline.
//!
//! Tests: domain event → EventLog → Projection → ReadModel, and the MessageBus
//! delivery guarantees.
//!
//! Verifies:
//! - Versions stay gapless under concurrent appends
//! - Replay is deterministic; rebuilt projections match live-fed ones
//! - Priority, filters, queueing, retries/DLQ, request timeouts, topics and fan-out

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::{Value as JsonValue, json};

    use conduit_core::AggregateId;
    use conduit_events::{
        Envelope, NewEvent, Projection, PublishOptions, StoredEvent, SubscribeOptions, handler_fn,
    };

    use crate::config::BusConfig;
    use crate::event_store::EventLog;
    use crate::message_bus::{BusError, ChannelOptions, MessageBus};
    use crate::projections::{
        CustomerSpend, CustomerSpendProjection, Order, OrderStatus, OrderSummariesProjection,
        OrderSummary, ProjectionRunner, ProjectionStatus,
    };
    use crate::read_model::InMemoryDocumentStore;

    // ---------------------------------------------------------------------
    // Event log + projections
    // ---------------------------------------------------------------------

    fn placed(order: &str, customer: &str, total: i64) -> NewEvent {
        NewEvent::new(
            "order.placed",
            order,
            json!({ "customerId": customer, "totalCents": total }),
        )
    }

    fn shipped(order: &str) -> NewEvent {
        NewEvent::new("order.shipped", order, json!({ "carrier": "dhl" }))
    }

    fn cancelled(order: &str) -> NewEvent {
        NewEvent::new("order.cancelled", order, json!({ "reason": "customer request" }))
    }

    fn summaries() -> Arc<OrderSummariesProjection> {
        Arc::new(OrderSummariesProjection::new(Arc::new(
            InMemoryDocumentStore::<AggregateId, OrderSummary>::new(),
        )))
    }

    fn spend() -> Arc<CustomerSpendProjection> {
        Arc::new(CustomerSpendProjection::new(Arc::new(
            InMemoryDocumentStore::<String, CustomerSpend>::new(),
        )))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_produce_gapless_versions() {
        let log = Arc::new(EventLog::in_memory());
        let mut tasks = Vec::new();
        for i in 0..50 {
            let first = log.clone();
            tasks.push(tokio::spawn(async move {
                first
                    .append(NewEvent::new("counter.bumped", "counter-1", json!({ "n": i })))
                    .await
                    .unwrap()
                    .version
            }));
            // Interleave a second aggregate to show independence.
            let second = log.clone();
            tasks.push(tokio::spawn(async move {
                second
                    .append(NewEvent::new("counter.bumped", "counter-2", json!({ "n": i })))
                    .await
                    .unwrap()
                    .version
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for id in ["counter-1", "counter-2"] {
            let versions: Vec<u64> = log
                .get_events(&id.into(), 0)
                .await
                .unwrap()
                .iter()
                .map(|e| e.version)
                .collect();
            assert_eq!(versions, (1..=50).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn replay_is_deterministic() {
        let log = EventLog::in_memory();
        let id = AggregateId::from("o-1");
        log.append(placed("o-1", "c-1", 1_500)).await.unwrap();
        log.append(shipped("o-1")).await.unwrap();

        let first = log.load_aggregate::<Order>(&id).await.unwrap();
        let second = log.load_aggregate::<Order>(&id).await.unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(first.version, 2);
        assert_eq!(first.state.status, OrderStatus::Shipped);

        log.save_state(&id, &first.state, first.version).await.unwrap();
        let from_snapshot = log.load_aggregate::<Order>(&id).await.unwrap();
        assert_eq!(from_snapshot.state, first.state);
        assert_eq!(from_snapshot.events_applied, 0);
    }

    #[tokio::test]
    async fn rebuilt_projection_matches_live_fed_projection() {
        let log = Arc::new(EventLog::in_memory());

        let live = ProjectionRunner::new(log.clone(), summaries());
        let live_spend = ProjectionRunner::new(log.clone(), spend());
        live.start().await.unwrap();
        live_spend.start().await.unwrap();
        assert_eq!(live.status(), ProjectionStatus::Live);

        let t0 = Utc::now() - ChronoDuration::minutes(10);
        let history = vec![
            placed("o-1", "c-1", 1_000).occurred_at(t0),
            placed("o-2", "c-2", 400).occurred_at(t0 + ChronoDuration::seconds(1)),
            placed("o-3", "c-1", 250).occurred_at(t0 + ChronoDuration::seconds(2)),
            shipped("o-1").occurred_at(t0 + ChronoDuration::seconds(3)),
            cancelled("o-3").occurred_at(t0 + ChronoDuration::seconds(4)),
        ];
        for event in history {
            log.append(event).await.unwrap();
        }

        let rebuilt = ProjectionRunner::new(log.clone(), summaries());
        let rebuilt_spend = ProjectionRunner::new(log.clone(), spend());
        let report = rebuilt.start().await.unwrap();
        rebuilt_spend.start().await.unwrap();
        assert_eq!(report.replayed, 5);
        assert_eq!(report.failed, 0);

        assert_eq!(live.projection().list(), rebuilt.projection().list());
        assert_eq!(live_spend.projection().list(), rebuilt_spend.projection().list());
        assert_eq!(live_spend.projection().get("c-1").unwrap().total_cents, 1_000);

        // A rebuild of an already-live projection is a no-op on its contents.
        let before = live.projection().list();
        live.rebuild().await.unwrap();
        assert_eq!(live.projection().list(), before);
    }

    #[tokio::test]
    async fn rebuild_keeps_version_order_for_backdated_events() {
        let log = Arc::new(EventLog::in_memory());
        let live = ProjectionRunner::new(log.clone(), summaries());
        live.start().await.unwrap();

        let now = Utc::now();
        log.append(placed("o-1", "c-1", 700).occurred_at(now)).await.unwrap();
        // Recorded late with the business time it really happened at.
        log.append(shipped("o-1").occurred_at(now - ChronoDuration::seconds(1)))
            .await
            .unwrap();
        log.append(placed("o-2", "c-2", 50).occurred_at(now - ChronoDuration::seconds(30)))
            .await
            .unwrap();

        let id = AggregateId::from("o-1");
        assert_eq!(live.projection().get(&id).unwrap().status, OrderStatus::Shipped);

        let report = live.rebuild().await.unwrap();
        assert_eq!(report.replayed, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(live.projection().get(&id).unwrap().status, OrderStatus::Shipped);

        let fresh = ProjectionRunner::new(log.clone(), summaries());
        fresh.start().await.unwrap();
        assert_eq!(fresh.projection().list(), live.projection().list());
    }

    #[tokio::test]
    async fn failing_projection_handler_does_not_block_others() {
        let log = Arc::new(EventLog::in_memory());
        let runner = ProjectionRunner::new(log.clone(), summaries());
        runner.start().await.unwrap();

        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        log.subscribe(
            "*",
            conduit_events::subscriber_fn(move |_event: StoredEvent| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
        );

        // Shipping an order that was never placed fails inside the projection.
        log.append(shipped("ghost")).await.unwrap();
        log.append(placed("o-1", "c-1", 10)).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        let stats = runner.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.applied, 1);
        assert!(runner.projection().get(&"o-1".into()).is_some());
    }

    #[tokio::test]
    async fn stopped_projection_ignores_new_events() {
        let log = Arc::new(EventLog::in_memory());
        let runner = ProjectionRunner::new(log.clone(), summaries());
        assert_eq!(runner.status(), ProjectionStatus::Stopped);
        runner.start().await.unwrap();
        log.append(placed("o-1", "c-1", 10)).await.unwrap();

        runner.stop().await;
        assert_eq!(runner.status(), ProjectionStatus::Stopped);
        assert_eq!(log.subscriber_count(), 0);
        log.append(placed("o-2", "c-1", 10)).await.unwrap();
        assert_eq!(runner.projection().list().len(), 1);

        // Restarting catches up through the rebuild.
        runner.start().await.unwrap();
        assert_eq!(runner.projection().list().len(), 2);
        assert_eq!(runner.projection().event_names().len(), 3);
    }

    // ---------------------------------------------------------------------
    // Message bus
    // ---------------------------------------------------------------------

    async fn bus_with(options: ChannelOptions) -> MessageBus {
        let bus = MessageBus::new(BusConfig::default().with_default_channel_options(options));
        bus.start().await.unwrap();
        bus
    }

    fn recording(log: Arc<Mutex<Vec<String>>>, label: &'static str) -> impl conduit_events::MessageHandler {
        handler_fn(move |_env: Envelope| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(label.to_string());
                anyhow::Ok(())
            }
        })
    }

    #[tokio::test]
    async fn higher_priority_subscribers_are_delivered_first() {
        let bus = bus_with(ChannelOptions::default()).await;
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("alerts", "low", recording(order.clone(), "low"), SubscribeOptions::new().with_priority(1))
            .await
            .unwrap();
        bus.subscribe("alerts", "high", recording(order.clone(), "high"), SubscribeOptions::new().with_priority(10))
            .await
            .unwrap();

        bus.publish("alerts", json!({}), PublishOptions::new()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn filtered_out_subscribers_are_neither_counted_nor_retried() {
        let bus = bus_with(ChannelOptions::default().with_retry_delay_ms(10)).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        bus.subscribe(
            "payments",
            "large-only",
            handler_fn(move |_env: Envelope| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("should never run for small payments")
                }
            }),
            SubscribeOptions::new().with_filter(|p: &JsonValue| p["amount"].as_i64().unwrap_or(0) > 1_000),
        )
        .await
        .unwrap();

        bus.publish("payments", json!({ "amount": 5 }), PublishOptions::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let info = bus.get_channel("payments").await.unwrap();
        assert_eq!(info.stats.sent, 1);
        assert_eq!(info.stats.received, 0);
        assert_eq!(info.stats.errors, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(bus.dead_letters().await.is_empty());
        assert_eq!(bus.subscriptions("payments")[0].message_count, 0);
    }

    #[tokio::test]
    async fn first_subscriber_drains_queued_envelopes_in_order() {
        let bus = bus_with(ChannelOptions::default()).await;
        for n in 1..=3 {
            bus.publish("inbox", json!(n), PublishOptions::new()).await.unwrap();
        }
        assert_eq!(bus.get_channel("inbox").await.unwrap().queued, 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            "inbox",
            "reader",
            handler_fn(move |env: Envelope| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(env.into_payload());
                    anyhow::Ok(())
                }
            }),
            SubscribeOptions::new(),
        )
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(bus.get_channel("inbox").await.unwrap().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_land_in_dead_letter_queue() {
        let bus = bus_with(ChannelOptions::default()).await;
        bus.create_channel("jobs", ChannelOptions::default().with_max_retries(3).with_retry_delay_ms(100))
            .await
            .unwrap();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        bus.subscribe(
            "jobs",
            "always-fails",
            handler_fn(move |_env: Envelope| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("downstream unavailable")
                }
            }),
            SubscribeOptions::new(),
        )
        .await
        .unwrap();

        let id = bus.publish("jobs", json!({ "job": "resize" }), PublishOptions::new())
            .await
            .unwrap();
        // Delays: 100ms then 200ms.
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(bus.get_channel("jobs").await.unwrap().stats.errors, 3);
        let dead = bus.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id(), id);
        assert!(dead[0].error.contains("downstream unavailable"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unanswered_request_times_out_and_cleans_up() {
        let bus = bus_with(ChannelOptions::default()).await;
        let started = Instant::now();
        let err = bus
            .request("echo", json!({ "x": 1 }), Duration::from_millis(50))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, BusError::RequestTimeout { timeout_ms: 50, .. }));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500));
        assert!(bus.channel_names().iter().all(|name| !name.starts_with("reply_")));
        assert_eq!(bus.channel_names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn topic_publish_matches_one_segment() {
        let bus = bus_with(ChannelOptions::default()).await;
        let hits = Arc::new(Mutex::new(Vec::new()));
        for channel in ["orders.created", "orders.cancelled", "order.created", "orders"] {
            let sink = hits.clone();
            bus.subscribe(
                channel,
                "topic-listener",
                handler_fn(move |env: Envelope| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(env.channel().to_string());
                        anyhow::Ok(())
                    }
                }),
                SubscribeOptions::new(),
            )
            .await
            .unwrap();
        }

        let results = bus.publish_to_topic("orders.*", json!({ "id": 7 })).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_success()));

        let mut hits = hits.lock().unwrap().clone();
        hits.sort();
        assert_eq!(hits, vec!["orders.cancelled", "orders.created"]);
    }

    #[tokio::test]
    async fn fanout_outcomes_are_independent() {
        let bus = bus_with(ChannelOptions::default().with_max_retries(1)).await;
        let a_hits = Arc::new(AtomicU32::new(0));
        let counter = a_hits.clone();
        bus.subscribe(
            "a",
            "ok",
            handler_fn(move |_env: Envelope| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
            SubscribeOptions::new(),
        )
        .await
        .unwrap();
        bus.subscribe(
            "b",
            "broken",
            handler_fn(|_env: Envelope| async move { anyhow::bail!("b is broken") }),
            SubscribeOptions::new(),
        )
        .await
        .unwrap();

        let results = bus.fanout(["a", "b"], json!({ "ping": true })).await;
        let a = results.iter().find(|r| r.channel == "a").unwrap();
        assert!(a.is_success());
        assert!(a.message_id().is_some());
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.get_channel("b").await.unwrap().stats.errors, 1);
        assert_eq!(bus.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn detached_subscribers_do_not_hold_up_the_publisher() {
        let bus = bus_with(ChannelOptions::default()).await;
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(rx)));
        let done = Arc::new(AtomicU32::new(0));
        let finished = done.clone();
        bus.subscribe(
            "slow",
            "background",
            handler_fn(move |_env: Envelope| {
                let gate = gate.clone();
                let finished = finished.clone();
                async move {
                    let rx = gate.lock().unwrap().take();
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
            SubscribeOptions::new().detached(),
        )
        .await
        .unwrap();

        tokio::time::timeout(
            Duration::from_millis(200),
            bus.publish("slow", json!({}), PublishOptions::new()),
        )
        .await
        .expect("publish must not wait for detached subscribers")
        .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 0);

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
