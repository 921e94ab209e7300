use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;
use tokio::runtime::Runtime;

use conduit_core::AggregateId;
use conduit_events::{Envelope, NewEvent, PublishOptions, SubscribeOptions, handler_fn};
use conduit_infra::projections::{OrderSummariesProjection, OrderSummary, ProjectionRunner};
use conduit_infra::read_model::InMemoryDocumentStore;
use conduit_infra::{BusConfig, EventLog, MessageBus};

fn runtime() -> Runtime {
    Runtime::new().expect("tokio runtime")
}

fn order_events(order: &str, count: usize) -> Vec<NewEvent> {
    let mut events = vec![NewEvent::new(
        "order.placed",
        order,
        json!({ "customerId": "c-1", "totalCents": 1_000 }),
    )];
    for i in 1..count {
        // Shipping repeatedly is a valid (if odd) history for the summary projection.
        events.push(NewEvent::new("order.shipped", order, json!({ "carrier": format!("carrier-{i}") })));
    }
    events
}

async fn seeded_log(aggregates: usize, per_aggregate: usize) -> Arc<EventLog> {
    let log = Arc::new(EventLog::in_memory());
    for a in 0..aggregates {
        for event in order_events(&format!("o-{a}"), per_aggregate) {
            log.append(event).await.expect("append");
        }
    }
    log
}

fn bench_append_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("event_log_append");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("append_batch", batch_size), &batch_size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let log = EventLog::in_memory();
                    for event in order_events("o-1", size) {
                        black_box(log.append(event).await.expect("append"));
                    }
                })
            });
        });
    }

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("event_log_replay");

    for event_count in [10usize, 100, 1_000] {
        let log = rt.block_on(seeded_log(1, event_count));
        let id = AggregateId::from("o-0");

        group.bench_with_input(BenchmarkId::new("full_history", event_count), &event_count, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(log.replay(&id, 0u64, |n, _| n + 1).await.expect("replay"));
                })
            });
        });
    }

    let log = rt.block_on(seeded_log(1, 1_000));
    let id = AggregateId::from("o-0");
    rt.block_on(log.save_state(&id, &990u64, 990)).expect("snapshot");
    group.bench_function("from_snapshot_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(log.replay(&id, 0u64, |n, _| n + 1).await.expect("replay"));
            })
        });
    });

    group.finish();
}

fn bench_projection_rebuild(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("projection_rebuild");

    for aggregates in [10usize, 100, 1_000] {
        let log = rt.block_on(seeded_log(aggregates, 5));
        let runner = ProjectionRunner::new(
            log,
            Arc::new(OrderSummariesProjection::new(Arc::new(
                InMemoryDocumentStore::<AggregateId, OrderSummary>::new(),
            ))),
        );

        group.throughput(Throughput::Elements((aggregates * 5) as u64));
        group.bench_with_input(BenchmarkId::new("order_summaries", aggregates), &aggregates, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(runner.rebuild().await.expect("rebuild"));
                })
            });
        });
    }

    group.finish();
}

fn bench_bus_publish(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("bus_publish");

    for subscribers in [1usize, 10, 50] {
        let bus = rt.block_on(async {
            let bus = MessageBus::new(BusConfig::default());
            bus.start().await.expect("start");
            for i in 0..subscribers {
                bus.subscribe(
                    "bench",
                    format!("sub-{i}"),
                    handler_fn(|env: Envelope| async move {
                        black_box(env.payload());
                        anyhow::Ok(())
                    }),
                    SubscribeOptions::new().with_priority(i as i32),
                )
                .await
                .expect("subscribe");
            }
            bus
        });

        group.bench_with_input(BenchmarkId::new("subscribers", subscribers), &subscribers, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(
                        bus.publish("bench", json!({ "n": 1 }), PublishOptions::new())
                            .await
                            .expect("publish"),
                    );
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_append_throughput,
    bench_replay,
    bench_projection_rebuild,
    bench_bus_publish
);
criterion_main!(benches);
