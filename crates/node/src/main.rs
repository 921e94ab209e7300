//! Wires the event log, message bus and projections together and runs a short order
//! lifecycle through them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::{info, warn};

use conduit_core::AggregateId;
use conduit_events::{Envelope, NewEvent, StoredEvent, SubscribeOptions, handler_fn, subscriber_fn};
use conduit_infra::projections::{
    CustomerSpend, CustomerSpendProjection, Order, OrderSummariesProjection, OrderSummary, ProjectionRunner,
};
use conduit_infra::read_model::InMemoryDocumentStore;
use conduit_infra::{BusConfig, EventLog, EventLogConfig, InMemoryKeyValueStore, MessageBus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conduit_observability::init();

    let bus_config = BusConfig::from_env();
    let log_config = EventLogConfig::from_env();
    info!(?bus_config, ?log_config, "starting conduit node");

    let bus = MessageBus::new(bus_config);
    bus.start().await.context("starting message bus")?;

    let log = Arc::new(EventLog::new(Arc::new(InMemoryKeyValueStore::new()), log_config));

    let summaries = ProjectionRunner::new(
        log.clone(),
        Arc::new(OrderSummariesProjection::new(Arc::new(
            InMemoryDocumentStore::<AggregateId, OrderSummary>::new(),
        ))),
    );
    let spend = ProjectionRunner::new(
        log.clone(),
        Arc::new(CustomerSpendProjection::new(Arc::new(
            InMemoryDocumentStore::<String, CustomerSpend>::new(),
        ))),
    );
    summaries.start().await?;
    spend.start().await?;

    // Forward every appended event onto the bus as `events.<name>`.
    let forward = bus.clone();
    log.subscribe(
        "*",
        subscriber_fn(move |event: StoredEvent| {
            let bus = forward.clone();
            async move {
                let channel = format!("events.{}", event.event_name);
                bus.publish(&channel, serde_json::to_value(&event)?, Default::default())
                    .await?;
                anyhow::Ok(())
            }
        }),
    );

    bus.subscribe(
        "events.order.placed",
        "audit",
        handler_fn(|env: Envelope| async move {
            info!(id = %env.id(), payload = %env.payload(), "audit: order placed");
            anyhow::Ok(())
        }),
        SubscribeOptions::new().detached(),
    )
    .await?;

    let responder = bus.clone();
    bus.subscribe(
        "pricing.quote",
        "pricing",
        handler_fn(move |env: Envelope| {
            let bus = responder.clone();
            async move {
                let qty = env.payload()["quantity"].as_i64().unwrap_or(0);
                bus.reply(&env, json!({ "totalCents": qty * 250 })).await?;
                anyhow::Ok(())
            }
        }),
        SubscribeOptions::new(),
    )
    .await?;

    let quote = bus
        .request("pricing.quote", json!({ "quantity": 4 }), Duration::from_secs(1))
        .await
        .context("requesting a quote")?;
    let total = quote.payload()["totalCents"].as_i64().unwrap_or(0);
    info!(total_cents = total, "quote received");

    let order = AggregateId::from("order-1001");
    log.append(NewEvent::new(
        "order.placed",
        order.clone(),
        json!({ "customerId": "cust-7", "totalCents": total }),
    ))
    .await?;
    log.append(NewEvent::new("order.shipped", order.clone(), json!({ "carrier": "dhl" })))
        .await?;
    log.append(NewEvent::new(
        "order.placed",
        "order-1002",
        json!({ "customerId": "cust-7", "totalCents": 990 }),
    ))
    .await?;
    log.append(NewEvent::new(
        "order.cancelled",
        "order-1002",
        json!({ "reason": "out of stock" }),
    ))
    .await?;

    let state = log.load_aggregate::<Order>(&order).await?;
    info!(order = %order, version = state.version, status = ?state.state.status, "order rehydrated");

    for summary in summaries.projection().list() {
        info!(order = %summary.order_id, status = ?summary.status, total_cents = summary.total_cents, "summary");
    }
    if let Some(customer) = spend.projection().get("cust-7") {
        info!(customer = %customer.customer_id, orders = customer.order_count(), total_cents = customer.total_cents, "spend");
    }

    let report = summaries.rebuild().await?;
    info!(replayed = report.replayed, elapsed_ms = report.elapsed_ms, "summaries rebuilt");

    for name in bus.channel_names() {
        if let Some(channel) = bus.get_channel(&name).await {
            info!(channel = %name, sent = channel.stats.sent, received = channel.stats.received, errors = channel.stats.errors, "channel stats");
        }
    }
    let dead = bus.dead_letter_count().await;
    if dead > 0 {
        warn!(dead_letters = dead, "messages were dead-lettered");
    }

    summaries.stop().await;
    spend.stop().await;
    bus.stop();
    info!("conduit node stopped");
    Ok(())
}
