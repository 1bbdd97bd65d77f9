mod common;

use futures::StreamExt;
use rust_decimal_macros::dec;
use std::time::Duration;

use common::*;
use tradedesk::domain::PortfolioState;
use tradedesk::{CycleEvent, EventPayload, Topic};

async fn collect(stream: tradedesk::events::EventStream) -> Vec<CycleEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not end with the cycle")
}

#[tokio::test]
async fn cycle_streams_end_when_the_cycle_completes() {
    let h = harness(
        &["A"],
        vec![required(market(vec![uptrend("A", "TECH")]))],
        PortfolioState::new(dec!(1000000), now()),
        Options::default(),
    )
    .await;
    let lifecycle = h.bus.subscribe(Topic::Cycle, "observer").await;
    let decisions = h.bus.subscribe(Topic::Decision, "observer").await;

    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();

    let events = collect(lifecycle).await;
    assert!(matches!(
        events.first().map(|e| &e.payload),
        Some(EventPayload::CycleStarted { .. })
    ));
    assert!(matches!(
        events.last().map(|e| &e.payload),
        Some(EventPayload::CycleCompleted { status }) if *status == report.status
    ));
    assert!(events.iter().all(|e| e.cycle_id == report.cycle_id));

    // Streams on quiet topics end too
    let decisions = collect(decisions).await;
    assert!(decisions
        .iter()
        .all(|e| matches!(e.payload, EventPayload::ProposalIssued(_) | EventPayload::IntentDecided(_))));
    assert_eq!(h.bus.subscriber_count(Topic::Cycle).await, 0);
}

#[tokio::test]
async fn next_cycle_gets_fresh_subscriptions() {
    let h = harness(
        &["A"],
        vec![required(market(vec![uptrend("A", "TECH")]))],
        PortfolioState::new(dec!(1000000), now()),
        Options::default(),
    )
    .await;
    let first = h.bus.subscribe(Topic::Cycle, "observer").await;
    h.coordinator.start_cycle(trading_date()).await.unwrap();
    assert!(!collect(first).await.is_empty());

    let second = h.bus.subscribe(Topic::Cycle, "observer").await;
    let next_day = trading_date().succ_opt().unwrap();
    let report = h.coordinator.start_cycle(next_day).await.unwrap();
    let events = collect(second).await;
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.cycle_id == report.cycle_id));
}
