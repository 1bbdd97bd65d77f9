mod common;

use rust_decimal_macros::dec;
use std::time::Duration;

use common::*;
use tradedesk::coordinator::{CycleStage, CycleStatus};
use tradedesk::domain::PortfolioState;
use tradedesk::error::FailureKind;

const UNIVERSE: [&str; 10] = [
    "000270", "000660", "005380", "005930", "035420", "035720", "051910", "068270", "105560",
    "207940",
];

#[tokio::test]
async fn two_collector_timeouts_degrade_but_do_not_abort() {
    let sectors = ["AUTO", "TECH", "AUTO", "TECH", "COMM", "COMM", "CHEM", "BIO", "FIN", "BIO"];
    let mut source = market(
        UNIVERSE
            .iter()
            .zip(sectors)
            .map(|(symbol, sector)| uptrend(symbol, sector))
            .collect(),
    );
    // Every attempt outlives the 50ms per-attempt timeout.
    source = source
        .with_delay("035720", Duration::from_millis(300))
        .with_delay("207940", Duration::from_millis(300));

    let h = harness(
        &UNIVERSE,
        vec![required(source)],
        PortfolioState::new(dec!(100000000), now()),
        Options::default(),
    )
    .await;

    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();

    assert_eq!(report.status, CycleStatus::Degraded);
    assert_eq!(report.processed.len(), 8);
    assert_eq!(report.excluded.len(), 2);
    for symbol in ["035720", "207940"] {
        let exclusion = &report.excluded[symbol];
        assert_eq!(exclusion.stage, CycleStage::Collecting);
        assert!(!report.processed.contains(&symbol.to_string()));

        // One failure event per attempt, the last one terminal
        let failures: Vec<_> = report
            .failures
            .iter()
            .filter(|f| f.symbol == symbol)
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].terminal);
        assert_eq!(failures[0].kind, FailureKind::Timeout);
        assert_eq!(failures[0].attempt, 2);
    }

    // Excluded instruments never reach sizing or the guard
    assert!(report
        .verdicts()
        .all(|v| v.symbol != "035720" && v.symbol != "207940"));
    assert_eq!(h.reports.reports().await.len(), 1);
}

#[tokio::test]
async fn stage_budget_keeps_partial_results() {
    let source = market(vec![uptrend("A", "TECH"), uptrend("B", "FIN")])
        .with_delay("B", std::time::Duration::from_millis(400));
    let mut options = Options::default();
    options.retry.attempt_timeout_ms = 1_000;
    options.timeouts.collecting_ms = 150;

    let h = harness(
        &["A", "B"],
        vec![required(source)],
        PortfolioState::new(dec!(1000000), now()),
        options,
    )
    .await;
    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();

    assert_eq!(report.status, CycleStatus::Degraded);
    assert_eq!(report.processed, vec!["A".to_string()]);
    assert!(report.excluded["B"].reason.contains("timed out"));
    assert!(report
        .degraded
        .iter()
        .any(|d| d.stage == CycleStage::Collecting));
}

#[tokio::test]
async fn optional_source_failure_only_degrades() {
    let news = tradedesk::adapters::FixtureSource::new("news")
        .with_failure("A", FailureKind::SourceUnavailable);
    let h = harness(
        &["A"],
        vec![
            required(market(vec![uptrend("A", "TECH")])),
            tradedesk::adapters::SourceRegistration::optional(std::sync::Arc::new(news)),
        ],
        PortfolioState::new(dec!(1000000), now()),
        Options::default(),
    )
    .await;
    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();

    assert_eq!(report.status, CycleStatus::Degraded);
    assert_eq!(report.processed, vec!["A".to_string()]);
    assert!(report.excluded.is_empty());
    assert!(report.instrument("A").unwrap().intent.is_some());
}
