mod common;

use chrono::Duration;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

use common::*;
use tradedesk::adapters::ExecutionSink;
use tradedesk::cio::{Cio, CioConfig, EmergencyLevel};
use tradedesk::coordinator::{CycleStage, CycleStatus, ExecutionResult, StageOutcome};
use tradedesk::domain::{Holding, OrderSide, PortfolioState, PositionProposal, ProposalKind};
use tradedesk::risk::VerdictOutcome;
use tradedesk::CircuitBreakerState;

/// 1,000,000 cash, 100 Y held
fn holding_y() -> PortfolioState {
    PortfolioState::new(dec!(1000000), now())
        .with_holding(Holding::new("Y", "CHEM", 100, dec!(110), dec!(102)))
}

fn sources() -> Vec<tradedesk::adapters::SourceRegistration> {
    vec![required(market(vec![
        uptrend("X", "TECH"),
        downtrend("Y", "CHEM"),
    ]))]
}

#[tokio::test]
async fn halt_before_cycle_liquidates_longs_and_buys_nothing() {
    let h = harness(&["X", "Y"], sources(), holding_y(), Options::default()).await;

    let breaker = h.coordinator.force_halt("operator drill").await.unwrap();
    assert!(breaker.is_halted());
    assert!(h.store.snapshot().await.unwrap().is_halted());

    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();
    assert_eq!(report.emergency, EmergencyLevel::Liquidate);
    assert_ne!(report.status, CycleStatus::Aborted);

    for stage in [CycleStage::Collecting, CycleStage::Analyzing, CycleStage::Strategizing] {
        let record = report.stages.iter().find(|s| s.stage == stage).unwrap();
        assert_eq!(record.outcome, StageOutcome::Skipped);
    }

    let intents: Vec<_> = report.intents().collect();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].symbol, "Y");
    assert_eq!(intents[0].side, OrderSide::Sell);
    assert_eq!(intents[0].quantity, 100);
    assert!(intents[0].liquidating);

    let y = report.instrument("Y").unwrap();
    assert_eq!(
        y.verdict.as_ref().unwrap().outcome,
        VerdictOutcome::Approved { quantity: 100 }
    );
    assert!(matches!(y.execution, Some(ExecutionResult::Submitted { .. })));
    assert!(report.instrument("X").unwrap().intent.is_none());

    let book = h.broker.current_holdings().await.unwrap();
    assert_eq!(book.quantity("Y"), 0);
}

#[tokio::test]
async fn paused_breaker_runs_defensive() {
    let mut paused = CircuitBreakerState::new(now());
    paused.record_outcome(dec!(-10), now(), 1, Duration::minutes(60));
    assert!(paused.is_paused());

    let options = Options {
        breaker: Some(paused),
        ..Default::default()
    };
    let h = harness(&["X", "Y"], sources(), holding_y(), options).await;
    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();

    assert_eq!(report.emergency, EmergencyLevel::Defensive);
    assert!(report.breaker.as_ref().unwrap().is_paused());

    // The buy never becomes an intent
    assert!(report.dropped.iter().any(|d| d.symbol == "X"));
    assert!(report.instrument("X").unwrap().intent.is_none());
    assert!(report.instrument("X").unwrap().proposal.is_some());

    // The downtrend close survives and passes the paused state check
    let y = report.instrument("Y").unwrap();
    let intent = y.intent.as_ref().unwrap();
    assert_eq!(intent.side, OrderSide::Sell);
    assert!(intent.liquidating);
    assert!(!y.verdict.as_ref().unwrap().is_rejected());
    assert_eq!(h.broker.fills().await.len(), 1);
}

#[tokio::test]
async fn clearing_the_halt_restores_normal_decisions() {
    let h = harness(&["X", "Y"], sources(), holding_y(), Options::default()).await;
    h.coordinator.force_halt("drill").await.unwrap();
    let cleared = h.coordinator.clear_halt().await.unwrap();
    assert!(!cleared.is_halted());
    assert!(!h.coordinator.control().is_halted());

    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();
    assert_eq!(report.emergency, EmergencyLevel::None);
    assert_eq!(report.status, CycleStatus::Complete);
    let x = report.instrument("X").unwrap();
    assert_eq!(x.intent.as_ref().unwrap().side, OrderSide::Buy);
}

fn proposal(symbol: &str, sector: &str, kind: ProposalKind, delta: i64) -> PositionProposal {
    PositionProposal {
        symbol: symbol.into(),
        sector: sector.into(),
        kind,
        quantity_delta: delta,
        reference_price: dec!(100),
        score: if delta > 0 { dec!(0.8) } else { dec!(-0.4) },
        confidence: dec!(0.8),
        target_fraction: dec!(0.05),
        rationale: Vec::new(),
    }
}

#[test]
fn liquidate_closes_every_long_in_full() {
    let portfolio = PortfolioState::new(dec!(500000), now())
        .with_holding(Holding::new("Y", "CHEM", 100, dec!(100), dec!(100)))
        .with_holding(Holding::new("Z", "BIO", 40, dec!(250), dec!(240)));
    let mut proposals = BTreeMap::new();
    proposals.insert("X".to_string(), proposal("X", "TECH", ProposalKind::Open, 300));
    proposals.insert("Y".to_string(), proposal("Y", "CHEM", ProposalKind::Reduce, -30));

    let decision = Cio::new(CioConfig::default()).decide(
        trading_date(),
        &proposals,
        &portfolio,
        EmergencyLevel::Liquidate,
    );

    assert_eq!(decision.dropped.len(), 1);
    assert_eq!(decision.dropped[0].symbol, "X");
    assert!(decision.intent_for("X").is_none());

    // The partial reduce is replaced by a full close
    let y = decision.intent_for("Y").unwrap();
    assert_eq!((y.side, y.quantity), (OrderSide::Sell, 100));
    assert!(y.liquidating);

    // Holdings without a proposal are closed at their last mark
    let z = decision.intent_for("Z").unwrap();
    assert_eq!((z.side, z.quantity), (OrderSide::Sell, 40));
    assert_eq!(z.reference_price, dec!(240));
    assert!(decision.intents.iter().all(|i| i.liquidating));
}
