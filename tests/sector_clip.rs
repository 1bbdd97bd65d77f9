mod common;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

use common::*;
use tradedesk::coordinator::{CycleStatus, ExecutionResult};
use tradedesk::domain::{Holding, OrderIntent, OrderSide, PortfolioState, PriceSpec, Urgency};
use tradedesk::persistence::MemoryBreakerStore;
use tradedesk::risk::{CheckResult, RiskRule, VerdictOutcome};
use tradedesk::{RiskConfig, RiskGuard};

fn buy(symbol: &str, sector: &str, quantity: u64, price: Decimal) -> OrderIntent {
    let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
    OrderIntent {
        intent_id: OrderIntent::derive_id(date, symbol, OrderSide::Buy),
        trading_date: date,
        symbol: symbol.into(),
        sector: sector.into(),
        side: OrderSide::Buy,
        quantity,
        price: PriceSpec::Market,
        reference_price: price,
        urgency: Urgency::Normal,
        confidence: dec!(0.7),
        liquidating: false,
        rank: 0,
    }
}

/// 750,000 cash plus 250 BANK_A at 1,000: FINANCE is already 25% of 1,000,000.
fn bank_heavy() -> PortfolioState {
    PortfolioState::new(dec!(750000), now())
        .with_holding(Holding::new("BANK_A", "FINANCE", 250, dec!(1000), dec!(1000)))
}

fn guard(config: RiskConfig) -> RiskGuard {
    RiskGuard::new(config, Arc::new(MemoryBreakerStore::new()), now()).unwrap()
}

#[tokio::test]
async fn sector_room_is_consumed_in_batch_order() {
    let guard = guard(RiskConfig::default());
    let cycle_id = Uuid::new_v4();
    let eval = guard
        .evaluate_batch(
            cycle_id,
            &[
                buy("BANK_B", "FINANCE", 100, dec!(1000)),
                buy("BANK_C", "FINANCE", 100, dec!(1000)),
                buy("CHIP_A", "TECH", 40, dec!(1000)),
            ],
            &bank_heavy(),
            false,
            now(),
        )
        .await;

    let clipped = &eval.verdicts[0];
    assert_eq!(
        clipped.outcome,
        VerdictOutcome::Modified {
            quantity: 50,
            reason: "sector FINANCE capped at 0.30 of portfolio value".into(),
        }
    );
    assert_eq!(clipped.rule, Some(RiskRule::SectorConcentration));
    assert_eq!(clipped.checks[1].result, CheckResult::Passed);
    assert_eq!(clipped.checks[2].result, CheckResult::Clipped { from: 100, to: 50 });

    // The first clip used up the sector, nothing is left for BANK_C.
    let rejected = &eval.verdicts[1];
    assert!(rejected.is_rejected());
    assert_eq!(rejected.rule, Some(RiskRule::SectorConcentration));

    assert_eq!(eval.verdicts[2].outcome, VerdictOutcome::Approved { quantity: 40 });

    let approved: Vec<(&str, u64)> = eval
        .approved
        .iter()
        .map(|o| (o.symbol(), o.quantity()))
        .collect();
    assert_eq!(approved, vec![("BANK_B", 50), ("CHIP_A", 40)]);

    // Every verdict, clipped or not, is on the audit trail
    assert_eq!(guard.audit_for(cycle_id).await.len(), 3);
}

#[tokio::test]
async fn blocked_instrument_fails_the_state_check_first() {
    let guard = guard(RiskConfig {
        blocked_instruments: vec!["BANK_B".into()],
        ..Default::default()
    });
    let eval = guard
        .evaluate_batch(
            Uuid::new_v4(),
            &[buy("BANK_B", "FINANCE", 10, dec!(1000))],
            &bank_heavy(),
            false,
            now(),
        )
        .await;
    let verdict = &eval.verdicts[0];
    assert!(verdict.is_rejected());
    assert_eq!(verdict.rule, Some(RiskRule::State));
    assert_eq!(verdict.checks.len(), 1);
    assert!(eval.approved.is_empty());

    guard.unblock_instrument("BANK_B").await;
    let eval = guard
        .evaluate_batch(
            Uuid::new_v4(),
            &[buy("BANK_B", "FINANCE", 10, dec!(1000))],
            &bank_heavy(),
            false,
            now(),
        )
        .await;
    assert_eq!(eval.verdicts[0].outcome, VerdictOutcome::Approved { quantity: 10 });
}

#[tokio::test]
async fn reloaded_limits_apply_to_the_next_batch() {
    let guard = guard(RiskConfig::default());
    guard
        .reload_limits(RiskConfig {
            max_position_fraction: dec!(0.05),
            max_sector_fraction: dec!(0.25),
            ..Default::default()
        })
        .await
        .unwrap();
    let eval = guard
        .evaluate_batch(
            Uuid::new_v4(),
            &[
                buy("CHIP_A", "TECH", 100, dec!(1000)),
                buy("BANK_B", "FINANCE", 10, dec!(1000)),
            ],
            &bank_heavy(),
            false,
            now(),
        )
        .await;
    assert_eq!(eval.verdicts[0].approved_quantity(), Some(50));
    assert_eq!(eval.verdicts[0].rule, Some(RiskRule::PositionSize));
    assert!(eval.verdicts[1].is_rejected());

    assert!(guard
        .reload_limits(RiskConfig {
            max_position_fraction: dec!(0.5),
            max_sector_fraction: dec!(0.25),
            ..Default::default()
        })
        .await
        .is_err());
    assert_eq!(guard.config().await.max_position_fraction, dec!(0.05));
}

#[tokio::test]
async fn cycle_submits_the_clipped_quantity() {
    // Risk allows 10% per sector, FIN already holds 100,000 of 1,100,000.
    let portfolio = PortfolioState::new(dec!(1000000), now())
        .with_holding(Holding::new("BANK_A", "FIN", 100, dec!(1000), dec!(1000)));
    let options = Options {
        risk: RiskConfig {
            max_position_fraction: dec!(0.10),
            max_sector_fraction: dec!(0.10),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = harness(
        &["BANK_B"],
        vec![required(market(vec![uptrend("BANK_B", "FIN")]))],
        portfolio,
        options,
    )
    .await;

    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();
    assert_eq!(report.status, CycleStatus::Complete);

    let outcome = report.instrument("BANK_B").unwrap();
    let intent = outcome.intent.as_ref().unwrap();
    assert_eq!(intent.side, OrderSide::Buy);
    let verdict = outcome.verdict.as_ref().unwrap();
    assert_eq!(verdict.rule, Some(RiskRule::SectorConcentration));
    // 10,000 of room at 129 per share
    assert_eq!(verdict.approved_quantity(), Some(77));
    assert!(intent.quantity > 77);
    assert!(matches!(outcome.execution, Some(ExecutionResult::Submitted { .. })));

    let fills = h.broker.fills().await;
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].quantity, 77);
}

#[tokio::test]
async fn loss_carried_from_earlier_days_does_not_block_the_cycle() {
    // Down 25,000 since entry, 2.5% of the book, but none of it today
    let portfolio = PortfolioState::new(dec!(750000), now())
        .with_holding(Holding::new("BANK_A", "FINANCE", 250, dec!(1000), dec!(900)));
    let h = harness(
        &["CHIP_A"],
        vec![required(market(vec![uptrend("CHIP_A", "TECH")]))],
        portfolio,
        Options::default(),
    )
    .await;

    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();
    assert_eq!(report.status, CycleStatus::Complete);

    let verdict = report.instrument("CHIP_A").unwrap().verdict.as_ref().unwrap();
    assert!(!verdict.is_rejected());
    assert_ne!(verdict.rule, Some(RiskRule::LossLimit));
    assert_eq!(h.broker.fills().await.len(), 1);
}

#[tokio::test]
async fn sizing_and_risk_share_the_analysed_prices() {
    // Carried at 100 but trading at 129: 1,020,300 marked, 1,000,000 stale
    let portfolio = PortfolioState::new(dec!(930000), now())
        .with_holding(Holding::new("CHIP_A", "TECH", 700, dec!(100), dec!(100)));
    let h = harness(
        &["CHIP_A"],
        vec![required(market(vec![uptrend("CHIP_A", "TECH")]))],
        portfolio,
        Options::default(),
    )
    .await;

    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();
    let outcome = report.instrument("CHIP_A").unwrap();

    // 10% of 1,020,300 is 790 shares at 129, so the manager tops up by 90
    assert_eq!(outcome.proposal.as_ref().unwrap().quantity_delta, 90);
    let intent = outcome.intent.as_ref().unwrap();
    assert_eq!(intent.quantity, 90);
    // The guard sizes against the same book and leaves it whole
    assert_eq!(
        outcome.verdict.as_ref().unwrap().outcome,
        VerdictOutcome::Approved { quantity: 90 }
    );
}
