mod common;

use chrono::{Duration, NaiveDate};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use common::*;
use tradedesk::adapters::{ExecutionSink, PaperBroker};
use tradedesk::agents::{Analyst, AnalystConfig, Collector, Strategist, StrategyConfig, StrategyRegistry};
use tradedesk::cio::{Cio, CioConfig};
use tradedesk::coordinator::{Clock, Coordinator, CoordinatorConfig, CycleStatus, FixedClock, Pipeline};
use tradedesk::domain::{Holding, OrderIntent, OrderSide, PortfolioState, PriceSpec, Urgency};
use tradedesk::error::{DeskError, ErrorClass};
use tradedesk::persistence::{BreakerStore, FileBreakerStore, MemoryBreakerStore, MemoryReportSink};
use tradedesk::portfolio::{PortfolioManager, SizingConfig};
use tradedesk::risk::{BreakerState, RiskRule, TripReason};
use tradedesk::{CircuitBreakerState, EventBus, RiskConfig, RiskGuard};

fn intent(symbol: &str, side: OrderSide, quantity: u64, liquidating: bool) -> OrderIntent {
    let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
    OrderIntent {
        intent_id: OrderIntent::derive_id(date, symbol, side),
        trading_date: date,
        symbol: symbol.into(),
        sector: "TECH".into(),
        side,
        quantity,
        price: PriceSpec::Market,
        reference_price: dec!(100),
        urgency: Urgency::Normal,
        confidence: dec!(0.6),
        liquidating,
        rank: 0,
    }
}

/// Three 10-share longs bought at 100, plus one spare to liquidate later
fn book() -> PortfolioState {
    ["A", "B", "C", "E"]
        .into_iter()
        .fold(PortfolioState::new(dec!(1000000), now()), |p, s| {
            p.with_holding(Holding::new(s, "TECH", 10, dec!(100), dec!(100)))
        })
}

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir()
        .join(format!("tradedesk_{}_{}", name, Uuid::new_v4()))
        .join("breaker.json")
}

struct Desk {
    guard: Arc<RiskGuard>,
    broker: Arc<PaperBroker>,
    store: Arc<MemoryBreakerStore>,
    clock: Arc<FixedClock>,
    cycle_id: Uuid,
}

async fn desk() -> Desk {
    let clock = Arc::new(FixedClock::new(now()));
    let store = Arc::new(MemoryBreakerStore::new());
    let guard = Arc::new(RiskGuard::new(RiskConfig::default(), store.clone(), now()).unwrap());
    let broker = Arc::new(PaperBroker::new(book(), clock.clone()));
    broker.set_listener(guard.clone()).await;
    let cycle_id = Uuid::new_v4();
    guard.begin_cycle(cycle_id, &book(), now()).await.unwrap();
    Desk {
        guard,
        broker,
        store,
        clock,
        cycle_id,
    }
}

impl Desk {
    /// Evaluate and submit whatever the guard approves, at the current clock.
    async fn trade(&self, intents: &[OrderIntent]) -> Vec<tradedesk::risk::RiskVerdict> {
        let portfolio = self.broker.current_holdings().await.unwrap();
        let eval = self
            .guard
            .evaluate_batch(self.cycle_id, intents, &portfolio, false, self.clock.now())
            .await;
        for order in eval.approved {
            self.broker.submit(order).await.unwrap();
        }
        eval.verdicts
    }
}

#[tokio::test]
async fn three_losing_fills_pause_new_risk_until_the_window_elapses() {
    let d = desk().await;
    for symbol in ["A", "B", "C"] {
        d.broker.set_fill_price(symbol, dec!(90)).await;
    }

    for symbol in ["A", "B"] {
        d.trade(&[intent(symbol, OrderSide::Sell, 10, true)]).await;
        assert_eq!(d.guard.breaker_state().await.state, BreakerState::Normal);
    }
    d.trade(&[intent("C", OrderSide::Sell, 10, true)]).await;

    let breaker = d.guard.breaker_state().await;
    let until = now() + Duration::minutes(60);
    assert_eq!(breaker.state, BreakerState::Paused { until });
    assert_eq!(breaker.consecutive_losses, 0);
    assert!(matches!(
        breaker.history.last().map(|e| &e.reason),
        Some(TripReason::ConsecutiveLosses(3))
    ));
    // Persisted on the trip, not at the next cycle
    assert_eq!(d.store.snapshot().await.unwrap().state, breaker.state);

    let verdicts = d
        .trade(&[
            intent("D", OrderSide::Buy, 5, false),
            intent("E", OrderSide::Sell, 10, true),
        ])
        .await;
    assert!(verdicts[0].is_rejected());
    assert_eq!(verdicts[0].rule, Some(RiskRule::State));
    assert!(verdicts[0].checks[0].detail.contains("paused"));
    assert_eq!(verdicts[1].approved_quantity(), Some(10));

    d.clock.advance(Duration::minutes(61));
    let verdicts = d.trade(&[intent("D", OrderSide::Buy, 5, false)]).await;
    assert_eq!(verdicts[0].approved_quantity(), Some(5));
    assert_eq!(d.guard.breaker_state().await.state, BreakerState::Normal);
}

#[tokio::test]
async fn a_winning_fill_resets_the_loss_streak() {
    let d = desk().await;
    d.broker.set_fill_price("A", dec!(90)).await;
    d.broker.set_fill_price("B", dec!(90)).await;
    d.broker.set_fill_price("C", dec!(120)).await;
    d.broker.set_fill_price("E", dec!(90)).await;

    d.trade(&[intent("A", OrderSide::Sell, 10, true)]).await;
    d.trade(&[intent("B", OrderSide::Sell, 10, true)]).await;
    assert_eq!(d.guard.breaker_state().await.consecutive_losses, 2);
    d.trade(&[intent("C", OrderSide::Sell, 10, true)]).await;
    assert_eq!(d.guard.breaker_state().await.consecutive_losses, 0);
    d.trade(&[intent("E", OrderSide::Sell, 10, true)]).await;

    let breaker = d.guard.breaker_state().await;
    assert_eq!(breaker.consecutive_losses, 1);
    assert!(breaker.allows_new_risk());
}

#[tokio::test]
async fn file_store_round_trips_breaker_state() {
    let path = temp_path("roundtrip");
    let store = FileBreakerStore::new(&path);
    assert_eq!(assert_ok!(store.load().await), None);

    let mut state = CircuitBreakerState::new(now());
    state.record_outcome(dec!(-1), now(), 1, Duration::minutes(30));
    state.force_halt("drill", now());
    assert_ok!(store.save(&state).await);

    let loaded = assert_ok!(store.load().await).unwrap();
    assert_eq!(loaded, state);
    assert!(loaded.is_halted());
    assert_eq!(loaded.paused_until, Some(now() + Duration::minutes(30)));

    // Clearing inside the window falls back into the pause
    let mut cleared = loaded;
    assert!(cleared.clear_halt(now() + Duration::minutes(5)));
    assert!(cleared.is_paused());

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test]
async fn corrupt_breaker_file_is_fatal() {
    let path = temp_path("corrupt");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{\"state\": \"sideways\"").unwrap();

    let store = Arc::new(FileBreakerStore::new(&path));
    let err = assert_err!(store.load().await);
    assert!(matches!(err, DeskError::BreakerStateCorrupted(_)));
    assert_eq!(err.class(), ErrorClass::Fatal);

    // A cycle against it aborts before any order is considered
    let clock = Arc::new(FixedClock::new(now()));
    let bus = EventBus::new();
    let guard = Arc::new(RiskGuard::new(RiskConfig::default(), store.clone(), now()).unwrap());
    let broker = Arc::new(PaperBroker::new(book(), clock.clone()));
    let strategies = StrategyConfig {
        enabled: vec!["momentum".into()],
        ..Default::default()
    };
    let pipeline = Pipeline {
        collector: Collector::new(vec![required(market(vec![uptrend("D", "TECH")]))]),
        analyst: Analyst::new(AnalystConfig::default()),
        strategist: Strategist::new(&StrategyRegistry::with_builtins(), &strategies).unwrap(),
        manager: PortfolioManager::new(SizingConfig::default(), strategies),
        cio: Cio::new(CioConfig::default()),
        retry: fast_retry(),
    };
    let reports = Arc::new(MemoryReportSink::new());
    let coordinator = Coordinator::new(
        CoordinatorConfig {
            universe: vec!["D".into()],
            ..Default::default()
        },
        pipeline,
        guard,
        broker.clone(),
        reports.clone(),
        clock,
        bus,
    )
    .unwrap();

    let report = coordinator.start_cycle(trading_date()).await.unwrap();
    assert_eq!(report.status, CycleStatus::Aborted);
    assert!(report
        .abort_reason
        .as_deref()
        .unwrap_or_default()
        .contains("corrupted"));
    assert!(report.intents().next().is_none());
    assert!(broker.fills().await.is_empty());
    // The aborted report is still published
    assert_eq!(reports.reports().await.len(), 1);

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test]
async fn halt_survives_a_restart() {
    let path = temp_path("restart");
    {
        let store = Arc::new(FileBreakerStore::new(&path));
        let guard = RiskGuard::new(RiskConfig::default(), store, now()).unwrap();
        assert!(guard.force_halt("end of day drill", now()).await.unwrap());
    }

    let store = Arc::new(FileBreakerStore::new(&path));
    let guard = RiskGuard::new(RiskConfig::default(), store, now()).unwrap();
    assert!(!guard.breaker_state().await.is_halted());
    let restored = guard.restore(now()).await.unwrap();
    assert!(restored.is_halted());

    let eval = guard
        .evaluate_batch(
            Uuid::new_v4(),
            &[intent("D", OrderSide::Buy, 1, false)],
            &book(),
            false,
            now(),
        )
        .await;
    assert!(eval.verdicts[0].is_rejected());
    assert_eq!(eval.verdicts[0].checks[0].detail, "trading halted: end of day drill");

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test]
async fn report_carries_the_breaker_after_the_cycle_fills() {
    let portfolio = ["A", "B", "C"]
        .into_iter()
        .fold(PortfolioState::new(dec!(1000000), now()), |p, s| {
            p.with_holding(Holding::new(s, "TECH", 100, dec!(110), dec!(102)))
        });
    let h = harness(
        &["A", "B", "C"],
        vec![required(market(vec![
            downtrend("A", "TECH"),
            downtrend("B", "TECH"),
            downtrend("C", "TECH"),
        ]))],
        portfolio,
        Options::default(),
    )
    .await;

    let report = h.coordinator.start_cycle(trading_date()).await.unwrap();
    assert_ne!(report.status, CycleStatus::Aborted);

    // Every close fills near 102 against a 110 cost
    let fills = h.broker.fills().await;
    assert_eq!(fills.len(), 3);
    assert!(fills.iter().all(|f| f.side == OrderSide::Sell && f.price < dec!(110)));

    let breaker = report.breaker.as_ref().unwrap();
    assert!(breaker.is_paused());
    assert_eq!(breaker, &h.guard.breaker_state().await);
    assert!(matches!(
        breaker.history.last().map(|e| &e.reason),
        Some(TripReason::ConsecutiveLosses(3))
    ));
}
