#![allow(dead_code)]

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use tradedesk::adapters::{FixtureSource, PaperBroker, SourceRegistration};
use tradedesk::agents::{Analyst, AnalystConfig, Collector, RetryPolicy, Strategist, StrategyConfig, StrategyRegistry};
use tradedesk::cio::{Cio, CioConfig};
use tradedesk::coordinator::{Coordinator, CoordinatorConfig, FixedClock, Pipeline, StageTimeouts};
use tradedesk::domain::{Bar, MarketSnapshot, PortfolioState};
use tradedesk::persistence::{MemoryBreakerStore, MemoryReportSink};
use tradedesk::portfolio::{PortfolioManager, SizingConfig};
use tradedesk::{CircuitBreakerState, EventBus, RiskConfig, RiskGuard};

pub fn trading_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
}

/// 08:30 in Seoul on the trading date
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 3, 23, 30, 0).unwrap()
}

/// 30 daily bars ending the day before the trading date, moving `step` per day
pub fn bars(start: i64, step: i64) -> Vec<Bar> {
    (0..30)
        .map(|i| {
            let close = Decimal::from(start + step * i);
            Bar {
                date: trading_date() - Duration::days(30 - i),
                open: close,
                high: close + Decimal::ONE,
                low: close - Decimal::ONE,
                close,
                volume: 100_000 + 500 * i as u64,
            }
        })
        .collect()
}

pub fn snapshot(symbol: &str, sector: &str, start: i64, step: i64) -> MarketSnapshot {
    let bars = bars(start, step);
    let price = bars.last().map(|b| b.close).unwrap_or(Decimal::ONE);
    MarketSnapshot::new(symbol, now() - Duration::hours(1))
        .with_sector(sector)
        .with_price(price)
        .with_bars(bars)
}

pub fn uptrend(symbol: &str, sector: &str) -> MarketSnapshot {
    snapshot(symbol, sector, 100, 1)
}

pub fn downtrend(symbol: &str, sector: &str) -> MarketSnapshot {
    snapshot(symbol, sector, 160, -2)
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempt_timeout_ms: 50,
        max_retries: 1,
        base_backoff_ms: 5,
        max_backoff_ms: 10,
        source_failure_threshold: 100,
    }
}

pub struct Options {
    pub risk: RiskConfig,
    pub breaker: Option<CircuitBreakerState>,
    pub retry: RetryPolicy,
    pub timeouts: StageTimeouts,
    pub max_concurrency: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            risk: RiskConfig::default(),
            breaker: None,
            retry: fast_retry(),
            timeouts: StageTimeouts {
                collecting_ms: 5_000,
                ..Default::default()
            },
            max_concurrency: 4,
        }
    }
}

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub broker: Arc<PaperBroker>,
    pub guard: Arc<RiskGuard>,
    pub reports: Arc<MemoryReportSink>,
    pub store: Arc<MemoryBreakerStore>,
    pub clock: Arc<FixedClock>,
    pub bus: EventBus,
}

pub async fn harness(
    universe: &[&str],
    sources: Vec<SourceRegistration>,
    portfolio: PortfolioState,
    options: Options,
) -> Harness {
    let clock = Arc::new(FixedClock::new(now()));
    let bus = EventBus::new();
    let store = Arc::new(match options.breaker {
        Some(state) => MemoryBreakerStore::with_state(state),
        None => MemoryBreakerStore::new(),
    });
    let guard = Arc::new(
        RiskGuard::new(options.risk, store.clone(), now())
            .unwrap()
            .with_bus(bus.clone()),
    );
    let broker = Arc::new(PaperBroker::new(portfolio, clock.clone()));
    broker.set_listener(guard.clone()).await;

    let strategies = StrategyConfig {
        enabled: vec!["momentum".into()],
        ..Default::default()
    };
    let pipeline = Pipeline {
        collector: Collector::new(sources),
        analyst: Analyst::new(AnalystConfig::default()),
        strategist: Strategist::new(&StrategyRegistry::with_builtins(), &strategies).unwrap(),
        manager: PortfolioManager::new(SizingConfig::default(), strategies),
        cio: Cio::new(CioConfig::default()),
        retry: options.retry,
    };
    let config = CoordinatorConfig {
        universe: universe.iter().map(|s| s.to_string()).collect(),
        max_concurrency: options.max_concurrency,
        stage_timeouts: options.timeouts,
        ..Default::default()
    };
    let reports = Arc::new(MemoryReportSink::new());
    let coordinator = Coordinator::new(
        config,
        pipeline,
        guard.clone(),
        broker.clone(),
        reports.clone(),
        clock.clone(),
        bus.clone(),
    )
    .unwrap();

    Harness {
        coordinator: Arc::new(coordinator),
        broker,
        guard,
        reports,
        store,
        clock,
        bus,
    }
}

pub fn market(snapshots: Vec<MarketSnapshot>) -> FixtureSource {
    snapshots
        .into_iter()
        .fold(FixtureSource::new("market"), |source, s| source.with_snapshot(s))
}

pub fn required(source: FixtureSource) -> SourceRegistration {
    SourceRegistration::required(Arc::new(source))
}
