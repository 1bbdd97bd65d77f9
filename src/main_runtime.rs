use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tradedesk::adapters::{MarketFixture, PaperBroker};
use tradedesk::agents::{Analyst, Collector, Strategist, StrategyRegistry};
use tradedesk::cio::Cio;
use tradedesk::config::{AppConfig, LoggingConfig};
use tradedesk::coordinator::{Clock, Coordinator, CoordinatorConfig, Pipeline, SystemClock};
use tradedesk::error::Result;
use tradedesk::persistence::{FileBreakerStore, JsonlReportSink};
use tradedesk::portfolio::PortfolioManager;
use tradedesk::{CircuitBreakerState, CycleReport, EventBus, RiskGuard};

/// Console logs go to stderr so report output on stdout stays clean.
pub fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tradedesk=debug", logging.level)));

    let log_dir = std::env::var("TRADEDESK_LOG_DIR")
        .ok()
        .map(std::path::PathBuf::from)
        .or_else(|| logging.dir.clone());

    // `rolling::daily` panics if it cannot create its file, so check first.
    let mut guard = None;
    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                dir.display(),
                e
            );
            return None;
        }
        let file_appender = tracing_appender::rolling::daily(&dir, "tradedesk.log");
        let (non_blocking, worker) = tracing_appender::non_blocking(file_appender);
        guard = Some(worker);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let json_layer = logging.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let console_layer = (!logging.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .init();
    guard
}

fn breaker_store(config: &AppConfig) -> Arc<FileBreakerStore> {
    Arc::new(FileBreakerStore::new(&config.persistence.breaker_path))
}

fn standalone_guard(config: &AppConfig, clock: &dyn Clock) -> Result<RiskGuard> {
    RiskGuard::new(config.risk.clone(), breaker_store(config), clock.now())
}

/// Build the pipeline around a fixture and the paper broker, then run `date`.
pub async fn run_cycle(config: &AppConfig, date: NaiveDate, fixture: &Path) -> Result<CycleReport> {
    let fixture = MarketFixture::load(fixture).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = EventBus::new();

    let guard = Arc::new(standalone_guard(config, clock.as_ref())?.with_bus(bus.clone()));
    let broker = Arc::new(PaperBroker::new(fixture.portfolio.clone(), Arc::clone(&clock)));
    broker.set_listener(guard.clone()).await;

    let pipeline = Pipeline {
        collector: Collector::new(fixture.registrations()),
        analyst: Analyst::new(config.analyst.clone()),
        strategist: Strategist::new(&StrategyRegistry::with_builtins(), &config.strategies)?,
        manager: PortfolioManager::new(config.sizing.clone(), config.strategies.clone()),
        cio: Cio::new(config.cio.clone()),
        retry: config.producer.clone(),
    };
    let mut coordinator_config: CoordinatorConfig = config.coordinator.clone();
    if coordinator_config.universe.is_empty() {
        coordinator_config.universe = fixture.instruments();
    }

    let reports = Arc::new(JsonlReportSink::new(&config.persistence.report_path));
    let previous = reports.latest_for(date).await?;
    let coordinator = Coordinator::new(
        coordinator_config,
        pipeline,
        guard,
        broker,
        reports,
        clock,
        bus,
    )?;
    if let Some(previous) = previous {
        coordinator.restore_report(&previous).await;
    }
    info!("Running cycle for {}", date);
    let report = coordinator.start_cycle(date).await;
    coordinator.bus().close().await;
    report
}

pub async fn last_report(config: &AppConfig, date: NaiveDate) -> Result<Option<CycleReport>> {
    JsonlReportSink::new(&config.persistence.report_path)
        .latest_for(date)
        .await
}

pub async fn force_halt(config: &AppConfig, reason: &str) -> Result<CircuitBreakerState> {
    let clock = SystemClock;
    let guard = standalone_guard(config, &clock)?;
    guard.restore(clock.now()).await?;
    guard.force_halt(reason, clock.now()).await?;
    Ok(guard.breaker_state().await)
}

pub async fn clear_halt(config: &AppConfig) -> Result<CircuitBreakerState> {
    let clock = SystemClock;
    let guard = standalone_guard(config, &clock)?;
    guard.restore(clock.now()).await?;
    guard.clear_halt(clock.now()).await?;
    Ok(guard.breaker_state().await)
}

pub async fn breaker(config: &AppConfig) -> Result<CircuitBreakerState> {
    let clock = SystemClock;
    standalone_guard(config, &clock)?.restore(clock.now()).await
}

pub fn print_report(report: &CycleReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "Cycle {} for {}: {} (emergency: {})",
        report.cycle_id, report.trading_date, report.status, report.emergency
    );
    if let Some(reason) = &report.abort_reason {
        println!("  aborted: {}", reason);
    }
    println!(
        "  processed {} | excluded {} | intents {}",
        report.processed.len(),
        report.excluded.len(),
        report.intents().count()
    );
    for (symbol, exclusion) in &report.excluded {
        println!("  - {} excluded at {}: {}", symbol, exclusion.stage, exclusion.reason);
    }
    for verdict in report.verdicts() {
        println!(
            "  {} {} {} -> {:?}",
            verdict.symbol, verdict.side, verdict.requested_quantity, verdict.outcome
        );
    }
    for marker in &report.degraded {
        println!("  degraded at {}: {}", marker.stage, marker.reason);
    }
    Ok(())
}

pub fn print_breaker(state: &CircuitBreakerState) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}
