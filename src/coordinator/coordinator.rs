//! Coordinator - drives one daily cycle through its fixed stages
//!
//! The Coordinator owns the cycle registry, the halt control plane and the
//! per-cycle [`CycleContext`]. Producers are fanned out per instrument with
//! `buffer_unordered`, and every stage races its budget and the halt flag
//! with `tokio::select!`:
//!   - Collecting / Analyzing / Strategizing: external producers, retried
//!   - Sizing / Deciding: pure, run on the cycle-start portfolio
//!   - RiskChecking: guard verdicts, then submission of approved orders
//!   - Reporting: one report per cycle, whatever the outcome

use chrono::NaiveDate;
use futures::{FutureExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::ExecutionSink;
use crate::agents::{
    market_regime, wait_for_halt, AnalysisReport, Analyst, Collector, ProduceResult, ProducerRunner,
    RetryPolicy, Strategist,
};
use crate::cio::{Cio, EmergencyLevel};
use crate::error::{DeskError, Result};
use crate::events::{CycleEvent, EventBus, EventPayload, EventStream, Topic};
use crate::persistence::ReportSink;
use crate::portfolio::PortfolioManager;
use crate::risk::{ApprovedOrder, CircuitBreakerState, RiskConfig, RiskGuard};

use super::clock::Clock;
use super::command::{CommandResponse, ControlPlane, CoordinatorCommand};
use super::config::CoordinatorConfig;
use super::report::{CycleReport, ExecutionResult};
use super::state::{
    cycle_id_for, CycleContext, CycleRunState, CycleStage, CycleStatus, CycleStatusView,
    StageOutcome,
};

const SOURCE: &str = "coordinator";

/// Stateless stage workers, built once from configuration
pub struct Pipeline {
    pub collector: Collector,
    pub analyst: Analyst,
    pub strategist: Strategist,
    pub manager: PortfolioManager,
    pub cio: Cio,
    pub retry: RetryPolicy,
}

struct CycleEntry {
    cycle_id: Uuid,
    state: CycleRunState,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Working state of an aborted cycle, kept for resume
    checkpoint: Option<CycleContext>,
}

impl CycleEntry {
    fn view(&self, date: NaiveDate) -> CycleStatusView {
        CycleStatusView {
            cycle_id: self.cycle_id,
            trading_date: date,
            state: self.state,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

type CommandRequest = (CoordinatorCommand, oneshot::Sender<Result<CommandResponse>>);

/// Clonable handle for issuing commands to a spawned coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CommandRequest>,
}

impl CoordinatorHandle {
    pub async fn send(&self, command: CoordinatorCommand) -> Result<CommandResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((command, reply_tx))
            .await
            .map_err(|_| DeskError::Internal("coordinator stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| DeskError::Internal("coordinator dropped the reply".to_string()))?
    }

    pub async fn start_cycle(&self, date: NaiveDate) -> Result<CycleReport> {
        match self.send(CoordinatorCommand::StartCycle { date }).await? {
            CommandResponse::Report(report) => Ok(*report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cycle_status(&self, date: NaiveDate) -> Result<Option<CycleStatusView>> {
        match self.send(CoordinatorCommand::CycleStatus { date }).await? {
            CommandResponse::Status(view) => Ok(view),
            other => Err(unexpected(other)),
        }
    }

    pub async fn force_halt(&self, reason: &str) -> Result<CircuitBreakerState> {
        let command = CoordinatorCommand::ForceHalt {
            reason: reason.to_string(),
        };
        match self.send(command).await? {
            CommandResponse::Breaker(state) => Ok(*state),
            other => Err(unexpected(other)),
        }
    }

    pub async fn clear_halt(&self) -> Result<CircuitBreakerState> {
        match self.send(CoordinatorCommand::ClearHalt).await? {
            CommandResponse::Breaker(state) => Ok(*state),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: CommandResponse) -> DeskError {
    DeskError::Internal(format!("unexpected coordinator response: {:?}", response))
}

/// Main coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    pipeline: Pipeline,
    guard: Arc<RiskGuard>,
    sink: Arc<dyn ExecutionSink>,
    reports: Arc<dyn ReportSink>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    control: ControlPlane,
    cycles: RwLock<HashMap<NaiveDate, CycleEntry>>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        pipeline: Pipeline,
        guard: Arc<RiskGuard>,
        sink: Arc<dyn ExecutionSink>,
        reports: Arc<dyn ReportSink>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        if pipeline.collector.is_empty() {
            return Err(DeskError::InvalidConfig(
                "at least one data source is required".to_string(),
            ));
        }
        Ok(Self {
            config,
            pipeline,
            guard,
            sink,
            reports,
            clock,
            bus,
            control: ControlPlane::new(),
            cycles: RwLock::new(HashMap::new()),
        })
    }

    /// Serve commands from a channel. Each command runs on its own task so a
    /// long cycle never blocks status queries.
    pub fn spawn(self: Arc<Self>) -> (CoordinatorHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<CommandRequest>(32);
        let task = tokio::spawn(async move {
            while let Some((command, reply)) = rx.recv().await {
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    let result = this.execute(command).await;
                    let _ = reply.send(result);
                });
            }
            debug!("Coordinator command channel closed");
        });
        (CoordinatorHandle { tx }, task)
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn guard(&self) -> &Arc<RiskGuard> {
        &self.guard
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn execute(&self, command: CoordinatorCommand) -> Result<CommandResponse> {
        match command {
            CoordinatorCommand::StartCycle { date } => self
                .start_cycle(date)
                .await
                .map(|r| CommandResponse::Report(Box::new(r))),
            CoordinatorCommand::CycleStatus { date } => {
                Ok(CommandResponse::Status(self.cycle_status(date).await))
            }
            CoordinatorCommand::ForceHalt { reason } => self
                .force_halt(&reason)
                .await
                .map(|s| CommandResponse::Breaker(Box::new(s))),
            CoordinatorCommand::ClearHalt => self
                .clear_halt()
                .await
                .map(|s| CommandResponse::Breaker(Box::new(s))),
        }
    }

    /// Run the cycle for `date` to its report.
    ///
    /// A date that is running or already finished successfully is a
    /// conflict. An aborted date resumes after its last completed producer
    /// stage.
    pub async fn start_cycle(&self, date: NaiveDate) -> Result<CycleReport> {
        let mut ctx = self.claim(date).await?;
        Ok(self.drive(&mut ctx).await)
    }

    pub async fn cycle_status(&self, date: NaiveDate) -> Option<CycleStatusView> {
        self.cycles.read().await.get(&date).map(|e| e.view(date))
    }

    /// Mark `date` as finished by an earlier process, so it cannot be re-run.
    pub async fn restore_report(&self, report: &CycleReport) {
        if report.status == CycleStatus::Aborted {
            return;
        }
        let mut cycles = self.cycles.write().await;
        cycles.entry(report.trading_date).or_insert(CycleEntry {
            cycle_id: report.cycle_id,
            state: CycleRunState::Finished {
                status: report.status,
            },
            started_at: report.started_at,
            finished_at: Some(report.finished_at),
            checkpoint: None,
        });
    }

    /// Raise the halt flag and put the breaker in `Halted`.
    pub async fn force_halt(&self, reason: &str) -> Result<CircuitBreakerState> {
        let now = self.clock.now();
        self.control.request_halt(reason).await;
        self.guard.restore(now).await?;
        if !self.guard.force_halt(reason, now).await? {
            info!("Breaker already halted");
        }
        Ok(self.guard.breaker_state().await)
    }

    pub async fn clear_halt(&self) -> Result<CircuitBreakerState> {
        let now = self.clock.now();
        self.guard.restore(now).await?;
        if !self.guard.clear_halt(now).await? {
            info!("Breaker was not halted");
        }
        self.control.clear().await;
        Ok(self.guard.breaker_state().await)
    }

    /// Swap risk limits. Refused while any cycle is in progress.
    pub async fn reload_risk_limits(&self, config: RiskConfig) -> Result<()> {
        let cycles = self.cycles.read().await;
        if let Some((date, _)) = cycles
            .iter()
            .find(|(_, e)| matches!(e.state, CycleRunState::InProgress { .. }))
        {
            return Err(DeskError::CycleConflict {
                date: date.to_string(),
                status: "in progress".to_string(),
            });
        }
        self.guard.reload_limits(config).await
    }

    async fn claim(&self, date: NaiveDate) -> Result<CycleContext> {
        let now = self.clock.now();
        let mut cycles = self.cycles.write().await;
        let checkpoint = match cycles.get_mut(&date) {
            Some(entry) => match entry.state {
                CycleRunState::InProgress { .. } => {
                    return Err(DeskError::CycleConflict {
                        date: date.to_string(),
                        status: "in progress".to_string(),
                    })
                }
                CycleRunState::Finished {
                    status: CycleStatus::Aborted,
                } => entry.checkpoint.take(),
                CycleRunState::Finished { status } => {
                    return Err(DeskError::CycleConflict {
                        date: date.to_string(),
                        status: status.to_string(),
                    })
                }
            },
            None => None,
        };

        let ctx = match checkpoint {
            Some(mut ctx) => {
                ctx.rewind_for_resume();
                ctx.started_at = now;
                info!(
                    cycle_id = %ctx.cycle_id,
                    resume_after = ?ctx.last_completed,
                    "Resuming aborted cycle for {}",
                    date
                );
                ctx
            }
            None => CycleContext::new(
                date,
                self.config.session.window_for(date),
                self.config.universe.clone(),
                now,
            ),
        };

        cycles.insert(
            date,
            CycleEntry {
                cycle_id: cycle_id_for(date),
                state: CycleRunState::InProgress {
                    stage: CycleStage::Idle,
                },
                started_at: now,
                finished_at: None,
                checkpoint: None,
            },
        );
        Ok(ctx)
    }

    async fn drive(&self, ctx: &mut CycleContext) -> CycleReport {
        info!(
            cycle_id = %ctx.cycle_id,
            instruments = ctx.universe.len(),
            "Cycle for {} starting",
            ctx.trading_date
        );
        let mut failures = self
            .bus
            .subscribe_cycle(Topic::ProducerFailed, SOURCE, ctx.cycle_id)
            .await;
        self.publish(
            ctx,
            EventPayload::CycleStarted {
                trading_date: ctx.trading_date,
            },
        )
        .await;

        let result = self.run_stages(ctx, &mut failures).await;
        drain_failures(ctx, &mut failures);

        let (status, abort_reason) = match result {
            Ok(()) if ctx.is_degraded() => (CycleStatus::Degraded, None),
            Ok(()) => (CycleStatus::Complete, None),
            Err(e) => {
                error!(cycle_id = %ctx.cycle_id, class = %e.class(), "Cycle aborted: {}", e);
                (CycleStatus::Aborted, Some(e.to_string()))
            }
        };

        self.enter(ctx, CycleStage::Reporting).await;
        let started = Instant::now();
        let finished_at = self.clock.now();
        if ctx.breaker.is_some() {
            ctx.breaker = Some(self.guard.breaker_state().await);
        }
        let report = CycleReport::from_context(ctx, status, finished_at, abort_reason);
        let budget = self.budget(CycleStage::Reporting);
        let outcome = match tokio::time::timeout(budget, self.reports.publish(&report)).await {
            Ok(Ok(())) => StageOutcome::Completed,
            Ok(Err(e)) => {
                error!("Failed to publish report for {}: {}", ctx.trading_date, e);
                StageOutcome::Completed
            }
            Err(_) => {
                error!("Report publish for {} timed out", ctx.trading_date);
                StageOutcome::TimedOut
            }
        };
        self.finish_stage(ctx, CycleStage::Reporting, outcome, started)
            .await;

        {
            let mut cycles = self.cycles.write().await;
            if let Some(entry) = cycles.get_mut(&ctx.trading_date) {
                entry.state = CycleRunState::Finished { status };
                entry.finished_at = Some(finished_at);
                entry.checkpoint = (status == CycleStatus::Aborted).then(|| ctx.clone());
            }
        }
        ctx.stage = CycleStage::Idle;
        self.publish(ctx, EventPayload::CycleCompleted { status }).await;
        self.bus.close_cycle(ctx.cycle_id).await;
        info!(
            cycle_id = %ctx.cycle_id,
            status = %status,
            processed = report.processed.len(),
            excluded = report.excluded.len(),
            "Cycle for {} finished",
            ctx.trading_date
        );
        report
    }

    async fn run_stages(&self, ctx: &mut CycleContext, failures: &mut EventStream) -> Result<()> {
        let now = self.clock.now();
        let mut portfolio = self
            .sink
            .current_holdings()
            .await
            .map_err(|e| DeskError::PortfolioUnavailable(e.to_string()))?;
        portfolio.roll_period(ctx.trading_date);
        let breaker = self.guard.begin_cycle(ctx.cycle_id, &portfolio, now).await?;
        ctx.portfolio = Some(portfolio);
        ctx.breaker = Some(breaker);

        let runner = ProducerRunner::new(
            self.pipeline.retry.clone(),
            self.bus.clone(),
            self.control.subscribe(),
            ctx.cycle_id,
        );
        for stage in [
            CycleStage::Collecting,
            CycleStage::Analyzing,
            CycleStage::Strategizing,
        ] {
            if ctx.last_completed.is_some_and(|done| done >= stage) {
                self.enter(ctx, stage).await;
                self.finish_stage(ctx, stage, StageOutcome::Resumed, Instant::now())
                    .await;
                continue;
            }
            if ctx.halted || self.control.is_halted() {
                ctx.halted = true;
                self.enter(ctx, stage).await;
                exclude_unfinished(ctx, stage, "skipped after halt");
                self.finish_stage(ctx, stage, StageOutcome::Skipped, Instant::now())
                    .await;
                continue;
            }
            self.run_producer_stage(ctx, &runner, stage).await;
            drain_failures(ctx, failures);
        }

        self.size(ctx).await?;
        self.decide(ctx).await?;
        self.check_and_submit(ctx).await
    }

    async fn run_producer_stage(&self, ctx: &mut CycleContext, runner: &ProducerRunner, stage: CycleStage) {
        self.enter(ctx, stage).await;
        let started = Instant::now();
        let symbols = ctx.active_symbols();
        let shared = &*ctx;

        let outcome = match stage {
            CycleStage::Collecting => {
                let collector = &self.pipeline.collector;
                let (results, outcome) = self
                    .fan_out(stage, symbols, move |symbol| async move {
                        let result = collector.collect(shared, runner, &symbol).await;
                        (symbol, result)
                    })
                    .await;
                for (symbol, result) in results {
                    match result {
                        Ok(collected) => {
                            if !collected.missing.is_empty() {
                                ctx.mark_degraded(
                                    stage,
                                    format!("{}: {}", symbol, collected.missing.join("; ")),
                                );
                            }
                            self.publish(
                                ctx,
                                EventPayload::SnapshotCollected {
                                    symbol: symbol.clone(),
                                    sources: collected.snapshot.sources.clone(),
                                },
                            )
                            .await;
                            ctx.snapshots.insert(symbol, Arc::new(collected.snapshot));
                        }
                        Err(failure) => ctx.exclude(&symbol, stage, failure.to_string()),
                    }
                }
                outcome
            }
            CycleStage::Analyzing => {
                let analyst = &self.pipeline.analyst;
                let inputs: Vec<_> = symbols
                    .iter()
                    .filter_map(|s| shared.snapshots.get(s).map(|snap| (s.clone(), Arc::clone(snap))))
                    .collect();
                let (results, outcome) = self
                    .fan_out(stage, inputs, move |(symbol, snapshot)| async move {
                        let result = runner.call(shared, analyst, &symbol, &snapshot).await;
                        (symbol, result)
                    })
                    .await;
                for (symbol, result) in results {
                    match result {
                        Ok(report) => {
                            self.publish(
                                ctx,
                                EventPayload::AnalysisReady {
                                    symbol: symbol.clone(),
                                },
                            )
                            .await;
                            ctx.reports.insert(symbol, Arc::new(report));
                        }
                        Err(failure) => ctx.exclude(&symbol, stage, failure.to_string()),
                    }
                }
                outcome
            }
            _ => {
                let strategist = &self.pipeline.strategist;
                let inputs: Vec<_> = symbols
                    .iter()
                    .filter_map(|s| shared.reports.get(s).map(|r| (s.clone(), Arc::clone(r))))
                    .collect();
                let (results, outcome) = self
                    .fan_out(stage, inputs, move |(symbol, report)| async move {
                        let result = runner.call(shared, strategist, &symbol, &report).await;
                        (symbol, result)
                    })
                    .await;
                for (symbol, result) in results {
                    match result {
                        Ok(signals) => {
                            self.publish(
                                ctx,
                                EventPayload::SignalsReady {
                                    symbol: symbol.clone(),
                                    count: signals.len(),
                                },
                            )
                            .await;
                            ctx.signals.insert(symbol, signals);
                        }
                        Err(failure) => ctx.exclude(&symbol, stage, failure.to_string()),
                    }
                }
                outcome
            }
        };

        let reason = match outcome {
            StageOutcome::Interrupted => "halted before completion".to_string(),
            _ => format!("{} stage timed out", stage),
        };
        let unfinished = exclude_unfinished(ctx, stage, &reason);
        match outcome {
            StageOutcome::TimedOut => {
                warn!(stage = %stage, unfinished, "Stage budget exhausted");
                ctx.mark_degraded(
                    stage,
                    format!("timed out with {} instruments unfinished", unfinished),
                );
            }
            StageOutcome::Interrupted => {
                warn!(stage = %stage, "Halt observed, abandoning stage");
                ctx.halted = true;
            }
            _ => {}
        }
        self.finish_stage(ctx, stage, outcome, started).await;
    }

    /// Run `call` for every input with bounded concurrency until all finish,
    /// the stage budget elapses or a halt is raised. Partial results are kept.
    async fn fan_out<I, T, F, Fut>(
        &self,
        stage: CycleStage,
        inputs: Vec<I>,
        call: F,
    ) -> (Vec<(String, ProduceResult<T>)>, StageOutcome)
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = (String, ProduceResult<T>)>,
    {
        let mut stream = futures::stream::iter(inputs.into_iter().map(call))
            .buffer_unordered(self.config.max_concurrency);
        let deadline = tokio::time::sleep(self.budget(stage));
        tokio::pin!(deadline);
        let halt = wait_for_halt(self.control.subscribe());
        tokio::pin!(halt);

        let mut results = Vec::new();
        let outcome = loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(item) => results.push(item),
                    None => break StageOutcome::Completed,
                },
                _ = &mut deadline => break StageOutcome::TimedOut,
                _ = &mut halt => break StageOutcome::Interrupted,
            }
        };
        (results, outcome)
    }

    async fn size(&self, ctx: &mut CycleContext) -> Result<()> {
        self.enter(ctx, CycleStage::Sizing).await;
        let started = Instant::now();
        let reports: BTreeMap<_, _> = ctx
            .reports
            .iter()
            .filter(|(symbol, _)| !ctx.is_excluded(symbol) && ctx.signals.contains_key(*symbol))
            .map(|(symbol, report)| (symbol.clone(), Arc::clone(report)))
            .collect();
        let analyzed: Vec<&AnalysisReport> = ctx
            .reports
            .iter()
            .filter(|(symbol, _)| !ctx.is_excluded(symbol))
            .map(|(_, report)| report.as_ref())
            .collect();
        let market = market_regime(&analyzed, self.pipeline.analyst.benchmark());
        let thesis = self.pipeline.strategist.thesis(&market);
        info!(
            cycle_id = %ctx.cycle_id,
            regime = %thesis.regime,
            confidence = %thesis.confidence,
            cash_target = %thesis.cash_target,
            "Investment thesis set"
        );
        if let Some(portfolio) = ctx.portfolio.as_mut() {
            for (symbol, report) in &reports {
                portfolio.mark(symbol, report.price);
            }
        }
        let proposals = self.pipeline.manager.size(
            &reports,
            &ctx.signals,
            ctx.portfolio.as_ref(),
            Some(&thesis),
        )?;
        ctx.thesis = Some(thesis);
        for proposal in proposals.values() {
            self.publish(ctx, EventPayload::ProposalIssued(proposal.clone()))
                .await;
        }
        debug!(proposals = proposals.len(), "Sizing done");
        ctx.proposals = proposals;
        self.finish_stage(ctx, CycleStage::Sizing, StageOutcome::Completed, started)
            .await;
        Ok(())
    }

    async fn decide(&self, ctx: &mut CycleContext) -> Result<()> {
        self.enter(ctx, CycleStage::Deciding).await;
        let started = Instant::now();
        if self.control.is_halted() {
            ctx.halted = true;
        }
        let emergency = match &ctx.breaker {
            _ if ctx.halted => EmergencyLevel::Liquidate,
            Some(b) if b.is_halted() => EmergencyLevel::Liquidate,
            Some(b) if b.is_paused() => EmergencyLevel::Defensive,
            _ => EmergencyLevel::None,
        };
        if emergency != EmergencyLevel::None {
            warn!(cycle_id = %ctx.cycle_id, level = %emergency, "Deciding under emergency");
        }
        let portfolio = ctx.portfolio.as_ref().ok_or_else(|| {
            DeskError::PortfolioUnavailable("portfolio state missing at deciding".to_string())
        })?;
        let decision =
            self.pipeline
                .cio
                .decide(ctx.trading_date, &ctx.proposals, portfolio, emergency);
        for intent in &decision.intents {
            self.publish(ctx, EventPayload::IntentDecided(intent.clone()))
                .await;
        }
        info!(
            intents = decision.intents.len(),
            dropped = decision.dropped.len(),
            deferred = decision.deferred.len(),
            "CIO decision ready"
        );
        ctx.decision = Some(decision);
        self.finish_stage(ctx, CycleStage::Deciding, StageOutcome::Completed, started)
            .await;
        Ok(())
    }

    async fn check_and_submit(&self, ctx: &mut CycleContext) -> Result<()> {
        self.enter(ctx, CycleStage::RiskChecking).await;
        let started = Instant::now();
        let budget = self.budget(CycleStage::RiskChecking);
        let intents = ctx
            .decision
            .as_ref()
            .map(|d| d.intents.clone())
            .unwrap_or_default();
        let portfolio = ctx.portfolio.clone().ok_or_else(|| {
            DeskError::PortfolioUnavailable("portfolio state missing at risk check".to_string())
        })?;

        let evaluation = self
            .guard
            .evaluate_batch(
                ctx.cycle_id,
                &intents,
                &portfolio,
                ctx.halted || self.control.is_halted(),
                self.clock.now(),
            )
            .await;
        for verdict in &evaluation.verdicts {
            self.publish(ctx, EventPayload::VerdictIssued(verdict.clone()))
                .await;
        }
        ctx.verdicts = evaluation.verdicts;

        let pending: Vec<String> = evaluation
            .approved
            .iter()
            .map(|o| o.symbol().to_string())
            .collect();
        let mut executions = BTreeMap::new();
        let remaining = budget.saturating_sub(started.elapsed());
        let submitted = tokio::time::timeout(
            remaining,
            self.submit_all(ctx.cycle_id, evaluation.approved, &mut executions),
        )
        .await;

        let outcome = match submitted {
            Ok(()) => StageOutcome::Completed,
            Err(_) => {
                for symbol in pending {
                    executions
                        .entry(symbol)
                        .or_insert_with(|| ExecutionResult::NotSubmitted {
                            reason: "risk checking stage timed out".to_string(),
                        });
                }
                ctx.mark_degraded(CycleStage::RiskChecking, "order submission timed out");
                StageOutcome::TimedOut
            }
        };
        if executions
            .values()
            .any(|e| matches!(e, ExecutionResult::NotSubmitted { .. }))
            && outcome == StageOutcome::Completed
        {
            ctx.mark_degraded(CycleStage::RiskChecking, "some approved orders were not submitted");
        }
        ctx.executions = executions;
        self.finish_stage(ctx, CycleStage::RiskChecking, outcome, started)
            .await;
        Ok(())
    }

    async fn submit_all(
        &self,
        cycle_id: Uuid,
        orders: Vec<ApprovedOrder>,
        executions: &mut BTreeMap<String, ExecutionResult>,
    ) {
        for order in orders {
            let symbol = order.symbol().to_string();
            let intent_id = order.intent_id();
            if self.control.is_halted() && !order.intent().liquidating {
                executions.insert(
                    symbol,
                    ExecutionResult::NotSubmitted {
                        reason: "halt raised before submission".to_string(),
                    },
                );
                continue;
            }
            let result = match self.sink.submit(order).await {
                Ok(ack) => {
                    self.bus
                        .publish(CycleEvent::new(
                            cycle_id,
                            SOURCE,
                            EventPayload::OrderSubmitted(ack.clone()),
                        ))
                        .await;
                    ExecutionResult::Submitted { ack }
                }
                Err(e) => {
                    warn!("Order for {} failed: {}", symbol, e);
                    self.bus
                        .publish(CycleEvent::new(
                            cycle_id,
                            SOURCE,
                            EventPayload::OrderFailed {
                                intent_id,
                                symbol: symbol.clone(),
                                reason: e.to_string(),
                            },
                        ))
                        .await;
                    match e {
                        DeskError::OrderRejected(reason) => ExecutionResult::BrokerRejected { reason },
                        other => ExecutionResult::NotSubmitted {
                            reason: other.to_string(),
                        },
                    }
                }
            };
            executions.insert(symbol, result);
        }
    }

    fn budget(&self, stage: CycleStage) -> Duration {
        self.config
            .stage_timeouts
            .for_stage(stage)
            .unwrap_or(Duration::MAX)
    }

    async fn enter(&self, ctx: &mut CycleContext, stage: CycleStage) {
        ctx.stage = stage;
        if let Some(entry) = self.cycles.write().await.get_mut(&ctx.trading_date) {
            entry.state = CycleRunState::InProgress { stage };
        }
        debug!(cycle_id = %ctx.cycle_id, stage = %stage, "Entering stage");
        self.publish(ctx, EventPayload::StageEntered { stage }).await;
    }

    async fn finish_stage(
        &self,
        ctx: &mut CycleContext,
        stage: CycleStage,
        outcome: StageOutcome,
        started: Instant,
    ) {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        ctx.record_stage(stage, outcome, elapsed_ms);
        self.publish(ctx, EventPayload::StageCompleted { stage, outcome })
            .await;
    }

    async fn publish(&self, ctx: &CycleContext, payload: EventPayload) {
        self.bus
            .publish(CycleEvent::new(ctx.cycle_id, SOURCE, payload))
            .await;
    }
}

/// Exclude active instruments that have no output for `stage`. Returns how many.
fn exclude_unfinished(ctx: &mut CycleContext, stage: CycleStage, reason: &str) -> usize {
    let unfinished: Vec<String> = ctx
        .active_symbols()
        .into_iter()
        .filter(|s| match stage {
            CycleStage::Collecting => !ctx.snapshots.contains_key(s),
            CycleStage::Analyzing => !ctx.reports.contains_key(s),
            _ => !ctx.signals.contains_key(s),
        })
        .collect();
    for symbol in &unfinished {
        ctx.exclude(symbol, stage, reason);
    }
    unfinished.len()
}

/// Move terminal producer failures for this cycle from the bus into the context.
fn drain_failures(ctx: &mut CycleContext, failures: &mut EventStream) {
    while let Some(Some(event)) = failures.next().now_or_never() {
        if event.cycle_id != ctx.cycle_id {
            continue;
        }
        if let EventPayload::ProducerFailed(failure) = event.payload {
            if failure.terminal {
                ctx.failures.push(failure);
            }
        }
    }
}
