//! Cycle State - stage machine and the per-cycle working context

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::agents::{AnalysisReport, InvestmentThesis};
use crate::cio::CioDecision;
use crate::domain::{MarketSnapshot, PortfolioState, PositionProposal, SessionWindow, Signal};
use crate::events::ProducerFailedEvent;
use crate::risk::{CircuitBreakerState, RiskVerdict};

use super::report::ExecutionResult;

/// Stages of one daily cycle, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    Idle,
    Collecting,
    Analyzing,
    Strategizing,
    Sizing,
    Deciding,
    RiskChecking,
    Reporting,
}

impl CycleStage {
    pub fn next(self) -> CycleStage {
        match self {
            CycleStage::Idle => CycleStage::Collecting,
            CycleStage::Collecting => CycleStage::Analyzing,
            CycleStage::Analyzing => CycleStage::Strategizing,
            CycleStage::Strategizing => CycleStage::Sizing,
            CycleStage::Sizing => CycleStage::Deciding,
            CycleStage::Deciding => CycleStage::RiskChecking,
            CycleStage::RiskChecking => CycleStage::Reporting,
            CycleStage::Reporting => CycleStage::Idle,
        }
    }
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CycleStage::Idle => "idle",
            CycleStage::Collecting => "collecting",
            CycleStage::Analyzing => "analyzing",
            CycleStage::Strategizing => "strategizing",
            CycleStage::Sizing => "sizing",
            CycleStage::Deciding => "deciding",
            CycleStage::RiskChecking => "risk_checking",
            CycleStage::Reporting => "reporting",
        };
        write!(f, "{}", s)
    }
}

/// Final status of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Complete,
    Degraded,
    Aborted,
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStatus::Complete => write!(f, "complete"),
            CycleStatus::Degraded => write!(f, "degraded"),
            CycleStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// How a stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    /// Stage timeout elapsed; partial results kept
    TimedOut,
    /// External halt observed mid-stage
    Interrupted,
    /// Not run because of a halt or an earlier resume point
    Skipped,
    Resumed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: CycleStage,
    pub outcome: StageOutcome,
    pub elapsed_ms: u64,
}

/// Why an instrument dropped out of the cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub stage: CycleStage,
    pub reason: String,
}

/// Note that a stage ran with incomplete results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedMarker {
    pub stage: CycleStage,
    pub reason: String,
}

/// Working state of one cycle, owned exclusively by the coordinator.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub cycle_id: Uuid,
    pub trading_date: NaiveDate,
    pub session: SessionWindow,
    pub started_at: DateTime<Utc>,
    pub stage: CycleStage,
    /// Last stage whose results are complete and reusable on resume
    pub last_completed: Option<CycleStage>,
    pub universe: Vec<String>,
    pub snapshots: BTreeMap<String, Arc<MarketSnapshot>>,
    pub reports: BTreeMap<String, Arc<AnalysisReport>>,
    pub signals: BTreeMap<String, Vec<Signal>>,
    /// Set at sizing from the analyzed instruments' regime
    pub thesis: Option<InvestmentThesis>,
    pub proposals: BTreeMap<String, PositionProposal>,
    pub decision: Option<CioDecision>,
    pub verdicts: Vec<RiskVerdict>,
    pub executions: BTreeMap<String, ExecutionResult>,
    pub exclusions: BTreeMap<String, Exclusion>,
    pub failures: Vec<ProducerFailedEvent>,
    pub degraded: Vec<DegradedMarker>,
    pub stages: Vec<StageRecord>,
    pub portfolio: Option<PortfolioState>,
    pub breaker: Option<CircuitBreakerState>,
    pub halted: bool,
}

impl CycleContext {
    pub fn new(
        trading_date: NaiveDate,
        session: SessionWindow,
        universe: Vec<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            cycle_id: cycle_id_for(trading_date),
            trading_date,
            session,
            started_at,
            stage: CycleStage::Idle,
            last_completed: None,
            universe,
            snapshots: BTreeMap::new(),
            reports: BTreeMap::new(),
            signals: BTreeMap::new(),
            thesis: None,
            proposals: BTreeMap::new(),
            decision: None,
            verdicts: Vec::new(),
            executions: BTreeMap::new(),
            exclusions: BTreeMap::new(),
            failures: Vec::new(),
            degraded: Vec::new(),
            stages: Vec::new(),
            portfolio: None,
            breaker: None,
            halted: false,
        }
    }

    /// Exclude an instrument from later stages. The first reason sticks.
    pub fn exclude(&mut self, symbol: &str, stage: CycleStage, reason: impl Into<String>) {
        self.exclusions
            .entry(symbol.to_string())
            .or_insert_with(|| Exclusion {
                stage,
                reason: reason.into(),
            });
    }

    pub fn is_excluded(&self, symbol: &str) -> bool {
        self.exclusions.contains_key(symbol)
    }

    /// Universe members still in play, in universe order
    pub fn active_symbols(&self) -> Vec<String> {
        self.universe
            .iter()
            .filter(|s| !self.is_excluded(s))
            .cloned()
            .collect()
    }

    pub fn mark_degraded(&mut self, stage: CycleStage, reason: impl Into<String>) {
        self.degraded.push(DegradedMarker {
            stage,
            reason: reason.into(),
        });
    }

    pub fn is_degraded(&self) -> bool {
        self.halted || !self.degraded.is_empty() || !self.exclusions.is_empty()
    }

    pub fn record_stage(&mut self, stage: CycleStage, outcome: StageOutcome, elapsed_ms: u64) {
        self.stages.push(StageRecord {
            stage,
            outcome,
            elapsed_ms,
        });
        if outcome == StageOutcome::Completed || outcome == StageOutcome::Resumed {
            self.last_completed = Some(stage);
        }
    }

    /// Drop everything produced after the last reusable producer stage so the
    /// cycle can run again from there.
    pub fn rewind_for_resume(&mut self) {
        let keep = self
            .last_completed
            .map(|s| s.min(CycleStage::Strategizing))
            .unwrap_or(CycleStage::Idle);
        if keep < CycleStage::Strategizing {
            self.signals.clear();
        }
        if keep < CycleStage::Analyzing {
            self.reports.clear();
        }
        if keep < CycleStage::Collecting {
            self.snapshots.clear();
            self.exclusions.clear();
            self.failures.clear();
        }
        self.exclusions.retain(|_, e| e.stage <= keep);
        self.failures.retain(|f| match f.producer.as_str() {
            "analyst" => keep >= CycleStage::Analyzing,
            "strategist" => keep >= CycleStage::Strategizing,
            _ => true,
        });
        self.thesis = None;
        self.proposals.clear();
        self.decision = None;
        self.verdicts.clear();
        self.executions.clear();
        self.degraded.retain(|d| d.stage <= keep);
        self.stages.clear();
        self.portfolio = None;
        self.breaker = None;
        self.halted = false;
        self.last_completed = Some(keep).filter(|s| *s != CycleStage::Idle);
        self.stage = CycleStage::Idle;
    }
}

/// Deterministic cycle id for a trading date
pub fn cycle_id_for(date: NaiveDate) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("cycle:{}", date).as_bytes())
}

/// Externally visible state of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CycleRunState {
    InProgress { stage: CycleStage },
    Finished { status: CycleStatus },
}

/// Answer to `cycle_status(date)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStatusView {
    pub cycle_id: Uuid,
    pub trading_date: NaiveDate,
    pub state: CycleRunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
