//! Cycle Report - the one artifact every cycle produces

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::state::{CycleContext, CycleStatus, DegradedMarker, Exclusion, StageRecord};
use crate::agents::InvestmentThesis;
use crate::cio::{DroppedProposal, EmergencyLevel};
use crate::domain::{OrderAck, OrderIntent, PositionProposal};
use crate::events::ProducerFailedEvent;
use crate::risk::{CircuitBreakerState, RiskVerdict};

/// What happened to an approved order at the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExecutionResult {
    Submitted { ack: OrderAck },
    BrokerRejected { reason: String },
    NotSubmitted { reason: String },
}

/// Everything the cycle decided about one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentOutcome {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded: Option<Exclusion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<PositionProposal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<OrderIntent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<RiskVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub trading_date: NaiveDate,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub emergency: EmergencyLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thesis: Option<InvestmentThesis>,
    pub stages: Vec<StageRecord>,
    pub degraded: Vec<DegradedMarker>,
    /// Instruments that made it through collection and analysis
    pub processed: Vec<String>,
    pub excluded: BTreeMap<String, Exclusion>,
    pub failures: Vec<ProducerFailedEvent>,
    pub instruments: Vec<InstrumentOutcome>,
    pub dropped: Vec<DroppedProposal>,
    pub deferred: Vec<String>,
    /// Breaker state after the cycle's fills
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<CircuitBreakerState>,
}

impl CycleReport {
    pub fn from_context(
        ctx: &CycleContext,
        status: CycleStatus,
        finished_at: DateTime<Utc>,
        abort_reason: Option<String>,
    ) -> Self {
        let decision = ctx.decision.as_ref();
        // Emergency liquidation can reach holdings outside the universe.
        let mut symbols = ctx.universe.clone();
        if let Some(d) = decision {
            for intent in &d.intents {
                if !symbols.contains(&intent.symbol) {
                    symbols.push(intent.symbol.clone());
                }
            }
        }
        let instruments = symbols
            .iter()
            .map(|symbol| InstrumentOutcome {
                symbol: symbol.clone(),
                excluded: ctx.exclusions.get(symbol).cloned(),
                proposal: ctx.proposals.get(symbol).cloned(),
                intent: decision.and_then(|d| d.intent_for(symbol)).cloned(),
                verdict: ctx.verdicts.iter().find(|v| &v.symbol == symbol).cloned(),
                execution: ctx.executions.get(symbol).cloned(),
            })
            .collect();

        Self {
            cycle_id: ctx.cycle_id,
            trading_date: ctx.trading_date,
            status,
            started_at: ctx.started_at,
            finished_at,
            abort_reason,
            emergency: decision.map(|d| d.emergency).unwrap_or(EmergencyLevel::None),
            thesis: ctx.thesis.clone(),
            stages: ctx.stages.clone(),
            degraded: ctx.degraded.clone(),
            processed: ctx.active_symbols(),
            excluded: ctx.exclusions.clone(),
            failures: ctx.failures.clone(),
            instruments,
            dropped: decision.map(|d| d.dropped.clone()).unwrap_or_default(),
            deferred: decision.map(|d| d.deferred.clone()).unwrap_or_default(),
            breaker: ctx.breaker.clone(),
        }
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentOutcome> {
        self.instruments.iter().find(|i| i.symbol == symbol)
    }

    pub fn verdicts(&self) -> impl Iterator<Item = &RiskVerdict> {
        self.instruments.iter().filter_map(|i| i.verdict.as_ref())
    }

    pub fn intents(&self) -> impl Iterator<Item = &OrderIntent> {
        self.instruments.iter().filter_map(|i| i.intent.as_ref())
    }
}
