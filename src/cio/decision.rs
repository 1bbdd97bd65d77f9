//! CIO - reconciles proposals into one ordered list of order intents
//!
//! Pure and deterministic: the same proposals, portfolio and emergency level
//! always produce the same intents in the same order.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::domain::{
    OrderIntent, OrderSide, PortfolioState, PositionProposal, PriceSpec, ProposalKind, Urgency,
};

/// Emergency override applied to the whole decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyLevel {
    None,
    /// Buys suspended, sell proposals kept (circuit breaker paused)
    Defensive,
    /// Buys suspended and every long position closed (halt flag set)
    Liquidate,
}

impl std::fmt::Display for EmergencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmergencyLevel::None => write!(f, "none"),
            EmergencyLevel::Defensive => write!(f, "defensive"),
            EmergencyLevel::Liquidate => write!(f, "liquidate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceMode {
    Market,
    Limit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CioConfig {
    /// Cap on risk-increasing intents per cycle; liquidations are never capped
    pub max_daily_orders: usize,
    /// Buys at or above this confidence get normal urgency, below it low
    pub high_conviction: Decimal,
    pub price_mode: PriceMode,
    /// Limit price offset from the reference price, in basis points
    pub limit_offset_bps: u32,
}

impl Default for CioConfig {
    fn default() -> Self {
        Self {
            max_daily_orders: 20,
            high_conviction: Decimal::new(75, 2),
            price_mode: PriceMode::Market,
            limit_offset_bps: 20,
        }
    }
}

/// A proposal the CIO did not turn into an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedProposal {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CioDecision {
    pub emergency: EmergencyLevel,
    /// In execution order
    pub intents: Vec<OrderIntent>,
    pub dropped: Vec<DroppedProposal>,
    /// Over the daily order cap
    pub deferred: Vec<String>,
}

impl CioDecision {
    pub fn intent_for(&self, symbol: &str) -> Option<&OrderIntent> {
        self.intents.iter().find(|i| i.symbol == symbol)
    }
}

struct Candidate {
    symbol: String,
    sector: String,
    side: OrderSide,
    quantity: u64,
    reference_price: Decimal,
    confidence: Decimal,
    urgency: Urgency,
}

pub struct Cio {
    config: CioConfig,
}

/// Full closes for every long holding
fn liquidation_closes(
    portfolio: &PortfolioState,
    proposals: &BTreeMap<String, PositionProposal>,
) -> Vec<Candidate> {
    portfolio
        .holdings
        .iter()
        .filter(|(_, holding)| holding.quantity > 0)
        .map(|(symbol, holding)| Candidate {
            symbol: symbol.clone(),
            sector: holding.sector.clone(),
            side: OrderSide::Sell,
            quantity: holding.quantity.unsigned_abs(),
            reference_price: proposals
                .get(symbol)
                .map(|p| p.reference_price)
                .unwrap_or(holding.market_price),
            confidence: Decimal::ONE,
            urgency: Urgency::Critical,
        })
        .collect()
}

impl Cio {
    pub fn new(config: CioConfig) -> Self {
        Self { config }
    }

    pub fn decide(
        &self,
        trading_date: NaiveDate,
        proposals: &BTreeMap<String, PositionProposal>,
        portfolio: &PortfolioState,
        emergency: EmergencyLevel,
    ) -> CioDecision {
        let mut candidates: BTreeMap<String, Candidate> = BTreeMap::new();
        let mut dropped = Vec::new();

        for (symbol, p) in proposals {
            if p.quantity_delta == 0 {
                continue;
            }
            let side = if p.quantity_delta > 0 {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            if side == OrderSide::Buy && emergency != EmergencyLevel::None {
                dropped.push(DroppedProposal {
                    symbol: symbol.clone(),
                    reason: format!("emergency {}: buys suspended", emergency),
                });
                continue;
            }
            candidates.insert(
                symbol.clone(),
                Candidate {
                    symbol: symbol.clone(),
                    sector: p.sector.clone(),
                    side,
                    quantity: p.quantity_delta.unsigned_abs(),
                    reference_price: p.reference_price,
                    confidence: p.confidence,
                    urgency: self.urgency_for(p),
                },
            );
        }

        if emergency == EmergencyLevel::Liquidate {
            let closes = liquidation_closes(portfolio, proposals);
            warn!(
                "Emergency liquidation: {} long positions queued for close",
                closes.len()
            );
            // A full close supersedes any partial sell proposal.
            for c in closes {
                candidates.insert(c.symbol.clone(), c);
            }
        }

        let total = portfolio.total_value();
        let mut ordered: Vec<Candidate> = candidates.into_values().collect();
        ordered.sort_by(|a, b| compare(a, b, total));

        let mut intents = Vec::with_capacity(ordered.len());
        let mut deferred = Vec::new();
        let mut risk_increasing = 0usize;
        for c in ordered {
            let liquidating =
                c.side == OrderSide::Sell && c.quantity <= portfolio.quantity(&c.symbol).max(0).unsigned_abs();
            if !liquidating {
                if risk_increasing >= self.config.max_daily_orders {
                    debug!("{} deferred: daily order cap reached", c.symbol);
                    deferred.push(c.symbol);
                    continue;
                }
                risk_increasing += 1;
            }
            let rank = u32::try_from(intents.len()).unwrap_or(u32::MAX);
            intents.push(OrderIntent {
                intent_id: OrderIntent::derive_id(trading_date, &c.symbol, c.side),
                trading_date,
                price: self.price_for(c.side, c.reference_price),
                symbol: c.symbol,
                sector: c.sector,
                side: c.side,
                quantity: c.quantity,
                reference_price: c.reference_price,
                urgency: c.urgency,
                confidence: c.confidence,
                liquidating,
                rank,
            });
        }

        info!(
            "CIO decided {} intents ({} dropped, {} deferred, emergency {})",
            intents.len(),
            dropped.len(),
            deferred.len(),
            emergency
        );

        CioDecision {
            emergency,
            intents,
            dropped,
            deferred,
        }
    }

    fn urgency_for(&self, p: &PositionProposal) -> Urgency {
        match p.kind {
            ProposalKind::Close | ProposalKind::Reduce => Urgency::High,
            ProposalKind::Open | ProposalKind::Increase => {
                if p.confidence >= self.config.high_conviction {
                    Urgency::Normal
                } else {
                    Urgency::Low
                }
            }
        }
    }

    fn price_for(&self, side: OrderSide, reference: Decimal) -> PriceSpec {
        match self.config.price_mode {
            PriceMode::Market => PriceSpec::Market,
            PriceMode::Limit => {
                let offset = reference * Decimal::from(self.config.limit_offset_bps)
                    / Decimal::from(10_000);
                match side {
                    OrderSide::Buy => PriceSpec::Limit(reference + offset),
                    OrderSide::Sell => PriceSpec::Limit(reference - offset),
                }
            }
        }
    }
}

/// Urgency first, then larger relative size, then higher confidence, then id.
fn compare(a: &Candidate, b: &Candidate, total: Decimal) -> Ordering {
    let size = |c: &Candidate| {
        let notional = Decimal::from(c.quantity) * c.reference_price;
        if total > Decimal::ZERO {
            notional / total
        } else {
            notional
        }
    };
    a.urgency
        .cmp(&b.urgency)
        .then_with(|| size(b).cmp(&size(a)))
        .then_with(|| b.confidence.cmp(&a.confidence))
        .then_with(|| a.symbol.cmp(&b.symbol))
}
