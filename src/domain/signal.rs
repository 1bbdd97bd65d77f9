use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Directional view produced by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    /// +1 for buy, -1 for sell, 0 for hold
    pub fn sign(self) -> Decimal {
        match self {
            Direction::Buy => Decimal::ONE,
            Direction::Sell => Decimal::NEGATIVE_ONE,
            Direction::Hold => Decimal::ZERO,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "buy"),
            Direction::Sell => write!(f, "sell"),
            Direction::Hold => write!(f, "hold"),
        }
    }
}

/// One strategy's view on one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    /// Confidence in [0, 1]
    pub confidence: Decimal,
    pub strategy: String,
    /// Metrics the strategy based its view on
    #[serde(default)]
    pub metrics: BTreeMap<String, Decimal>,
}

impl Signal {
    pub fn new(
        symbol: impl Into<String>,
        strategy: impl Into<String>,
        direction: Direction,
        confidence: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            confidence: confidence.clamp(Decimal::ZERO, Decimal::ONE),
            strategy: strategy.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, key: &str, value: Decimal) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }
}

/// What a proposal does to an existing position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    Open,
    Increase,
    Reduce,
    Close,
}

impl ProposalKind {
    pub fn is_liquidating(self) -> bool {
        matches!(self, ProposalKind::Reduce | ProposalKind::Close)
    }
}

/// Contribution of a single signal to a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalContribution {
    pub strategy: String,
    pub direction: Direction,
    pub confidence: Decimal,
    pub weight: Decimal,
}

/// Bounded position delta for one instrument in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionProposal {
    pub symbol: String,
    pub sector: String,
    pub kind: ProposalKind,
    /// Signed share delta: positive buys, negative sells
    pub quantity_delta: i64,
    pub reference_price: Decimal,
    /// Combined directional score in [-1, 1]
    pub score: Decimal,
    /// Mean confidence of the contributing signals
    pub confidence: Decimal,
    /// Target position as a fraction of total portfolio value
    pub target_fraction: Decimal,
    pub rationale: Vec<SignalContribution>,
}

impl PositionProposal {
    pub fn notional(&self) -> Decimal {
        Decimal::from(self.quantity_delta.unsigned_abs()) * self.reference_price
    }
}
