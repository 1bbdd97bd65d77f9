//! Built-in strategies and the name → function registry
//!
//! A strategy is a pure function of an analysis report and its parameters.
//! Returning `None` means the strategy has no opinion (not enough data).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::analyst::AnalysisReport;
use crate::domain::{Direction, Signal};

/// Decimal parameters for one strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyParams {
    pub values: BTreeMap<String, Decimal>,
}

impl StrategyParams {
    pub fn get(&self, key: &str, default: Decimal) -> Decimal {
        self.values.get(key).copied().unwrap_or(default)
    }

    pub fn with(mut self, key: &str, value: Decimal) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

pub type StrategyFn = fn(&AnalysisReport, &StrategyParams) -> Option<Signal>;

/// Strategies available to the strategist, by name
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    entries: BTreeMap<String, StrategyFn>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("momentum", momentum);
        registry.register("value", value);
        registry.register("mean_reversion", mean_reversion);
        registry.register("sentiment", sentiment);
        registry.register("composite", composite);
        registry
    }

    pub fn register(&mut self, name: &str, strategy: StrategyFn) {
        self.entries.insert(name.to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<StrategyFn> {
        self.entries.get(name).copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

fn hold(report: &AnalysisReport, strategy: &str, params: &StrategyParams) -> Signal {
    Signal::new(
        &report.symbol,
        strategy,
        Direction::Hold,
        params.get("hold_confidence", dec!(0.3)),
    )
}

/// Trend following: return over the lookback confirmed by the SMA cross.
pub fn momentum(report: &AnalysisReport, params: &StrategyParams) -> Option<Signal> {
    let t = &report.technical;
    let m = t.momentum?;
    let short = t.sma_short?;
    let long = t.sma_long?;
    let threshold = params.get("threshold", dec!(0.05));
    if threshold <= Decimal::ZERO {
        return None;
    }
    let confidence = (m.abs() / (threshold * Decimal::TWO)).min(Decimal::ONE);

    let signal = if m >= threshold && short > long {
        Signal::new(&report.symbol, "momentum", Direction::Buy, confidence)
    } else if m <= -threshold && short < long {
        Signal::new(&report.symbol, "momentum", Direction::Sell, confidence)
    } else {
        hold(report, "momentum", params)
    };
    Some(
        signal
            .with_metric("momentum", m)
            .with_metric("sma_short", short)
            .with_metric("sma_long", long),
    )
}

/// Valuation screen on PER, PBR and ROE.
pub fn value(report: &AnalysisReport, params: &StrategyParams) -> Option<Signal> {
    let f = report.fundamentals.as_ref()?;
    let per = f.per?;
    let pbr = f.pbr?;
    let roe = f.roe?;

    let cheap = [
        per > Decimal::ZERO && per <= params.get("per_max", dec!(10)),
        pbr <= params.get("pbr_max", dec!(1.0)),
        roe >= params.get("roe_min", dec!(0.08)),
    ]
    .iter()
    .filter(|ok| **ok)
    .count();

    let signal = if per <= Decimal::ZERO || per >= params.get("per_sell", dec!(30)) || roe < Decimal::ZERO {
        Signal::new(&report.symbol, "value", Direction::Sell, dec!(0.6))
    } else if cheap == 3 {
        Signal::new(&report.symbol, "value", Direction::Buy, dec!(0.8))
    } else if cheap == 2 {
        Signal::new(&report.symbol, "value", Direction::Buy, dec!(0.5))
    } else {
        hold(report, "value", params)
    };
    Some(
        signal
            .with_metric("per", per)
            .with_metric("pbr", pbr)
            .with_metric("roe", roe),
    )
}

/// Buy oversold, sell overbought on RSI.
pub fn mean_reversion(report: &AnalysisReport, params: &StrategyParams) -> Option<Signal> {
    let rsi = report.technical.rsi?;
    let oversold = params.get("oversold", dec!(30));
    let overbought = params.get("overbought", dec!(70));
    if oversold <= Decimal::ZERO || overbought >= Decimal::ONE_HUNDRED {
        return None;
    }

    let signal = if rsi <= oversold {
        let depth = (oversold - rsi) / oversold;
        Signal::new(
            &report.symbol,
            "mean_reversion",
            Direction::Buy,
            dec!(0.5) + depth / Decimal::TWO,
        )
    } else if rsi >= overbought {
        let depth = (rsi - overbought) / (Decimal::ONE_HUNDRED - overbought);
        Signal::new(
            &report.symbol,
            "mean_reversion",
            Direction::Sell,
            dec!(0.5) + depth / Decimal::TWO,
        )
    } else {
        hold(report, "mean_reversion", params)
    };
    Some(signal.with_metric("rsi", rsi))
}

/// Majority vote of momentum, value and mean reversion.
///
/// Buy and sell votes are counted; a tie is a hold. Confidence is the mean
/// confidence of the strategies that had an opinion. Parameters are shared
/// with the members.
pub fn composite(report: &AnalysisReport, params: &StrategyParams) -> Option<Signal> {
    let members: [StrategyFn; 3] = [momentum, value, mean_reversion];
    let votes: Vec<Signal> = members
        .iter()
        .filter_map(|f| f(report, params))
        .collect();
    if votes.is_empty() {
        return None;
    }
    let buys = votes.iter().filter(|s| s.direction == Direction::Buy).count();
    let sells = votes.iter().filter(|s| s.direction == Direction::Sell).count();
    let direction = match buys.cmp(&sells) {
        std::cmp::Ordering::Greater => Direction::Buy,
        std::cmp::Ordering::Less => Direction::Sell,
        std::cmp::Ordering::Equal => Direction::Hold,
    };
    let confidence =
        votes.iter().map(|s| s.confidence).sum::<Decimal>() / Decimal::from(votes.len());
    Some(
        Signal::new(&report.symbol, "composite", direction, confidence)
            .with_metric("buy_votes", Decimal::from(buys))
            .with_metric("sell_votes", Decimal::from(sells))
            .with_metric("members", Decimal::from(votes.len())),
    )
}

/// Follow news sentiment when it is strong enough.
pub fn sentiment(report: &AnalysisReport, params: &StrategyParams) -> Option<Signal> {
    let s = report.sentiment?;
    let threshold = params.get("threshold", dec!(0.3));
    let confidence = s.abs().min(Decimal::ONE);
    let signal = if s >= threshold {
        Signal::new(&report.symbol, "sentiment", Direction::Buy, confidence)
    } else if s <= -threshold {
        Signal::new(&report.symbol, "sentiment", Direction::Sell, confidence)
    } else {
        hold(report, "sentiment", params)
    };
    Some(signal.with_metric("sentiment", s))
}
