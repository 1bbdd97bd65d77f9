//! Portfolio Manager - turns per-strategy signals into bounded position deltas

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::agents::{AnalysisReport, InvestmentThesis, StrategyConfig};
use crate::domain::{
    Direction, PortfolioState, PositionProposal, ProposalKind, Signal, SignalContribution,
};
use crate::error::{DeskError, Result};

/// How per-strategy signals are averaged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingScheme {
    /// Configured weight per strategy
    Fixed,
    /// Each signal weighted by its own confidence
    ConfidenceWeighted,
}

impl Default for WeightingScheme {
    fn default() -> Self {
        Self::ConfidenceWeighted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub weighting: WeightingScheme,
    /// Largest single position as a fraction of total portfolio value
    pub max_position_fraction: Decimal,
    /// Largest sector exposure as a fraction of total portfolio value
    pub max_sector_fraction: Decimal,
    /// Cash kept back from new buys, as a fraction of total portfolio value
    pub cash_reserve_fraction: Decimal,
    /// Buy scores below this are treated as hold
    pub min_conviction: Decimal,
    /// Sell scores at or above this close the whole position
    pub close_conviction: Decimal,
    pub lot_size: u64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            weighting: WeightingScheme::ConfidenceWeighted,
            max_position_fraction: Decimal::new(10, 2),
            max_sector_fraction: Decimal::new(30, 2),
            cash_reserve_fraction: Decimal::new(10, 2),
            min_conviction: Decimal::new(20, 2),
            close_conviction: Decimal::new(60, 2),
            lot_size: 1,
        }
    }
}

/// Signals for one instrument folded into a single view
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedSignal {
    /// In [-1, 1]; zero means hold
    pub score: Decimal,
    pub confidence: Decimal,
    /// Buy and sell views cancelled out exactly
    pub tied: bool,
    pub rationale: Vec<SignalContribution>,
}

impl CombinedSignal {
    pub fn direction(&self) -> Direction {
        if self.score > Decimal::ZERO {
            Direction::Buy
        } else if self.score < Decimal::ZERO {
            Direction::Sell
        } else {
            Direction::Hold
        }
    }
}

pub struct PortfolioManager {
    config: SizingConfig,
    strategies: StrategyConfig,
}

impl PortfolioManager {
    pub fn new(config: SizingConfig, strategies: StrategyConfig) -> Self {
        Self { config, strategies }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Weighted average of signed confidences. `None` without usable signals.
    pub fn combine(&self, signals: &[Signal]) -> Option<CombinedSignal> {
        if signals.is_empty() {
            return None;
        }
        let mut weighted = Decimal::ZERO;
        let mut total_weight = Decimal::ZERO;
        let mut rationale = Vec::with_capacity(signals.len());
        let mut has_buy = false;
        let mut has_sell = false;

        for s in signals {
            let weight = match self.config.weighting {
                WeightingScheme::Fixed => self.strategies.weight(&s.strategy),
                WeightingScheme::ConfidenceWeighted => s.confidence,
            };
            weighted += weight * s.direction.sign() * s.confidence;
            total_weight += weight;
            has_buy |= s.direction == Direction::Buy;
            has_sell |= s.direction == Direction::Sell;
            rationale.push(SignalContribution {
                strategy: s.strategy.clone(),
                direction: s.direction,
                confidence: s.confidence,
                weight,
            });
        }

        let score = if total_weight > Decimal::ZERO {
            (weighted / total_weight).clamp(Decimal::NEGATIVE_ONE, Decimal::ONE)
        } else {
            Decimal::ZERO
        };
        let confidence =
            signals.iter().map(|s| s.confidence).sum::<Decimal>() / Decimal::from(signals.len());

        Some(CombinedSignal {
            score,
            confidence,
            tied: score.is_zero() && has_buy && has_sell,
            rationale,
        })
    }

    /// Size every analyzed instrument against the cycle-start portfolio.
    ///
    /// A thesis can raise the cash reserve and tighten sector caps, never
    /// the reverse.
    ///
    /// Buys are processed strongest score first so the sector and cash
    /// budgets go to the highest conviction; the result holds at most one
    /// proposal per instrument.
    pub fn size(
        &self,
        reports: &BTreeMap<String, Arc<AnalysisReport>>,
        signals: &BTreeMap<String, Vec<Signal>>,
        portfolio: Option<&PortfolioState>,
        thesis: Option<&InvestmentThesis>,
    ) -> Result<BTreeMap<String, PositionProposal>> {
        let portfolio = portfolio.ok_or_else(|| {
            DeskError::PortfolioUnavailable("portfolio state missing at sizing".to_string())
        })?;

        let mut marked = portfolio.clone();
        for (symbol, report) in reports {
            marked.mark(symbol, report.price);
        }
        let total = marked.total_value();
        if total <= Decimal::ZERO {
            return Err(DeskError::PortfolioUnavailable(format!(
                "non-positive portfolio value {}",
                total
            )));
        }

        let cap_value = total * self.config.max_position_fraction;
        let max_sector = self.config.max_sector_fraction;
        let sector_cap = |sector: &str| {
            total * thesis.map_or(max_sector, |t| t.sector_cap(sector, max_sector))
        };
        let reserve = thesis.map_or(self.config.cash_reserve_fraction, |t| {
            t.cash_reserve(self.config.cash_reserve_fraction)
        });
        let mut cash_budget = marked.cash - total * reserve;
        let mut sector_added: BTreeMap<String, Decimal> = BTreeMap::new();

        let mut ranked: Vec<(&String, &Arc<AnalysisReport>, Option<CombinedSignal>)> = reports
            .iter()
            .map(|(symbol, report)| {
                let combined = signals.get(symbol).and_then(|s| self.combine(s));
                (symbol, report, combined)
            })
            .collect();
        ranked.sort_by(|a, b| {
            let sa = a.2.as_ref().map(|c| c.score.abs()).unwrap_or(Decimal::ZERO);
            let sb = b.2.as_ref().map(|c| c.score.abs()).unwrap_or(Decimal::ZERO);
            sb.cmp(&sa).then_with(|| a.0.cmp(b.0))
        });

        let mut proposals = BTreeMap::new();
        for (symbol, report, combined) in ranked {
            let price = report.price;
            if price <= Decimal::ZERO {
                continue;
            }
            let held = marked.quantity(symbol);
            let current_value = marked.position_value(symbol);
            let sector = marked
                .holdings
                .get(symbol)
                .map(|h| h.sector.clone())
                .unwrap_or_else(|| report.sector.clone());

            let proposal = match &combined {
                Some(c) if c.tied => {
                    debug!("{}: opposing signals tie, holding", symbol);
                    None
                }
                Some(c) if c.direction() == Direction::Buy => {
                    if c.score < self.config.min_conviction {
                        self.trim_to_cap(symbol, &sector, held, price, current_value, cap_value, total, combined.as_ref())
                    } else {
                        let target_fraction = c.score * self.config.max_position_fraction;
                        let target_value = total * target_fraction;
                        if target_value <= current_value {
                            self.trim_to_cap(symbol, &sector, held, price, current_value, cap_value, total, combined.as_ref())
                        } else {
                            let sector_room = sector_cap(&sector)
                                - marked.sector_exposure(&sector)
                                - sector_added.get(&sector).copied().unwrap_or(Decimal::ZERO);
                            let budget = (target_value - current_value)
                                .min(sector_room)
                                .min(cash_budget);
                            let qty = self.lots_for(budget, price);
                            if qty == 0 {
                                debug!("{}: no room to buy (budget {})", symbol, budget);
                                None
                            } else {
                                let spent = Decimal::from(qty) * price;
                                cash_budget -= spent;
                                *sector_added.entry(sector.clone()).or_insert(Decimal::ZERO) += spent;
                                Some(PositionProposal {
                                    symbol: symbol.clone(),
                                    sector: sector.clone(),
                                    kind: if held == 0 {
                                        ProposalKind::Open
                                    } else {
                                        ProposalKind::Increase
                                    },
                                    quantity_delta: i64::try_from(qty).unwrap_or(i64::MAX),
                                    reference_price: price,
                                    score: c.score,
                                    confidence: c.confidence,
                                    target_fraction,
                                    rationale: c.rationale.clone(),
                                })
                            }
                        }
                    }
                }
                Some(c) if c.direction() == Direction::Sell => {
                    if held <= 0 {
                        None
                    } else {
                        let conviction = c.score.abs();
                        let held_u = held.unsigned_abs();
                        let qty = if conviction >= self.config.close_conviction {
                            held_u
                        } else {
                            let raw = Decimal::from(held_u) * conviction;
                            self.round_lots(raw).min(held_u)
                        };
                        if qty == 0 {
                            None
                        } else {
                            let remaining = Decimal::from(held_u - qty) * price;
                            Some(PositionProposal {
                                symbol: symbol.clone(),
                                sector: sector.clone(),
                                kind: if qty == held_u {
                                    ProposalKind::Close
                                } else {
                                    ProposalKind::Reduce
                                },
                                quantity_delta: -i64::try_from(qty).unwrap_or(i64::MAX),
                                reference_price: price,
                                score: c.score,
                                confidence: c.confidence,
                                target_fraction: remaining / total,
                                rationale: c.rationale.clone(),
                            })
                        }
                    }
                }
                _ => self.trim_to_cap(symbol, &sector, held, price, current_value, cap_value, total, combined.as_ref()),
            };

            if let Some(p) = proposal {
                debug!(
                    "{}: {:?} {} @ {} (score {})",
                    p.symbol, p.kind, p.quantity_delta, p.reference_price, p.score
                );
                proposals.insert(p.symbol.clone(), p);
            }
        }

        Ok(proposals)
    }

    /// Reduce a long position that sits above the per-position cap.
    #[allow(clippy::too_many_arguments)]
    fn trim_to_cap(
        &self,
        symbol: &str,
        sector: &str,
        held: i64,
        price: Decimal,
        current_value: Decimal,
        cap_value: Decimal,
        total: Decimal,
        combined: Option<&CombinedSignal>,
    ) -> Option<PositionProposal> {
        if held <= 0 || current_value <= cap_value {
            return None;
        }
        let excess = current_value - cap_value;
        let lot = Decimal::from(self.config.lot_size.max(1));
        let lots = (excess / price / lot).ceil();
        let qty = (lots * lot).to_u64()?.min(held.unsigned_abs());
        if qty == 0 {
            return None;
        }
        let remaining = Decimal::from(held.unsigned_abs() - qty) * price;
        Some(PositionProposal {
            symbol: symbol.to_string(),
            sector: sector.to_string(),
            kind: ProposalKind::Reduce,
            quantity_delta: -i64::try_from(qty).ok()?,
            reference_price: price,
            score: combined.map(|c| c.score).unwrap_or(Decimal::ZERO),
            confidence: combined.map(|c| c.confidence).unwrap_or(Decimal::ZERO),
            target_fraction: remaining / total,
            rationale: combined.map(|c| c.rationale.clone()).unwrap_or_default(),
        })
    }

    /// Whole lots affordable with `value` at `price`
    fn lots_for(&self, value: Decimal, price: Decimal) -> u64 {
        if value <= Decimal::ZERO || price <= Decimal::ZERO {
            return 0;
        }
        self.round_lots(value / price)
    }

    fn round_lots(&self, shares: Decimal) -> u64 {
        let lot = Decimal::from(self.config.lot_size.max(1));
        ((shares / lot).floor() * lot).to_u64().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{MarketRegime, RegimeReading, TechnicalIndicators, ThesisConfig};
    use crate::domain::Holding;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn report(symbol: &str, sector: &str, price: Decimal) -> Arc<AnalysisReport> {
        Arc::new(AnalysisReport {
            symbol: symbol.into(),
            sector: sector.into(),
            price,
            technical: TechnicalIndicators::default(),
            fundamentals: None,
            sentiment: None,
            regime: RegimeReading::default(),
        })
    }

    fn sig(symbol: &str, strategy: &str, d: Direction, c: Decimal) -> Signal {
        Signal::new(symbol, strategy, d, c)
    }

    fn manager() -> PortfolioManager {
        PortfolioManager::new(SizingConfig::default(), StrategyConfig::default())
    }

    fn cash_only(cash: Decimal) -> PortfolioState {
        PortfolioState::new(cash, Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap())
    }

    #[test]
    fn confidence_weighted_combination() {
        let pm = manager();
        let c = pm
            .combine(&[
                sig("A", "momentum", Direction::Buy, dec!(0.8)),
                sig("A", "value", Direction::Buy, dec!(0.4)),
            ])
            .unwrap();
        // (0.8*0.8 + 0.4*0.4) / 1.2
        assert_eq!(c.score.round_dp(4), dec!(0.6667));
        assert_eq!(c.confidence, dec!(0.6));
        assert!(!c.tied);
    }

    #[test]
    fn fixed_weights_use_strategy_config() {
        let mut strategies = StrategyConfig::default();
        strategies.weights.insert("value".into(), dec!(3));
        let pm = PortfolioManager::new(
            SizingConfig {
                weighting: WeightingScheme::Fixed,
                ..SizingConfig::default()
            },
            strategies,
        );
        let c = pm
            .combine(&[
                sig("A", "momentum", Direction::Sell, dec!(0.8)),
                sig("A", "value", Direction::Buy, dec!(0.4)),
            ])
            .unwrap();
        // (-0.8 + 3*0.4) / 4
        assert_eq!(c.score, dec!(0.1));
    }

    #[test]
    fn equal_and_opposite_signals_hold() {
        let pm = manager();
        let mut reports = BTreeMap::new();
        reports.insert("A".to_string(), report("A", "TECH", dec!(100)));
        let mut signals = BTreeMap::new();
        signals.insert(
            "A".to_string(),
            vec![
                sig("A", "momentum", Direction::Buy, dec!(0.7)),
                sig("A", "value", Direction::Sell, dec!(0.7)),
            ],
        );
        let out = pm
            .size(&reports, &signals, Some(&cash_only(dec!(100000))), None)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn buy_is_capped_at_max_position() {
        let pm = manager();
        let mut reports = BTreeMap::new();
        reports.insert("A".to_string(), report("A", "TECH", dec!(100)));
        let mut signals = BTreeMap::new();
        signals.insert("A".to_string(), vec![sig("A", "momentum", Direction::Buy, dec!(1))]);

        let out = pm
            .size(&reports, &signals, Some(&cash_only(dec!(100000))), None)
            .unwrap();
        let p = &out["A"];
        assert_eq!(p.kind, ProposalKind::Open);
        // 10% of 100_000 at 100 per share
        assert_eq!(p.quantity_delta, 100);
        assert_eq!(p.target_fraction, dec!(0.10));
    }

    #[test]
    fn sector_budget_is_shared_across_instruments() {
        let pm = manager();
        let mut reports = BTreeMap::new();
        let mut signals = BTreeMap::new();
        for s in ["A", "B", "C", "D"] {
            reports.insert(s.to_string(), report(s, "TECH", dec!(100)));
            signals.insert(s.to_string(), vec![sig(s, "momentum", Direction::Buy, dec!(1))]);
        }
        let portfolio = cash_only(dec!(100000));
        let out = pm.size(&reports, &signals, Some(&portfolio), None).unwrap();
        let total: i64 = out.values().map(|p| p.quantity_delta).sum();
        // 30% sector cap = 30_000 = 300 shares
        assert_eq!(total, 300);
        assert!(!out.contains_key("D"));
    }

    #[test]
    fn cash_reserve_limits_buys() {
        let pm = manager();
        let mut reports = BTreeMap::new();
        reports.insert("A".to_string(), report("A", "TECH", dec!(100)));
        reports.insert("B".to_string(), report("B", "BANK", dec!(100)));
        let mut signals = BTreeMap::new();
        signals.insert("A".to_string(), vec![sig("A", "momentum", Direction::Buy, dec!(1))]);
        signals.insert("B".to_string(), vec![sig("B", "momentum", Direction::Buy, dec!(1))]);
        // 100k total, 85k in holdings: 15k cash, 10k reserve => 5k budget
        let portfolio = cash_only(dec!(15000))
            .with_holding(Holding::new("Z", "UTIL", 850, dec!(100), dec!(100)));
        let out = pm.size(&reports, &signals, Some(&portfolio), None).unwrap();
        assert_eq!(out["A"].quantity_delta, 50);
        assert!(!out.contains_key("B"));
    }

    #[test]
    fn bear_thesis_tightens_sector_and_cash() {
        let pm = manager();
        let bear = ThesisConfig::default().thesis_for(&RegimeReading {
            regime: MarketRegime::Bear,
            ..Default::default()
        });
        let mut reports = BTreeMap::new();
        let mut signals = BTreeMap::new();
        for s in ["A", "B", "C"] {
            reports.insert(s.to_string(), report(s, "TECH", dec!(100)));
            signals.insert(s.to_string(), vec![sig(s, "momentum", Direction::Buy, dec!(1))]);
        }
        let out = pm
            .size(&reports, &signals, Some(&cash_only(dec!(100000))), Some(&bear))
            .unwrap();
        // 20% sector limit instead of the configured 30%
        let total: i64 = out.values().map(|p| p.quantity_delta).sum();
        assert_eq!(total, 200);

        // 15k cash under a 40% reserve leaves nothing to spend
        let portfolio = cash_only(dec!(15000))
            .with_holding(Holding::new("Z", "UTIL", 850, dec!(100), dec!(100)));
        let out = pm
            .size(&reports, &signals, Some(&portfolio), Some(&bear))
            .unwrap();
        assert!(out.values().all(|p| p.quantity_delta <= 0));
    }

    #[test]
    fn strong_sell_closes_weak_sell_reduces() {
        let pm = manager();
        let portfolio = cash_only(dec!(90000))
            .with_holding(Holding::new("A", "TECH", 40, dec!(100), dec!(100)))
            .with_holding(Holding::new("B", "BANK", 40, dec!(100), dec!(100)));
        let mut reports = BTreeMap::new();
        reports.insert("A".to_string(), report("A", "TECH", dec!(100)));
        reports.insert("B".to_string(), report("B", "BANK", dec!(100)));
        let mut signals = BTreeMap::new();
        signals.insert("A".to_string(), vec![sig("A", "momentum", Direction::Sell, dec!(0.9))]);
        signals.insert("B".to_string(), vec![sig("B", "momentum", Direction::Sell, dec!(0.25))]);

        let out = pm.size(&reports, &signals, Some(&portfolio), None).unwrap();
        assert_eq!(out["A"].kind, ProposalKind::Close);
        assert_eq!(out["A"].quantity_delta, -40);
        assert_eq!(out["B"].kind, ProposalKind::Reduce);
        assert_eq!(out["B"].quantity_delta, -10);
    }

    #[test]
    fn overweight_position_without_signals_is_trimmed() {
        let pm = manager();
        let portfolio = cash_only(dec!(85000))
            .with_holding(Holding::new("A", "TECH", 150, dec!(100), dec!(100)));
        let mut reports = BTreeMap::new();
        reports.insert("A".to_string(), report("A", "TECH", dec!(100)));
        let out = pm.size(&reports, &BTreeMap::new(), Some(&portfolio), None).unwrap();
        assert_eq!(out["A"].kind, ProposalKind::Reduce);
        assert_eq!(out["A"].quantity_delta, -50);
    }

    #[test]
    fn missing_portfolio_is_fatal() {
        let pm = manager();
        let err = pm.size(&BTreeMap::new(), &BTreeMap::new(), None, None).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn sell_signal_without_position_is_ignored() {
        let pm = manager();
        let mut reports = BTreeMap::new();
        reports.insert("A".to_string(), report("A", "TECH", dec!(100)));
        let mut signals = BTreeMap::new();
        signals.insert("A".to_string(), vec![sig("A", "momentum", Direction::Sell, dec!(1))]);
        let out = pm
            .size(&reports, &signals, Some(&cash_only(dec!(100000))), None)
            .unwrap();
        assert!(out.is_empty());
    }
}
