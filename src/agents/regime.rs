//! Market regime and the investment thesis derived from it
//!
//! 指數（或全體標的）收盤價相對短、長均線的位置決定市場狀態，
//! 再由市場狀態決定現金目標與產業上限。

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::analyst::{sma, AnalysisReport};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// 市場狀態
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Bull,
    Bear,
    #[default]
    Sideways,
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketRegime::Bull => write!(f, "bull"),
            MarketRegime::Bear => write!(f, "bear"),
            MarketRegime::Sideways => write!(f, "sideways"),
        }
    }
}

/// One regime reading over a close series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeReading {
    pub regime: MarketRegime,
    pub confidence: Decimal,
    /// Annualized standard deviation of daily returns
    pub volatility: Option<Decimal>,
    pub sma_short: Option<Decimal>,
    pub sma_long: Option<Decimal>,
    /// Return over the short window
    pub return_short: Option<Decimal>,
}

/// 依收盤價判斷市場狀態
///
/// 長均線資料不足時以短均線代替；短均線也不足則為 Sideways、信心 0。
pub fn detect(closes: &[Decimal], short: usize, long: usize) -> RegimeReading {
    let mut reading = RegimeReading {
        volatility: annualized_volatility(closes),
        ..Default::default()
    };
    let (Some(price), Some(short_ma)) = (closes.last().copied(), sma(closes, short)) else {
        return reading;
    };
    let long_ma = sma(closes, long).unwrap_or(short_ma);

    reading.sma_short = Some(short_ma);
    reading.sma_long = Some(long_ma);
    reading.return_short = closes
        .len()
        .checked_sub(short)
        .map(|i| closes[i])
        .filter(|base| !base.is_zero())
        .map(|base| price / base - Decimal::ONE);

    if price > short_ma && price > long_ma {
        reading.regime = MarketRegime::Bull;
        reading.confidence = dec!(0.7);
    } else if price < short_ma && price < long_ma {
        reading.regime = MarketRegime::Bear;
        reading.confidence = dec!(0.7);
    } else {
        reading.confidence = dec!(0.5);
    }
    reading
}

fn annualized_volatility(closes: &[Decimal]) -> Option<Decimal> {
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| !w[0].is_zero())
        .filter_map(|w| ((w[1] - w[0]) / w[0]).to_f64())
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Decimal::from_f64(variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt()).map(|v| v.round_dp(6))
}

/// 整體市場狀態
///
/// 有基準指數報告時直接採用；否則以多空標的數多數決，信心為多數方佔比。
pub fn market_regime(reports: &[&AnalysisReport], benchmark: Option<&str>) -> RegimeReading {
    if let Some(report) = benchmark.and_then(|b| reports.iter().find(|r| r.symbol == b)) {
        return report.regime.clone();
    }
    if reports.is_empty() {
        return RegimeReading::default();
    }
    let bulls = reports.iter().filter(|r| r.regime.regime == MarketRegime::Bull).count();
    let bears = reports.iter().filter(|r| r.regime.regime == MarketRegime::Bear).count();
    let total = Decimal::from(reports.len());
    let (regime, count) = match bulls.cmp(&bears) {
        std::cmp::Ordering::Greater => (MarketRegime::Bull, bulls),
        std::cmp::Ordering::Less => (MarketRegime::Bear, bears),
        std::cmp::Ordering::Equal => (MarketRegime::Sideways, reports.len() - bulls - bears),
    };
    RegimeReading {
        regime,
        confidence: (Decimal::from(count) / total).round_dp(4),
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentMode {
    Aggressive,
    Neutral,
    Defensive,
}

/// Cash target and sector limits for one regime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThesisPlan {
    /// Fraction of total value kept in cash
    pub cash_target: Decimal,
    /// Per-sector cap as a fraction of total value
    pub sector_limits: BTreeMap<String, Decimal>,
    /// Cap for sectors not listed in `sector_limits`
    pub default_sector_limit: Option<Decimal>,
}

impl Default for ThesisPlan {
    fn default() -> Self {
        Self {
            cash_target: dec!(0.20),
            sector_limits: BTreeMap::new(),
            default_sector_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThesisConfig {
    pub bull: ThesisPlan,
    pub sideways: ThesisPlan,
    pub bear: ThesisPlan,
}

impl Default for ThesisConfig {
    fn default() -> Self {
        Self {
            bull: ThesisPlan {
                cash_target: dec!(0.10),
                ..Default::default()
            },
            sideways: ThesisPlan {
                default_sector_limit: Some(dec!(0.25)),
                ..Default::default()
            },
            bear: ThesisPlan {
                cash_target: dec!(0.40),
                default_sector_limit: Some(dec!(0.20)),
                ..Default::default()
            },
        }
    }
}

impl ThesisConfig {
    pub fn plan(&self, regime: MarketRegime) -> &ThesisPlan {
        match regime {
            MarketRegime::Bull => &self.bull,
            MarketRegime::Sideways => &self.sideways,
            MarketRegime::Bear => &self.bear,
        }
    }

    pub fn thesis_for(&self, reading: &RegimeReading) -> InvestmentThesis {
        let plan = self.plan(reading.regime);
        InvestmentThesis {
            regime: reading.regime,
            confidence: reading.confidence,
            mode: match reading.regime {
                MarketRegime::Bull => InvestmentMode::Aggressive,
                MarketRegime::Sideways => InvestmentMode::Neutral,
                MarketRegime::Bear => InvestmentMode::Defensive,
            },
            cash_target: plan.cash_target,
            sector_limits: plan.sector_limits.clone(),
            default_sector_limit: plan.default_sector_limit,
        }
    }
}

/// 本週期的投資方針，於配置部位前決定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestmentThesis {
    pub regime: MarketRegime,
    pub confidence: Decimal,
    pub mode: InvestmentMode,
    pub cash_target: Decimal,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sector_limits: BTreeMap<String, Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_sector_limit: Option<Decimal>,
}

impl InvestmentThesis {
    /// The larger of the configured reserve and the thesis cash target
    pub fn cash_reserve(&self, configured: Decimal) -> Decimal {
        configured.max(self.cash_target)
    }

    /// The tighter of the configured sector cap and the thesis limit
    pub fn sector_cap(&self, sector: &str, configured: Decimal) -> Decimal {
        match self.sector_limits.get(sector).copied().or(self.default_sector_limit) {
            Some(limit) => configured.min(limit),
            None => configured,
        }
    }
}
