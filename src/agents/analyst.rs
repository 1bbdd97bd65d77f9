//! Analyst - technical indicators over daily bars, fundamentals and sentiment passthrough

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::regime::{detect, RegimeReading};
use super::traits::{ProduceResult, Producer};
use crate::coordinator::state::CycleContext;
use crate::domain::{Bar, Fundamentals, MarketSnapshot};
use crate::error::ProducerFailure;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalystConfig {
    pub rsi_period: usize,
    pub sma_short: usize,
    pub sma_long: usize,
    pub momentum_lookback: usize,
    pub volume_lookback: usize,
    /// Short and long moving-average windows for regime detection
    pub regime_short: usize,
    pub regime_long: usize,
    /// Symbol whose regime stands for the whole market, when it is in the universe
    pub benchmark: Option<String>,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            sma_short: 5,
            sma_long: 20,
            momentum_lookback: 20,
            volume_lookback: 20,
            regime_short: 20,
            regime_long: 60,
            benchmark: None,
        }
    }
}

/// Indicators computed from bars. `None` when there is not enough history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechnicalIndicators {
    pub rsi: Option<Decimal>,
    pub sma_short: Option<Decimal>,
    pub sma_long: Option<Decimal>,
    /// Close-to-close return over the lookback
    pub momentum: Option<Decimal>,
    /// Latest volume divided by the average volume over the lookback
    pub volume_ratio: Option<Decimal>,
}

/// Analyst output for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub symbol: String,
    pub sector: String,
    pub price: Decimal,
    pub technical: TechnicalIndicators,
    pub fundamentals: Option<Fundamentals>,
    pub sentiment: Option<Decimal>,
    pub regime: RegimeReading,
}

pub struct Analyst {
    config: AnalystConfig,
}

impl Analyst {
    pub fn new(config: AnalystConfig) -> Self {
        Self { config }
    }

    pub fn benchmark(&self) -> Option<&str> {
        self.config.benchmark.as_deref()
    }

    /// Pure analysis of one snapshot.
    pub fn analyze(&self, snapshot: Arc<MarketSnapshot>) -> ProduceResult<AnalysisReport> {
        validate_bars(&snapshot.symbol, &snapshot.bars)?;
        let price = snapshot.last_price().ok_or_else(|| {
            ProducerFailure::invalid(format!("{}: no price to analyze", snapshot.symbol))
        })?;

        let closes: Vec<Decimal> = snapshot.bars.iter().map(|b| b.close).collect();
        let volumes: Vec<Decimal> = snapshot.bars.iter().map(|b| Decimal::from(b.volume)).collect();

        let technical = TechnicalIndicators {
            rsi: rsi(&closes, self.config.rsi_period),
            sma_short: sma(&closes, self.config.sma_short),
            sma_long: sma(&closes, self.config.sma_long),
            momentum: momentum(&closes, self.config.momentum_lookback),
            volume_ratio: ratio_to_average(&volumes, self.config.volume_lookback),
        };
        let regime = detect(&closes, self.config.regime_short, self.config.regime_long);

        Ok(AnalysisReport {
            symbol: snapshot.symbol.clone(),
            sector: snapshot.sector_or_default(),
            price,
            technical,
            fundamentals: snapshot.fundamentals.clone(),
            sentiment: snapshot.sentiment,
            regime,
        })
    }
}

#[async_trait]
impl Producer for Analyst {
    type Input = Arc<MarketSnapshot>;
    type Output = AnalysisReport;

    fn name(&self) -> &str {
        "analyst"
    }

    async fn produce(
        &self,
        _ctx: &CycleContext,
        input: &Arc<MarketSnapshot>,
    ) -> ProduceResult<AnalysisReport> {
        self.analyze(Arc::clone(input))
    }
}

fn validate_bars(symbol: &str, bars: &[Bar]) -> ProduceResult<()> {
    for pair in bars.windows(2) {
        if pair[1].date <= pair[0].date {
            return Err(ProducerFailure::invalid(format!(
                "{}: bars out of order at {}",
                symbol, pair[1].date
            )));
        }
    }
    if let Some(bad) = bars.iter().find(|b| b.close <= Decimal::ZERO || b.low > b.high) {
        return Err(ProducerFailure::invalid(format!(
            "{}: malformed bar on {}",
            symbol, bad.date
        )));
    }
    Ok(())
}

/// Simple moving average of the last `period` values
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<Decimal>() / Decimal::from(period))
}

/// Relative strength index using simple averages of gains and losses
pub fn rsi(closes: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - period - 1..];
    let mut gains = Decimal::ZERO;
    let mut losses = Decimal::ZERO;
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change > Decimal::ZERO {
            gains += change;
        } else {
            losses -= change;
        }
    }
    if losses.is_zero() {
        return Some(Decimal::ONE_HUNDRED);
    }
    let rs = gains / losses;
    Some(Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs))
}

/// Return from `lookback` bars ago to the latest close
pub fn momentum(closes: &[Decimal], lookback: usize) -> Option<Decimal> {
    if lookback == 0 || closes.len() < lookback + 1 {
        return None;
    }
    let base = closes[closes.len() - lookback - 1];
    let last = *closes.last()?;
    if base.is_zero() {
        return None;
    }
    Some((last - base) / base)
}

fn ratio_to_average(values: &[Decimal], lookback: usize) -> Option<Decimal> {
    let avg = sma(values, lookback)?;
    if avg.is_zero() {
        return None;
    }
    Some(*values.last()? / avg)
}
