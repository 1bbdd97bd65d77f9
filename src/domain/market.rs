use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{FailureKind, ProducerFailure};

/// Daily OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// Valuation ratios published with filings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fundamentals {
    pub per: Option<Decimal>,
    pub pbr: Option<Decimal>,
    pub roe: Option<Decimal>,
    pub dividend_yield: Option<Decimal>,
}

/// Immutable per-instrument data bundle for one cycle.
///
/// Providers may each return a partial snapshot; the collector merges them
/// with [`MarketSnapshot::merge`]. Only the market-data provider is expected
/// to fill `price` and `bars`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub as_of: DateTime<Utc>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub bars: Vec<Bar>,
    #[serde(default)]
    pub fundamentals: Option<Fundamentals>,
    /// News sentiment in [-1, 1]
    #[serde(default)]
    pub sentiment: Option<Decimal>,
    #[serde(default)]
    pub macro_indicators: BTreeMap<String, Decimal>,
    /// Names of the providers that contributed to this snapshot
    #[serde(default)]
    pub sources: Vec<String>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, as_of: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            as_of,
            sector: None,
            price: None,
            bars: Vec::new(),
            fundamentals: None,
            sentiment: None,
            macro_indicators: BTreeMap::new(),
            sources: Vec::new(),
        }
    }

    pub fn with_sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = Some(sector.into());
        self
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_bars(mut self, bars: Vec<Bar>) -> Self {
        self.bars = bars;
        self
    }

    pub fn with_sentiment(mut self, sentiment: Decimal) -> Self {
        self.sentiment = Some(sentiment);
        self
    }

    pub fn with_fundamentals(mut self, fundamentals: Fundamentals) -> Self {
        self.fundamentals = Some(fundamentals);
        self
    }

    /// Fill fields this snapshot lacks from `other`. Existing values win.
    pub fn merge(&mut self, other: MarketSnapshot) {
        if self.sector.is_none() {
            self.sector = other.sector;
        }
        if self.price.is_none() {
            self.price = other.price;
        }
        if self.bars.is_empty() {
            self.bars = other.bars;
        }
        if self.fundamentals.is_none() {
            self.fundamentals = other.fundamentals;
        }
        if self.sentiment.is_none() {
            self.sentiment = other.sentiment;
        }
        for (key, value) in other.macro_indicators {
            self.macro_indicators.entry(key).or_insert(value);
        }
        for source in other.sources {
            if !self.sources.contains(&source) {
                self.sources.push(source);
            }
        }
    }

    /// Last price, falling back to the latest bar close.
    pub fn last_price(&self) -> Option<Decimal> {
        self.price.or_else(|| self.bars.last().map(|b| b.close))
    }

    /// Sector label, `"UNCLASSIFIED"` when no provider supplied one.
    pub fn sector_or_default(&self) -> String {
        self.sector
            .clone()
            .unwrap_or_else(|| UNCLASSIFIED_SECTOR.to_string())
    }

    /// Check the snapshot can be used for trading inside `window`.
    pub fn validate(&self, window: &SessionWindow) -> Result<(), ProducerFailure> {
        match self.last_price() {
            Some(p) if p > Decimal::ZERO => {}
            Some(p) => {
                return Err(ProducerFailure::invalid(format!(
                    "{}: non-positive price {}",
                    self.symbol, p
                )))
            }
            None => {
                return Err(ProducerFailure::invalid(format!(
                    "{}: no price available",
                    self.symbol
                )))
            }
        }
        if !window.accepts(self.as_of) {
            return Err(ProducerFailure::new(
                FailureKind::InvalidData,
                format!(
                    "{}: snapshot at {} outside session window {} .. {}",
                    self.symbol, self.as_of, window.earliest_data, window.closes_at
                ),
            ));
        }
        Ok(())
    }
}

pub const UNCLASSIFIED_SECTOR: &str = "UNCLASSIFIED";

/// Trading session bounds for one trading date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub opens_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
    /// Oldest acceptable snapshot timestamp
    pub earliest_data: DateTime<Utc>,
}

impl SessionWindow {
    /// Build the window for `date` from local wall-clock times at a fixed UTC offset.
    pub fn for_date(
        date: NaiveDate,
        open: NaiveTime,
        close: NaiveTime,
        utc_offset_minutes: i32,
        max_data_age: Duration,
    ) -> Self {
        let offset = Duration::minutes(i64::from(utc_offset_minutes));
        let opens_at = Utc.from_utc_datetime(&date.and_time(open)) - offset;
        let closes_at = Utc.from_utc_datetime(&date.and_time(close)) - offset;
        Self {
            opens_at,
            closes_at,
            earliest_data: opens_at - max_data_age,
        }
    }

    pub fn accepts(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.earliest_data && ts <= self.closes_at
    }
}
