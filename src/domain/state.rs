use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::order::Fill;

/// A single position held by the account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub sector: String,
    /// Signed share count (negative = short)
    pub quantity: i64,
    pub avg_price: Decimal,
    pub market_price: Decimal,
}

impl Holding {
    pub fn new(
        symbol: impl Into<String>,
        sector: impl Into<String>,
        quantity: i64,
        avg_price: Decimal,
        market_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            sector: sector.into(),
            quantity,
            avg_price,
            market_price,
        }
    }

    /// Signed market value
    pub fn market_value(&self) -> Decimal {
        Decimal::from(self.quantity) * self.market_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        (self.market_price - self.avg_price) * Decimal::from(self.quantity)
    }
}

/// Unrealized P&L on open positions when the current day and month began
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodMarks {
    pub day: Decimal,
    pub month: Decimal,
}

/// Holdings, cash and P&L of the account.
///
/// Read-mostly: stages work on a clone taken at cycle start, and only
/// confirmed fills change holdings through [`PortfolioState::apply_fill`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub as_of: DateTime<Utc>,
    pub cash: Decimal,
    #[serde(default)]
    pub holdings: BTreeMap<String, Holding>,
    #[serde(default)]
    pub realized_pnl_day: Decimal,
    #[serde(default)]
    pub realized_pnl_month: Decimal,
    /// Day the realized counters belong to
    pub pnl_date: NaiveDate,
    /// Set on the first roll; until then positions count as opened this period
    #[serde(default)]
    pub period_open: Option<PeriodMarks>,
}

impl PortfolioState {
    pub fn new(cash: Decimal, as_of: DateTime<Utc>) -> Self {
        Self {
            as_of,
            cash,
            holdings: BTreeMap::new(),
            realized_pnl_day: Decimal::ZERO,
            realized_pnl_month: Decimal::ZERO,
            pnl_date: as_of.date_naive(),
            period_open: None,
        }
    }

    pub fn with_holding(mut self, holding: Holding) -> Self {
        self.holdings.insert(holding.symbol.clone(), holding);
        self
    }

    /// Cash plus signed market value of all holdings
    pub fn total_value(&self) -> Decimal {
        self.cash
            + self
                .holdings
                .values()
                .map(Holding::market_value)
                .sum::<Decimal>()
    }

    pub fn quantity(&self, symbol: &str) -> i64 {
        self.holdings.get(symbol).map(|h| h.quantity).unwrap_or(0)
    }

    /// Signed market value of one position
    pub fn position_value(&self, symbol: &str) -> Decimal {
        self.holdings
            .get(symbol)
            .map(Holding::market_value)
            .unwrap_or(Decimal::ZERO)
    }

    /// Absolute market value held in `sector`
    pub fn sector_exposure(&self, sector: &str) -> Decimal {
        self.holdings
            .values()
            .filter(|h| h.sector == sector)
            .map(|h| h.market_value().abs())
            .sum()
    }

    /// Sum of absolute position values
    pub fn gross_exposure(&self) -> Decimal {
        self.holdings.values().map(|h| h.market_value().abs()).sum()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.holdings.values().map(Holding::unrealized_pnl).sum()
    }

    /// Realized P&L today plus the change in unrealized P&L since the day began
    pub fn daily_pnl(&self) -> Decimal {
        let unrealized = self.unrealized_pnl();
        let open = self.period_open.map(|m| m.day).unwrap_or(unrealized);
        self.realized_pnl_day + unrealized - open
    }

    /// Realized P&L this month plus the change in unrealized P&L since the month began
    pub fn monthly_pnl(&self) -> Decimal {
        let unrealized = self.unrealized_pnl();
        let open = self.period_open.map(|m| m.month).unwrap_or(unrealized);
        self.realized_pnl_month + unrealized - open
    }

    /// Update the mark price of a holding.
    pub fn mark(&mut self, symbol: &str, price: Decimal) {
        if let Some(h) = self.holdings.get_mut(symbol) {
            h.market_price = price;
        }
    }

    /// Start a new day or month when `date` is later than the current one.
    ///
    /// Realized counters reset and the current unrealized P&L becomes the
    /// period's opening mark. Earlier dates leave the period unchanged.
    pub fn roll_period(&mut self, date: NaiveDate) {
        let unrealized = self.unrealized_pnl();
        let marks = self.period_open.get_or_insert(PeriodMarks {
            day: unrealized,
            month: unrealized,
        });
        if date <= self.pnl_date {
            return;
        }
        if date.year() != self.pnl_date.year() || date.month() != self.pnl_date.month() {
            self.realized_pnl_month = Decimal::ZERO;
            marks.month = unrealized;
        }
        self.realized_pnl_day = Decimal::ZERO;
        marks.day = unrealized;
        self.pnl_date = date;
    }

    /// Apply a confirmed fill. Returns the realized P&L when the fill
    /// reduced an existing position, `None` when it only added exposure.
    /// Zero-quantity fills change nothing.
    pub fn apply_fill(&mut self, fill: &Fill) -> Option<Decimal> {
        if fill.quantity == 0 {
            return None;
        }
        self.roll_period(fill.filled_at.date_naive());
        self.as_of = fill.filled_at;

        let qty = i64::try_from(fill.quantity).unwrap_or(i64::MAX);
        let delta = fill.side.sign() * qty;
        self.cash -= Decimal::from(delta) * fill.price;

        let holding = self
            .holdings
            .entry(fill.symbol.clone())
            .or_insert_with(|| Holding::new(&fill.symbol, &fill.sector, 0, fill.price, fill.price));
        holding.market_price = fill.price;

        let current = holding.quantity;
        let realized = if current == 0 || current.signum() == delta.signum() {
            let held = Decimal::from(current.abs());
            let added = Decimal::from(delta.abs());
            holding.avg_price = (holding.avg_price * held + fill.price * added) / (held + added);
            holding.quantity = current + delta;
            None
        } else {
            let closed = delta.abs().min(current.abs());
            let pnl = (fill.price - holding.avg_price)
                * Decimal::from(closed)
                * Decimal::from(current.signum());
            holding.quantity = current + delta;
            if holding.quantity != 0 && holding.quantity.signum() != current.signum() {
                // Flipped through zero; the remainder opened at the fill price.
                holding.avg_price = fill.price;
            }
            Some(pnl)
        };

        if holding.quantity == 0 {
            self.holdings.remove(&fill.symbol);
        }
        if let Some(pnl) = realized {
            self.realized_pnl_day += pnl;
            self.realized_pnl_month += pnl;
        }
        realized
    }
}
