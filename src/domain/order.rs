use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buy, -1 for sell
    pub fn sign(self) -> i64 {
        match self {
            OrderSide::Buy => 1,
            OrderSide::Sell => -1,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Price instruction for the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "price", rename_all = "lowercase")]
pub enum PriceSpec {
    Market,
    Limit(Decimal),
}

/// Execution urgency, most urgent first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Critical,
    High,
    Normal,
    Low,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Urgency::Critical => write!(f, "critical"),
            Urgency::High => write!(f, "high"),
            Urgency::Normal => write!(f, "normal"),
            Urgency::Low => write!(f, "low"),
        }
    }
}

/// Executable instruction produced by the CIO, pending risk review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub intent_id: Uuid,
    pub trading_date: NaiveDate,
    pub symbol: String,
    pub sector: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub price: PriceSpec,
    /// Price used for exposure arithmetic
    pub reference_price: Decimal,
    pub urgency: Urgency,
    pub confidence: Decimal,
    /// Sell that only shrinks an existing long position
    pub liquidating: bool,
    /// Position in the CIO's execution order, starting at 0
    pub rank: u32,
}

impl OrderIntent {
    /// Intent ids are derived from date, instrument and side so identical
    /// inputs yield identical intents.
    pub fn derive_id(date: NaiveDate, symbol: &str, side: OrderSide) -> Uuid {
        let key = format!("{}:{}:{}", date, symbol, side);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
    }
}

/// Broker acknowledgement of an accepted order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub intent_id: Uuid,
    pub broker_order_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Confirmed execution reported back by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub intent_id: Uuid,
    pub symbol: String,
    pub sector: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
}
