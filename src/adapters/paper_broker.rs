//! Paper broker - fills every accepted order immediately at its price

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::execution::{ExecutionSink, FillListener};
use crate::coordinator::clock::Clock;
use crate::domain::{Fill, OrderAck, PortfolioState, PriceSpec};
use crate::error::{DeskError, Result};
use crate::risk::ApprovedOrder;

pub struct PaperBroker {
    book: RwLock<PortfolioState>,
    listener: RwLock<Option<Arc<dyn FillListener>>>,
    /// Symbols the broker refuses, for exercising rejection paths
    refused: RwLock<BTreeSet<String>>,
    fills: RwLock<Vec<Fill>>,
    /// Per-symbol fill price override
    fill_prices: RwLock<BTreeMap<String, Decimal>>,
    clock: Arc<dyn Clock>,
    next_order: AtomicU64,
}

impl PaperBroker {
    pub fn new(book: PortfolioState, clock: Arc<dyn Clock>) -> Self {
        Self {
            book: RwLock::new(book),
            listener: RwLock::new(None),
            refused: RwLock::new(BTreeSet::new()),
            fills: RwLock::new(Vec::new()),
            fill_prices: RwLock::new(BTreeMap::new()),
            clock,
            next_order: AtomicU64::new(1),
        }
    }

    pub async fn set_listener(&self, listener: Arc<dyn FillListener>) {
        *self.listener.write().await = Some(listener);
    }

    pub async fn refuse(&self, symbol: &str) {
        self.refused.write().await.insert(symbol.to_string());
    }

    /// Fill future orders for `symbol` at `price` instead of the order price.
    pub async fn set_fill_price(&self, symbol: &str, price: Decimal) {
        self.fill_prices
            .write()
            .await
            .insert(symbol.to_string(), price);
    }

    pub async fn fills(&self) -> Vec<Fill> {
        self.fills.read().await.clone()
    }
}

#[async_trait]
impl ExecutionSink for PaperBroker {
    async fn submit(&self, order: ApprovedOrder) -> Result<OrderAck> {
        if self.refused.read().await.contains(order.symbol()) {
            warn!("Paper broker refused {}", order.symbol());
            return Err(DeskError::OrderRejected(format!(
                "{} not tradable at paper broker",
                order.symbol()
            )));
        }

        let intent = order.intent();
        let price = match self.fill_prices.read().await.get(order.symbol()) {
            Some(p) => *p,
            None => match intent.price {
                PriceSpec::Limit(p) => p,
                PriceSpec::Market => intent.reference_price,
            },
        };
        let now = self.clock.now();
        let n = self.next_order.fetch_add(1, Ordering::SeqCst);
        let ack = OrderAck {
            intent_id: order.intent_id(),
            broker_order_id: format!("PAPER-{:06}", n),
            accepted_at: now,
        };
        let fill = Fill {
            intent_id: order.intent_id(),
            symbol: intent.symbol.clone(),
            sector: intent.sector.clone(),
            side: order.side(),
            quantity: order.quantity(),
            price,
            filled_at: now,
        };

        self.book.write().await.apply_fill(&fill);
        self.fills.write().await.push(fill.clone());
        info!(
            "Paper fill {} {} {} @ {} ({})",
            fill.side, fill.quantity, fill.symbol, fill.price, ack.broker_order_id
        );

        let listener = self.listener.read().await.clone();
        if let Some(listener) = listener {
            if let Err(e) = listener.on_fill(fill).await {
                error!("Fill listener failed: {}", e);
            }
        }
        Ok(ack)
    }

    async fn current_holdings(&self) -> Result<PortfolioState> {
        Ok(self.book.read().await.clone())
    }
}
