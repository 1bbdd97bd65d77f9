//! Broker-facing capabilities

use async_trait::async_trait;

use crate::domain::{Fill, OrderAck, PortfolioState};
use crate::error::Result;
use crate::risk::ApprovedOrder;

/// Where approved orders go.
///
/// Only [`ApprovedOrder`] is accepted, and only the risk guard can build
/// one, so nothing reaches the broker without a verdict.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    /// `Err(DeskError::OrderRejected)` when the broker refuses the order.
    async fn submit(&self, order: ApprovedOrder) -> Result<OrderAck>;

    /// Holdings, cash and P&L as the broker reports them.
    async fn current_holdings(&self) -> Result<PortfolioState>;
}

/// Receives confirmed fills from the broker.
#[async_trait]
pub trait FillListener: Send + Sync {
    async fn on_fill(&self, fill: Fill) -> Result<()>;
}
