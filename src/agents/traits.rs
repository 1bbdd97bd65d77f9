//! Producer trait - uniform contract for every analysis stage
//!
//! Collector sources, the analyst and the strategist all answer one
//! instrument at a time and never keep state between cycles. The
//! coordinator wraps every call in a [`ProducerRunner`](super::ProducerRunner)
//! so timeouts, retries and failure events are handled in one place.

use async_trait::async_trait;

use crate::coordinator::state::CycleContext;
use crate::error::ProducerFailure;

/// Result of a single producer call
pub type ProduceResult<T> = std::result::Result<T, ProducerFailure>;

/// Stateless per-cycle producer.
#[async_trait]
pub trait Producer: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    /// Name used in failure events and source health tracking
    fn name(&self) -> &str;

    /// Produce output for one instrument.
    async fn produce(&self, ctx: &CycleContext, input: &Self::Input)
        -> ProduceResult<Self::Output>;
}
