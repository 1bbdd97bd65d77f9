//! Market data source capability

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::agents::ProduceResult;
use crate::domain::MarketSnapshot;

/// One named provider of (possibly partial) market snapshots.
///
/// Implementations map their transport errors onto
/// [`FailureKind`](crate::error::FailureKind): connection problems are
/// `SourceUnavailable`, malformed payloads are `InvalidData`.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, symbol: &str, as_of: DateTime<Utc>) -> ProduceResult<MarketSnapshot>;
}

/// A data source plus how the collector treats its failures
#[derive(Clone)]
pub struct SourceRegistration {
    pub source: Arc<dyn DataSource>,
    /// Failure of a required source excludes the instrument; optional
    /// sources only degrade it.
    pub required: bool,
}

impl SourceRegistration {
    pub fn required(source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            required: true,
        }
    }

    pub fn optional(source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            required: false,
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }
}

impl std::fmt::Debug for SourceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistration")
            .field("name", &self.source.name())
            .field("required", &self.required)
            .finish()
    }
}
