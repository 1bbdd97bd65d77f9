//! File-backed data sources for offline cycles
//!
//! A fixture is one JSON document holding the starting portfolio and one
//! entry per named source. Each source can script failures and delays per
//! instrument.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::data_source::{DataSource, SourceRegistration};
use crate::agents::ProduceResult;
use crate::domain::{MarketSnapshot, PortfolioState};
use crate::error::{DeskError, FailureKind, ProducerFailure, Result};

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSourceSpec {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub snapshots: Vec<MarketSnapshot>,
    /// Instruments this source fails for, and how
    #[serde(default)]
    pub failures: BTreeMap<String, FailureKind>,
    /// Artificial latency per instrument
    #[serde(default)]
    pub delays_ms: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketFixture {
    #[serde(default)]
    pub universe: Vec<String>,
    pub portfolio: PortfolioState,
    pub sources: Vec<FixtureSourceSpec>,
}

impl MarketFixture {
    pub async fn load(path: &Path) -> Result<Self> {
        let body = tokio::fs::read_to_string(path).await?;
        let fixture: MarketFixture = serde_json::from_str(&body)?;
        if fixture.sources.is_empty() {
            return Err(DeskError::InvalidConfig(format!(
                "fixture {} defines no sources",
                path.display()
            )));
        }
        Ok(fixture)
    }

    /// Explicit universe, or every instrument any source knows about.
    pub fn instruments(&self) -> Vec<String> {
        if !self.universe.is_empty() {
            return self.universe.clone();
        }
        let mut all: Vec<String> = self
            .sources
            .iter()
            .flat_map(|s| s.snapshots.iter().map(|snap| snap.symbol.clone()))
            .collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn registrations(&self) -> Vec<SourceRegistration> {
        self.sources
            .iter()
            .map(|spec| {
                let source: Arc<dyn DataSource> = Arc::new(FixtureSource::from_spec(spec.clone()));
                if spec.required {
                    SourceRegistration::required(source)
                } else {
                    SourceRegistration::optional(source)
                }
            })
            .collect()
    }
}

/// One scripted data source
pub struct FixtureSource {
    name: String,
    snapshots: BTreeMap<String, MarketSnapshot>,
    failures: BTreeMap<String, FailureKind>,
    delays: BTreeMap<String, Duration>,
}

impl FixtureSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshots: BTreeMap::new(),
            failures: BTreeMap::new(),
            delays: BTreeMap::new(),
        }
    }

    pub fn from_spec(spec: FixtureSourceSpec) -> Self {
        let mut source = Self::new(spec.name);
        for snapshot in spec.snapshots {
            source = source.with_snapshot(snapshot);
        }
        source.failures = spec.failures;
        source.delays = spec
            .delays_ms
            .into_iter()
            .map(|(k, ms)| (k, Duration::from_millis(ms)))
            .collect();
        source
    }

    pub fn with_snapshot(mut self, snapshot: MarketSnapshot) -> Self {
        self.snapshots.insert(snapshot.symbol.clone(), snapshot);
        self
    }

    pub fn with_failure(mut self, symbol: &str, kind: FailureKind) -> Self {
        self.failures.insert(symbol.to_string(), kind);
        self
    }

    pub fn with_delay(mut self, symbol: &str, delay: Duration) -> Self {
        self.delays.insert(symbol.to_string(), delay);
        self
    }
}

#[async_trait]
impl DataSource for FixtureSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, symbol: &str, _as_of: DateTime<Utc>) -> ProduceResult<MarketSnapshot> {
        if let Some(delay) = self.delays.get(symbol) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(kind) = self.failures.get(symbol) {
            debug!("{} scripted {:?} for {}", self.name, kind, symbol);
            return Err(ProducerFailure::new(
                *kind,
                format!("{} scripted failure for {}", self.name, symbol),
            ));
        }
        self.snapshots.get(symbol).cloned().ok_or_else(|| {
            ProducerFailure::unavailable(format!("{} has no data for {}", self.name, symbol))
        })
    }
}
