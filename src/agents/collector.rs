//! Collector - merges named data sources into one snapshot per instrument

use tracing::debug;

use super::runner::ProducerRunner;
use super::traits::ProduceResult;
use crate::adapters::SourceRegistration;
use crate::coordinator::state::CycleContext;
use crate::domain::MarketSnapshot;
use crate::error::ProducerFailure;

/// Partial success of an instrument's collection
#[derive(Debug, Clone)]
pub struct Collected {
    pub snapshot: MarketSnapshot,
    /// Optional sources that failed, as `"name: failure"`
    pub missing: Vec<String>,
}

pub struct Collector {
    sources: Vec<SourceRegistration>,
}

impl Collector {
    /// Sources are consulted in registration order; earlier sources win
    /// when two supply the same field.
    pub fn new(sources: Vec<SourceRegistration>) -> Self {
        Self { sources }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Collect and validate one instrument.
    pub async fn collect(
        &self,
        ctx: &CycleContext,
        runner: &ProducerRunner,
        symbol: &str,
    ) -> ProduceResult<Collected> {
        let as_of = ctx.started_at;
        let session = ctx.session;
        let mut merged: Option<MarketSnapshot> = None;
        let mut missing = Vec::new();

        for reg in &self.sources {
            let name = reg.name().to_string();
            let label = name.as_str();
            let result = runner
                .run(label, symbol, || async move {
                    let snapshot = reg.source.fetch(symbol, as_of).await?;
                    if snapshot.symbol != symbol {
                        return Err(ProducerFailure::invalid(format!(
                            "{} returned {} for {}",
                            label, snapshot.symbol, symbol
                        )));
                    }
                    if !session.accepts(snapshot.as_of) {
                        return Err(ProducerFailure::invalid(format!(
                            "{} snapshot for {} is stale ({})",
                            label, symbol, snapshot.as_of
                        )));
                    }
                    Ok(snapshot)
                })
                .await;

            match result {
                Ok(mut part) => {
                    if !part.sources.contains(&name) {
                        part.sources.push(name);
                    }
                    match merged.as_mut() {
                        Some(m) => m.merge(part),
                        None => merged = Some(part),
                    }
                }
                Err(failure) if reg.required => return Err(failure),
                Err(failure) => {
                    debug!("optional source {} missing for {}: {}", name, symbol, failure);
                    missing.push(format!("{}: {}", name, failure));
                }
            }
        }

        let snapshot = merged.ok_or_else(|| {
            ProducerFailure::unavailable(format!("no source returned data for {}", symbol))
        })?;
        if let Err(failure) = snapshot.validate(&session) {
            runner
                .report_failure("collector", symbol, &failure, 1, true)
                .await;
            return Err(failure);
        }
        Ok(Collected { snapshot, missing })
    }
}
