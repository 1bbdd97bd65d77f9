//! Strategist - runs the enabled strategies over an analysis report

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::analyst::AnalysisReport;
use super::regime::{InvestmentThesis, RegimeReading, ThesisConfig};
use super::strategies::{StrategyFn, StrategyParams, StrategyRegistry};
use super::traits::{ProduceResult, Producer};
use crate::coordinator::state::CycleContext;
use crate::domain::Signal;
use crate::error::{DeskError, Result};

/// Which strategies run, their parameters and their weights in sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub enabled: Vec<String>,
    /// Fixed weights used by the `fixed` combining scheme (missing = 1)
    pub weights: BTreeMap<String, Decimal>,
    pub params: BTreeMap<String, StrategyParams>,
    /// Cash target and sector limits per market regime
    pub thesis: ThesisConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            enabled: vec![
                "momentum".to_string(),
                "value".to_string(),
                "mean_reversion".to_string(),
            ],
            weights: BTreeMap::new(),
            params: BTreeMap::new(),
            thesis: ThesisConfig::default(),
        }
    }
}

impl StrategyConfig {
    pub fn weight(&self, strategy: &str) -> Decimal {
        self.weights.get(strategy).copied().unwrap_or(Decimal::ONE)
    }
}

pub struct Strategist {
    strategies: Vec<(String, StrategyFn, StrategyParams)>,
    thesis: ThesisConfig,
}

impl Strategist {
    /// Resolve enabled strategy names against the registry.
    pub fn new(registry: &StrategyRegistry, config: &StrategyConfig) -> Result<Self> {
        let mut strategies = Vec::with_capacity(config.enabled.len());
        for name in &config.enabled {
            let f = registry.get(name).ok_or_else(|| {
                DeskError::InvalidConfig(format!(
                    "unknown strategy '{}' (available: {})",
                    name,
                    registry.names().join(", ")
                ))
            })?;
            let params = config.params.get(name).cloned().unwrap_or_default();
            strategies.push((name.clone(), f, params));
        }
        Ok(Self {
            strategies,
            thesis: config.thesis.clone(),
        })
    }

    /// Investment direction for the cycle from the market regime.
    pub fn thesis(&self, market: &RegimeReading) -> InvestmentThesis {
        self.thesis.thesis_for(market)
    }

    /// One signal per strategy that has an opinion, in enabled order.
    pub fn evaluate(&self, report: &AnalysisReport) -> Vec<Signal> {
        self.strategies
            .iter()
            .filter_map(|(_, f, params)| f(report, params))
            .collect()
    }
}

#[async_trait]
impl Producer for Strategist {
    type Input = Arc<AnalysisReport>;
    type Output = Vec<Signal>;

    fn name(&self) -> &str {
        "strategist"
    }

    async fn produce(
        &self,
        _ctx: &CycleContext,
        input: &Arc<AnalysisReport>,
    ) -> ProduceResult<Vec<Signal>> {
        Ok(self.evaluate(input))
    }
}
