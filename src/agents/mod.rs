//! Agent adapters - collector, analyst and strategist behind one producer contract

pub mod analyst;
pub mod collector;
pub mod regime;
pub mod runner;
pub mod strategies;
pub mod strategist;
pub mod traits;

pub use analyst::{AnalysisReport, Analyst, AnalystConfig, TechnicalIndicators};
pub use collector::{Collected, Collector};
pub use regime::{
    market_regime, InvestmentMode, InvestmentThesis, MarketRegime, RegimeReading, ThesisConfig,
    ThesisPlan,
};
pub use runner::{wait_for_halt, ProducerRunner, RetryPolicy, SourceHealth};
pub use strategies::{StrategyFn, StrategyParams, StrategyRegistry};
pub use strategist::{StrategyConfig, Strategist};
pub use traits::{ProduceResult, Producer};
