//! Position sizing

pub mod manager;

pub use manager::{CombinedSignal, PortfolioManager, SizingConfig, WeightingScheme};
