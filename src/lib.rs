pub mod adapters;
pub mod agents;
pub mod cio;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod events;
pub mod persistence;
pub mod portfolio;
pub mod risk;

pub use config::AppConfig;
pub use coordinator::{Coordinator, CoordinatorHandle, CycleReport, CycleStatus, Pipeline};
pub use error::{DeskError, ErrorClass, Result};
pub use events::{CycleEvent, EventBus, EventPayload, Topic};
pub use risk::{ApprovedOrder, CircuitBreakerState, RiskConfig, RiskGuard};
