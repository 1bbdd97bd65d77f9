//! Risk Guard - ordered pre-trade checks, circuit breaker and audit trail

pub mod breaker;
pub mod config;
pub mod guard;
pub mod verdict;

pub use breaker::{BreakerEvent, BreakerState, BreakerTrip, CircuitBreakerState, TripReason};
pub use config::RiskConfig;
pub use guard::{RiskEvaluation, RiskGuard};
pub use verdict::{ApprovedOrder, CheckRecord, CheckResult, RiskRule, RiskVerdict, VerdictOutcome};
