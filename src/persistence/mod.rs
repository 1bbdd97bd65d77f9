//! Persistence for circuit breaker state and cycle reports
//!
//! - Breaker store: survives restarts so a pause or halt outlives the process
//! - Report sink: one JSON line per finished cycle

pub mod breaker_store;
pub mod report_sink;

pub use breaker_store::{BreakerStore, FileBreakerStore, MemoryBreakerStore};
pub use report_sink::{JsonlReportSink, MemoryReportSink, ReportSink};
