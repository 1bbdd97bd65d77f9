//! Main Coordinator
//!
//! Runs one cycle per trading date through collection, analysis, strategy,
//! sizing, the CIO decision, the risk guard and reporting. External control
//! is limited to starting a cycle, querying its status and raising or
//! clearing the emergency halt.

pub mod clock;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod report;
pub mod state;

pub use clock::{Clock, FixedClock, SystemClock};
pub use command::{CommandResponse, ControlPlane, CoordinatorCommand};
pub use config::{CoordinatorConfig, SessionConfig, StageTimeouts};
pub use coordinator::{Coordinator, CoordinatorHandle, Pipeline};
pub use report::{CycleReport, ExecutionResult, InstrumentOutcome};
pub use state::{
    cycle_id_for, CycleContext, CycleRunState, CycleStage, CycleStatus, CycleStatusView,
    DegradedMarker, Exclusion, StageOutcome, StageRecord,
};
