//! Coordinator Configuration

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::state::CycleStage;
use crate::domain::SessionWindow;
use crate::error::{DeskError, Result};

/// Per-stage wall-clock budgets (ms)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub collecting_ms: u64,
    pub analyzing_ms: u64,
    pub strategizing_ms: u64,
    /// Covers guard evaluation plus order submission
    pub risk_checking_ms: u64,
    pub reporting_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            collecting_ms: 60_000,
            analyzing_ms: 30_000,
            strategizing_ms: 30_000,
            risk_checking_ms: 30_000,
            reporting_ms: 10_000,
        }
    }
}

impl StageTimeouts {
    /// Budget for an async stage. Sizing and Deciding are pure and unbounded.
    pub fn for_stage(&self, stage: CycleStage) -> Option<Duration> {
        let ms = match stage {
            CycleStage::Collecting => self.collecting_ms,
            CycleStage::Analyzing => self.analyzing_ms,
            CycleStage::Strategizing => self.strategizing_ms,
            CycleStage::RiskChecking => self.risk_checking_ms,
            CycleStage::Reporting => self.reporting_ms,
            CycleStage::Idle | CycleStage::Sizing | CycleStage::Deciding => return None,
        };
        Some(Duration::from_millis(ms))
    }
}

/// Exchange session used for data freshness checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// Exchange offset from UTC
    pub utc_offset_minutes: i32,
    /// How far before the open a snapshot may be taken
    pub max_data_age_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            utc_offset_minutes: 540,
            max_data_age_hours: 24,
        }
    }
}

impl SessionConfig {
    pub fn window_for(&self, date: NaiveDate) -> SessionWindow {
        SessionWindow::for_date(
            date,
            self.open,
            self.close,
            self.utc_offset_minutes,
            ChronoDuration::hours(self.max_data_age_hours),
        )
    }
}

/// Configuration for the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Instruments evaluated each cycle
    pub universe: Vec<String>,
    /// Concurrent producer calls within a stage
    pub max_concurrency: usize,
    pub stage_timeouts: StageTimeouts,
    pub session: SessionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            universe: Vec::new(),
            max_concurrency: 8,
            stage_timeouts: StageTimeouts::default(),
            session: SessionConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(DeskError::InvalidConfig(
                "coordinator.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.session.close <= self.session.open {
            return Err(DeskError::InvalidConfig(
                "session.close must be after session.open".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for symbol in &self.universe {
            if !seen.insert(symbol) {
                return Err(DeskError::InvalidConfig(format!(
                    "instrument {} listed twice in universe",
                    symbol
                )));
            }
        }
        Ok(())
    }
}
