//! Report sinks

use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::coordinator::CycleReport;
use crate::error::Result;

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, report: &CycleReport) -> Result<()>;
}

/// Appends one JSON document per line
pub struct JsonlReportSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Most recent report written for `date`. Unparseable lines are skipped.
    pub async fn latest_for(&self, date: NaiveDate) -> Result<Option<CycleReport>> {
        let body = match tokio::fs::read_to_string(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut latest = None;
        for (n, line) in body.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CycleReport>(line) {
                Ok(report) if report.trading_date == date => latest = Some(report),
                Ok(_) => {}
                Err(e) => warn!("Skipping malformed report line {}: {}", n + 1, e),
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl ReportSink for JsonlReportSink {
    async fn publish(&self, report: &CycleReport) -> Result<()> {
        let mut line = serde_json::to_string(report)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        info!(
            cycle_id = %report.cycle_id,
            status = %report.status,
            "Report written to {}",
            self.path.display()
        );
        Ok(())
    }
}

/// Keeps published reports in memory
#[derive(Default)]
pub struct MemoryReportSink {
    reports: RwLock<Vec<CycleReport>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<CycleReport> {
        self.reports.read().await.clone()
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn publish(&self, report: &CycleReport) -> Result<()> {
        self.reports.write().await.push(report.clone());
        Ok(())
    }
}
