//! Coordinator Commands - the external control surface

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::warn;

use super::report::CycleReport;
use super::state::CycleStatusView;
use crate::risk::CircuitBreakerState;

/// Commands accepted by [`Coordinator::execute`](super::Coordinator::execute)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CoordinatorCommand {
    StartCycle { date: NaiveDate },
    CycleStatus { date: NaiveDate },
    ForceHalt { reason: String },
    ClearHalt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum CommandResponse {
    Report(Box<CycleReport>),
    Status(Option<CycleStatusView>),
    Breaker(Box<CircuitBreakerState>),
}

/// Emergency-halt flag shared by the coordinator, producers and the risk guard.
///
/// Producers hold a `watch::Receiver` and observe the flag between attempts
/// and during backoff.
#[derive(Clone)]
pub struct ControlPlane {
    halt_tx: Arc<watch::Sender<bool>>,
    reason: Arc<RwLock<Option<String>>>,
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlane {
    pub fn new() -> Self {
        let (halt_tx, _) = watch::channel(false);
        Self {
            halt_tx: Arc::new(halt_tx),
            reason: Arc::new(RwLock::new(None)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.halt_tx.subscribe()
    }

    pub async fn request_halt(&self, reason: &str) {
        warn!(reason, "emergency halt requested");
        *self.reason.write().await = Some(reason.to_string());
        self.halt_tx.send_replace(true);
    }

    pub async fn clear(&self) {
        *self.reason.write().await = None;
        self.halt_tx.send_replace(false);
    }

    pub fn is_halted(&self) -> bool {
        *self.halt_tx.borrow()
    }

    pub async fn reason(&self) -> Option<String> {
        self.reason.read().await.clone()
    }
}
