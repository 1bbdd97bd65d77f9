//! 週期事件類型

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::state::{CycleStage, CycleStatus, StageOutcome};
use crate::domain::{OrderAck, OrderIntent, PositionProposal};
use crate::error::FailureKind;
use crate::risk::RiskVerdict;

/// 事件主題
///
/// 順序只在同一主題內保證。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// 週期生命週期與階段轉換
    Cycle,
    /// 資料與分析產出
    Production,
    /// 生產者失敗
    ProducerFailed,
    /// 倉位提案與 CIO 決策
    Decision,
    /// 風控裁決與熔斷
    Risk,
    /// 下單與成交
    Execution,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Cycle => write!(f, "cycle"),
            Topic::Production => write!(f, "production"),
            Topic::ProducerFailed => write!(f, "producer_failed"),
            Topic::Decision => write!(f, "decision"),
            Topic::Risk => write!(f, "risk"),
            Topic::Execution => write!(f, "execution"),
        }
    }
}

/// 生產者失敗記錄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerFailedEvent {
    pub producer: String,
    pub symbol: String,
    pub kind: FailureKind,
    pub message: String,
    /// 第幾次嘗試 (從 1 開始)
    pub attempt: u32,
    /// 是否為最終失敗 (不再重試)
    pub terminal: bool,
}

/// 事件內容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    CycleStarted {
        trading_date: NaiveDate,
    },
    StageEntered {
        stage: CycleStage,
    },
    StageCompleted {
        stage: CycleStage,
        outcome: StageOutcome,
    },
    SnapshotCollected {
        symbol: String,
        sources: Vec<String>,
    },
    AnalysisReady {
        symbol: String,
    },
    SignalsReady {
        symbol: String,
        count: usize,
    },
    ProducerFailed(ProducerFailedEvent),
    ProposalIssued(PositionProposal),
    IntentDecided(OrderIntent),
    VerdictIssued(RiskVerdict),
    CircuitBreakerTripped {
        paused_until: DateTime<Utc>,
        consecutive_losses: u32,
    },
    EmergencyHalt {
        reason: String,
    },
    OrderSubmitted(OrderAck),
    OrderFailed {
        intent_id: Uuid,
        symbol: String,
        reason: String,
    },
    CycleCompleted {
        status: CycleStatus,
    },
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::CycleStarted { .. }
            | EventPayload::StageEntered { .. }
            | EventPayload::StageCompleted { .. }
            | EventPayload::CycleCompleted { .. } => Topic::Cycle,
            EventPayload::SnapshotCollected { .. }
            | EventPayload::AnalysisReady { .. }
            | EventPayload::SignalsReady { .. } => Topic::Production,
            EventPayload::ProducerFailed(_) => Topic::ProducerFailed,
            EventPayload::ProposalIssued(_) | EventPayload::IntentDecided(_) => Topic::Decision,
            EventPayload::VerdictIssued(_)
            | EventPayload::CircuitBreakerTripped { .. }
            | EventPayload::EmergencyHalt { .. } => Topic::Risk,
            EventPayload::OrderSubmitted(_) | EventPayload::OrderFailed { .. } => Topic::Execution,
        }
    }
}

/// 事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleEvent {
    pub topic: Topic,
    pub cycle_id: Uuid,
    /// 發送者 (生產者或元件名稱)
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl CycleEvent {
    pub fn new(cycle_id: Uuid, source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            topic: payload.topic(),
            cycle_id,
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
