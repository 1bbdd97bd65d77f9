//! 風控裁決 - 審計記錄與核准訂單

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{OrderIntent, OrderSide};

/// 風控規則，依檢查順序排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRule {
    /// 1. 熔斷 / 暫停 / 停牌狀態
    State,
    /// 2. 單一持倉上限 (可裁剪)
    PositionSize,
    /// 3. 產業集中度上限 (可裁剪)
    SectorConcentration,
    /// 4. 槓桿上限 (只拒絕)
    Leverage,
    /// 5. 日 / 月損失上限 (只拒絕)
    LossLimit,
}

impl RiskRule {
    pub const ORDER: [RiskRule; 5] = [
        RiskRule::State,
        RiskRule::PositionSize,
        RiskRule::SectorConcentration,
        RiskRule::Leverage,
        RiskRule::LossLimit,
    ];
}

impl std::fmt::Display for RiskRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskRule::State => write!(f, "state"),
            RiskRule::PositionSize => write!(f, "position_size"),
            RiskRule::SectorConcentration => write!(f, "sector_concentration"),
            RiskRule::Leverage => write!(f, "leverage"),
            RiskRule::LossLimit => write!(f, "loss_limit"),
        }
    }
}

/// 單一檢查的結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CheckResult {
    Passed,
    Clipped { from: u64, to: u64 },
    Rejected,
}

/// 檢查軌跡中的一筆
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub rule: RiskRule,
    pub result: CheckResult,
    pub detail: String,
}

/// 最終裁決
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum VerdictOutcome {
    Approved { quantity: u64 },
    Rejected { reason: String },
    Modified { quantity: u64, reason: String },
}

impl std::fmt::Display for VerdictOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerdictOutcome::Approved { quantity } => write!(f, "approved ({})", quantity),
            VerdictOutcome::Rejected { reason } => write!(f, "rejected: {}", reason),
            VerdictOutcome::Modified { quantity, reason } => {
                write!(f, "modified to {}: {}", quantity, reason)
            }
        }
    }
}

/// 不可變的風控審計記錄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub cycle_id: Uuid,
    pub intent_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub requested_quantity: u64,
    pub liquidating: bool,
    pub outcome: VerdictOutcome,
    /// 決定結果的規則 (核准時為 None)
    pub rule: Option<RiskRule>,
    /// 依序執行過的檢查
    pub checks: Vec<CheckRecord>,
    pub evaluated_at: DateTime<Utc>,
}

impl RiskVerdict {
    /// 核准數量 (被拒絕時為 None)
    pub fn approved_quantity(&self) -> Option<u64> {
        match &self.outcome {
            VerdictOutcome::Approved { quantity } | VerdictOutcome::Modified { quantity, .. } => {
                Some(*quantity)
            }
            VerdictOutcome::Rejected { .. } => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.outcome, VerdictOutcome::Rejected { .. })
    }

    pub fn is_modified(&self) -> bool {
        matches!(self.outcome, VerdictOutcome::Modified { .. })
    }
}

/// 通過風控的訂單
///
/// 只能在 `crate::risk` 內建立；執行端只接受這個型別，
/// 所以任何下單都必須先經過風控。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovedOrder {
    intent: OrderIntent,
    quantity: u64,
    cycle_id: Uuid,
}

impl ApprovedOrder {
    pub(in crate::risk) fn new(intent: OrderIntent, quantity: u64, cycle_id: Uuid) -> Self {
        Self {
            intent,
            quantity,
            cycle_id,
        }
    }

    pub fn intent(&self) -> &OrderIntent {
        &self.intent
    }

    pub fn intent_id(&self) -> Uuid {
        self.intent.intent_id
    }

    pub fn symbol(&self) -> &str {
        &self.intent.symbol
    }

    pub fn side(&self) -> OrderSide {
        self.intent.side
    }

    /// 核准數量，可能小於意圖數量
    pub fn quantity(&self) -> u64 {
        self.quantity
    }

    pub fn cycle_id(&self) -> Uuid {
        self.cycle_id
    }
}
