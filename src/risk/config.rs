use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DeskError, Result};

/// 熔斷暫停上限（一週）
pub const MAX_PAUSE_MINUTES: i64 = 7 * 24 * 60;

/// 風控配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// 單一持倉佔組合淨值上限
    pub max_position_fraction: Decimal,
    /// 單一產業佔組合淨值上限
    pub max_sector_fraction: Decimal,
    /// 總曝險 / 淨值上限
    pub max_leverage: Decimal,
    /// 每日最大損失 (佔淨值比例)
    pub daily_loss_limit_fraction: Decimal,
    /// 每月最大損失 (佔淨值比例)
    pub monthly_loss_limit_fraction: Decimal,
    /// 連續虧損幾筆後暫停
    pub consecutive_loss_threshold: u32,
    /// 暫停時間 (分鐘)
    pub pause_minutes: i64,
    /// 禁止開新倉的標的
    pub blocked_instruments: Vec<String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_fraction: Decimal::new(10, 2),
            max_sector_fraction: Decimal::new(30, 2),
            max_leverage: Decimal::ONE,
            daily_loss_limit_fraction: Decimal::new(2, 2),
            monthly_loss_limit_fraction: Decimal::new(6, 2),
            consecutive_loss_threshold: 3,
            pause_minutes: 60,
            blocked_instruments: Vec::new(),
        }
    }
}

impl RiskConfig {
    pub fn pause(&self) -> Duration {
        Duration::minutes(self.pause_minutes)
    }

    pub fn validate(&self) -> Result<()> {
        let fractions = [
            ("max_position_fraction", self.max_position_fraction),
            ("max_sector_fraction", self.max_sector_fraction),
            ("daily_loss_limit_fraction", self.daily_loss_limit_fraction),
            ("monthly_loss_limit_fraction", self.monthly_loss_limit_fraction),
        ];
        for (name, value) in fractions {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(DeskError::InvalidConfig(format!(
                    "risk.{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.max_position_fraction > self.max_sector_fraction {
            return Err(DeskError::InvalidConfig(
                "risk.max_position_fraction cannot exceed risk.max_sector_fraction".to_string(),
            ));
        }
        if self.max_leverage <= Decimal::ZERO {
            return Err(DeskError::InvalidConfig(format!(
                "risk.max_leverage must be positive, got {}",
                self.max_leverage
            )));
        }
        if self.consecutive_loss_threshold == 0 {
            return Err(DeskError::InvalidConfig(
                "risk.consecutive_loss_threshold must be at least 1".to_string(),
            ));
        }
        if self.pause_minutes <= 0 || self.pause_minutes > MAX_PAUSE_MINUTES {
            return Err(DeskError::InvalidConfig(format!(
                "risk.pause_minutes must be in 1..={}, got {}",
                MAX_PAUSE_MINUTES, self.pause_minutes
            )));
        }
        Ok(())
    }
}
