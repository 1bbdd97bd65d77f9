//! Risk Guard - 訂單風控閘門
//!
//! 每個 OrderIntent 依固定順序檢查：
//! 1. 狀態 (熔斷 / 暫停 / 停牌)
//! 2. 單一持倉上限 (可裁剪)
//! 3. 產業集中度 (可裁剪)
//! 4. 槓桿 (只拒絕)
//! 5. 日 / 月損失 (只拒絕，平倉單不受限)
//!
//! 第一個拒絕的檢查決定結果；前面的裁剪只會被後面的檢查再縮小。
//! 熔斷狀態只由這裡修改，成交回報同時更新持倉與熔斷計數。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::breaker::{BreakerState, BreakerTrip, CircuitBreakerState};
use super::config::RiskConfig;
use super::verdict::{
    ApprovedOrder, CheckRecord, CheckResult, RiskRule, RiskVerdict, VerdictOutcome,
};
use crate::adapters::FillListener;
use crate::domain::{Fill, Holding, OrderIntent, PortfolioState};
use crate::error::Result;
use crate::events::{CycleEvent, EventBus, EventPayload};
use crate::persistence::BreakerStore;

const SOURCE: &str = "risk_guard";

/// 一批意圖的風控結果
#[derive(Debug, Clone, Default)]
pub struct RiskEvaluation {
    /// 與輸入順序一致
    pub verdicts: Vec<RiskVerdict>,
    pub approved: Vec<ApprovedOrder>,
}

/// 單一檢查步驟
enum Step {
    Pass(String),
    Clip(u64, String),
    Reject(String),
}

/// 一批檢查共用的快照
struct Checks<'a> {
    config: &'a RiskConfig,
    breaker: &'a CircuitBreakerState,
    blocked: &'a BTreeSet<String>,
    halt_requested: bool,
    /// 批次開始時的組合淨值
    equity: Decimal,
    daily_pnl: Decimal,
    monthly_pnl: Decimal,
}

impl Checks<'_> {
    fn evaluate(
        &self,
        book: &mut PortfolioState,
        intent: &OrderIntent,
        cycle_id: Uuid,
        now: DateTime<Utc>,
    ) -> RiskVerdict {
        let requested = intent.quantity;
        let mut quantity = requested;
        let mut checks = Vec::with_capacity(RiskRule::ORDER.len());
        let mut clipped_by: Option<(RiskRule, String)> = None;

        let verdict = |outcome: VerdictOutcome, rule: Option<RiskRule>, checks: Vec<CheckRecord>| {
            RiskVerdict {
                cycle_id,
                intent_id: intent.intent_id,
                symbol: intent.symbol.clone(),
                side: intent.side,
                requested_quantity: requested,
                liquidating: intent.liquidating,
                outcome,
                rule,
                checks,
                evaluated_at: now,
            }
        };

        for rule in RiskRule::ORDER {
            let step = match rule {
                RiskRule::State => self.check_state(intent),
                RiskRule::PositionSize => self.check_position(book, intent, quantity),
                RiskRule::SectorConcentration => self.check_sector(book, intent, quantity),
                RiskRule::Leverage => self.check_leverage(book, intent, quantity),
                RiskRule::LossLimit => self.check_loss(intent),
            };
            match step {
                Step::Pass(detail) => checks.push(CheckRecord {
                    rule,
                    result: CheckResult::Passed,
                    detail,
                }),
                Step::Clip(to, detail) if to > 0 => {
                    checks.push(CheckRecord {
                        rule,
                        result: CheckResult::Clipped { from: quantity, to },
                        detail: detail.clone(),
                    });
                    quantity = to;
                    clipped_by = Some((rule, detail));
                }
                Step::Clip(_, reason) | Step::Reject(reason) => {
                    checks.push(CheckRecord {
                        rule,
                        result: CheckResult::Rejected,
                        detail: reason.clone(),
                    });
                    return verdict(VerdictOutcome::Rejected { reason }, Some(rule), checks);
                }
            }
        }

        project(book, intent, quantity);
        match clipped_by {
            Some((rule, reason)) => verdict(
                VerdictOutcome::Modified { quantity, reason },
                Some(rule),
                checks,
            ),
            None => verdict(VerdictOutcome::Approved { quantity }, None, checks),
        }
    }

    fn check_state(&self, intent: &OrderIntent) -> Step {
        if intent.liquidating {
            return Step::Pass("liquidating order".to_string());
        }
        if self.halt_requested {
            return Step::Reject("trading halted: emergency halt requested".to_string());
        }
        match &self.breaker.state {
            BreakerState::Halted { reason, .. } => {
                Step::Reject(format!("trading halted: {}", reason))
            }
            BreakerState::Paused { until } => Step::Reject(format!(
                "circuit breaker paused until {}",
                until.to_rfc3339()
            )),
            BreakerState::Normal if self.blocked.contains(&intent.symbol) => {
                Step::Reject(format!("instrument {} is blocked", intent.symbol))
            }
            BreakerState::Normal => Step::Pass("normal".to_string()),
        }
    }

    fn check_position(&self, book: &PortfolioState, intent: &OrderIntent, quantity: u64) -> Step {
        if !intent.liquidating && self.equity <= Decimal::ZERO {
            return Step::Reject(format!("portfolio value {} is not positive", self.equity));
        }
        if intent.reference_price <= Decimal::ZERO {
            return Step::Reject(format!(
                "invalid reference price {}",
                intent.reference_price
            ));
        }
        let limit = self.config.max_position_fraction * self.equity;
        let max_shares = shares_within(limit, intent.reference_price);
        let allowed = allowed_quantity(max_shares, book.quantity(&intent.symbol), intent, quantity);
        if allowed >= quantity {
            Step::Pass(format!("position within {}", limit.round_dp(2)))
        } else {
            Step::Clip(
                allowed,
                format!(
                    "position capped at {} of portfolio value ({} shares)",
                    self.config.max_position_fraction, max_shares
                ),
            )
        }
    }

    fn check_sector(&self, book: &PortfolioState, intent: &OrderIntent, quantity: u64) -> Step {
        let others: Decimal = book
            .holdings
            .values()
            .filter(|h| h.sector == intent.sector && h.symbol != intent.symbol)
            .map(|h| h.market_value().abs())
            .sum();
        let limit = self.config.max_sector_fraction * self.equity;
        let max_shares = shares_within(limit - others, intent.reference_price);
        let allowed = allowed_quantity(max_shares, book.quantity(&intent.symbol), intent, quantity);
        if allowed >= quantity {
            Step::Pass(format!("sector {} within {}", intent.sector, limit.round_dp(2)))
        } else {
            Step::Clip(
                allowed,
                format!(
                    "sector {} capped at {} of portfolio value",
                    intent.sector, self.config.max_sector_fraction
                ),
            )
        }
    }

    fn check_leverage(&self, book: &PortfolioState, intent: &OrderIntent, quantity: u64) -> Step {
        let held = book.quantity(&intent.symbol);
        let post = held + intent.side.sign() * to_i64(quantity);
        let held_value = Decimal::from(held.abs()) * intent.reference_price;
        let post_value = Decimal::from(post.abs()) * intent.reference_price;
        let others = book.gross_exposure() - book.position_value(&intent.symbol).abs();
        let gross = others + post_value;
        let limit = self.config.max_leverage * self.equity;
        if post_value > held_value && gross > limit {
            Step::Reject(format!(
                "gross exposure {} would exceed {}x leverage",
                gross.round_dp(2),
                self.config.max_leverage
            ))
        } else {
            Step::Pass(format!("gross exposure {}", gross.round_dp(2)))
        }
    }

    fn check_loss(&self, intent: &OrderIntent) -> Step {
        if intent.liquidating {
            return Step::Pass("liquidating order".to_string());
        }
        let daily_limit = self.config.daily_loss_limit_fraction * self.equity;
        if -self.daily_pnl >= daily_limit {
            return Step::Reject(format!(
                "daily loss {} reached limit {}",
                (-self.daily_pnl).round_dp(2),
                daily_limit.round_dp(2)
            ));
        }
        let monthly_limit = self.config.monthly_loss_limit_fraction * self.equity;
        if -self.monthly_pnl >= monthly_limit {
            return Step::Reject(format!(
                "monthly loss {} reached limit {}",
                (-self.monthly_pnl).round_dp(2),
                monthly_limit.round_dp(2)
            ));
        }
        Step::Pass("loss within limits".to_string())
    }
}

fn to_i64(quantity: u64) -> i64 {
    i64::try_from(quantity).unwrap_or(i64::MAX)
}

/// Whole shares of `price` that fit in `budget`
fn shares_within(budget: Decimal, price: Decimal) -> i64 {
    if budget <= Decimal::ZERO || price <= Decimal::ZERO {
        return 0;
    }
    (budget / price).floor().to_i64().unwrap_or(i64::MAX)
}

/// Largest quantity <= `quantity` that keeps |held + side * q| <= max_shares.
fn allowed_quantity(max_shares: i64, held: i64, intent: &OrderIntent, quantity: u64) -> u64 {
    let cap = max_shares.saturating_sub(intent.side.sign() * held);
    if cap <= 0 {
        return 0;
    }
    quantity.min(cap.unsigned_abs())
}

/// Apply an approved quantity to the running exposure book at the reference price.
fn project(book: &mut PortfolioState, intent: &OrderIntent, quantity: u64) {
    let delta = intent.side.sign() * to_i64(quantity);
    book.cash -= Decimal::from(delta) * intent.reference_price;
    let holding = book
        .holdings
        .entry(intent.symbol.clone())
        .or_insert_with(|| {
            Holding::new(
                &intent.symbol,
                &intent.sector,
                0,
                intent.reference_price,
                intent.reference_price,
            )
        });
    holding.quantity += delta;
    holding.market_price = intent.reference_price;
    if holding.quantity == 0 {
        book.holdings.remove(&intent.symbol);
    }
}

/// 風控閘門
///
/// 所有訂單在送出前都必須通過這個閘門；執行端只接受它產生的 [`ApprovedOrder`]。
pub struct RiskGuard {
    config: Arc<RwLock<RiskConfig>>,
    /// 熔斷狀態 (唯一寫入者)
    breaker: Arc<RwLock<CircuitBreakerState>>,
    /// 禁止開新倉的標的
    blocked: Arc<RwLock<BTreeSet<String>>>,
    /// 只增不減的裁決記錄
    audit: Arc<RwLock<Vec<RiskVerdict>>>,
    /// 由成交回報更新的持倉
    portfolio: Arc<RwLock<Option<PortfolioState>>>,
    active_cycle: Arc<RwLock<Option<Uuid>>>,
    store: Arc<dyn BreakerStore>,
    bus: Option<EventBus>,
}

impl RiskGuard {
    pub fn new(config: RiskConfig, store: Arc<dyn BreakerStore>, now: DateTime<Utc>) -> Result<Self> {
        config.validate()?;
        let blocked = config.blocked_instruments.iter().cloned().collect();
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            breaker: Arc::new(RwLock::new(CircuitBreakerState::new(now))),
            blocked: Arc::new(RwLock::new(blocked)),
            audit: Arc::new(RwLock::new(Vec::new())),
            portfolio: Arc::new(RwLock::new(None)),
            active_cycle: Arc::new(RwLock::new(None)),
            store,
            bus: None,
        })
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replace the in-memory breaker with the persisted one, if any, and
    /// expire an elapsed pause.
    ///
    /// Unreadable breaker state is returned as an error and nothing changes.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<CircuitBreakerState> {
        let loaded = self.store.load().await?;
        let mut breaker = self.breaker.write().await;
        if let Some(state) = loaded {
            *breaker = state;
        }
        if breaker.refresh(now) {
            self.store.save(&breaker).await?;
        }
        Ok(breaker.clone())
    }

    /// Load persisted breaker state and take the cycle's portfolio.
    pub async fn begin_cycle(
        &self,
        cycle_id: Uuid,
        portfolio: &PortfolioState,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerState> {
        let snapshot = self.restore(now).await?;
        *self.portfolio.write().await = Some(portfolio.clone());
        *self.active_cycle.write().await = Some(cycle_id);
        info!(
            "Risk guard ready for cycle {}: breaker {}, {} consecutive losses",
            cycle_id, snapshot.state, snapshot.consecutive_losses
        );
        Ok(snapshot)
    }

    /// Run every intent through checks 1-5 in order, against a running
    /// exposure book so earlier approvals count toward later limits.
    pub async fn evaluate_batch(
        &self,
        cycle_id: Uuid,
        intents: &[OrderIntent],
        portfolio: &PortfolioState,
        halt_requested: bool,
        now: DateTime<Utc>,
    ) -> RiskEvaluation {
        let breaker = {
            let mut breaker = self.breaker.write().await;
            if breaker.refresh(now) {
                self.persist(&breaker).await;
            }
            breaker.clone()
        };
        let config = self.config.read().await.clone();
        let blocked = self.blocked.read().await.clone();

        let checks = Checks {
            config: &config,
            breaker: &breaker,
            blocked: &blocked,
            halt_requested,
            equity: portfolio.total_value(),
            daily_pnl: portfolio.daily_pnl(),
            monthly_pnl: portfolio.monthly_pnl(),
        };

        let mut book = portfolio.clone();
        let mut evaluation = RiskEvaluation::default();
        for intent in intents {
            let verdict = checks.evaluate(&mut book, intent, cycle_id, now);
            match (&verdict.outcome, verdict.rule) {
                (VerdictOutcome::Rejected { reason }, Some(rule)) => {
                    warn!("{} {} {} rejected by {}: {}", intent.symbol, intent.side, intent.quantity, rule, reason)
                }
                (VerdictOutcome::Modified { quantity, reason }, Some(rule)) => {
                    info!("{} {} modified {} -> {} by {}: {}", intent.symbol, intent.side, intent.quantity, quantity, rule, reason)
                }
                _ => debug!("{} {} {} approved", intent.symbol, intent.side, intent.quantity),
            }
            if let Some(quantity) = verdict.approved_quantity() {
                evaluation
                    .approved
                    .push(ApprovedOrder::new(intent.clone(), quantity, cycle_id));
            }
            evaluation.verdicts.push(verdict);
        }

        self.audit
            .write()
            .await
            .extend(evaluation.verdicts.iter().cloned());
        evaluation
    }

    /// Apply a confirmed fill to the portfolio and feed any realized P&L to
    /// the circuit breaker.
    pub async fn record_fill(&self, fill: &Fill) -> Result<Option<BreakerTrip>> {
        let realized = {
            let mut portfolio = self.portfolio.write().await;
            match portfolio.as_mut() {
                Some(p) => p.apply_fill(fill),
                None => {
                    warn!("Fill for {} received before any cycle started, ignored", fill.symbol);
                    return Ok(None);
                }
            }
        };
        let Some(pnl) = realized else {
            return Ok(None);
        };

        let (threshold, pause) = {
            let config = self.config.read().await;
            (config.consecutive_loss_threshold, config.pause())
        };
        let (trip, snapshot) = {
            let mut breaker = self.breaker.write().await;
            let trip = breaker.record_outcome(pnl, fill.filled_at, threshold, pause);
            (trip, breaker.clone())
        };
        debug!(
            "{} realized {} ({} consecutive losses)",
            fill.symbol, pnl, snapshot.consecutive_losses
        );
        self.store.save(&snapshot).await?;

        if let Some(trip) = trip {
            self.publish(EventPayload::CircuitBreakerTripped {
                paused_until: trip.paused_until,
                consecutive_losses: trip.consecutive_losses,
            })
            .await;
        }
        Ok(trip)
    }

    /// Enter `Halted`. Returns false if it already was.
    pub async fn force_halt(&self, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let snapshot = {
            let mut breaker = self.breaker.write().await;
            if !breaker.force_halt(reason, now) {
                return Ok(false);
            }
            breaker.clone()
        };
        self.store.save(&snapshot).await?;
        self.publish(EventPayload::EmergencyHalt {
            reason: reason.to_string(),
        })
        .await;
        Ok(true)
    }

    /// Leave `Halted`. Returns false if it was not halted.
    pub async fn clear_halt(&self, now: DateTime<Utc>) -> Result<bool> {
        let snapshot = {
            let mut breaker = self.breaker.write().await;
            if !breaker.clear_halt(now) {
                return Ok(false);
            }
            breaker.clone()
        };
        self.store.save(&snapshot).await?;
        Ok(true)
    }

    /// Swap limits. The block list is reset to the new configuration's.
    pub async fn reload_limits(&self, config: RiskConfig) -> Result<()> {
        config.validate()?;
        *self.blocked.write().await = config.blocked_instruments.iter().cloned().collect();
        *self.config.write().await = config;
        info!("Risk limits reloaded");
        Ok(())
    }

    pub async fn block_instrument(&self, symbol: &str) {
        if self.blocked.write().await.insert(symbol.to_string()) {
            warn!("Instrument {} blocked", symbol);
        }
    }

    pub async fn unblock_instrument(&self, symbol: &str) {
        if self.blocked.write().await.remove(symbol) {
            info!("Instrument {} unblocked", symbol);
        }
    }

    pub async fn blocked_instruments(&self) -> Vec<String> {
        self.blocked.read().await.iter().cloned().collect()
    }

    pub async fn config(&self) -> RiskConfig {
        self.config.read().await.clone()
    }

    pub async fn breaker_state(&self) -> CircuitBreakerState {
        self.breaker.read().await.clone()
    }

    pub async fn portfolio(&self) -> Option<PortfolioState> {
        self.portfolio.read().await.clone()
    }

    pub async fn audit(&self) -> Vec<RiskVerdict> {
        self.audit.read().await.clone()
    }

    pub async fn audit_for(&self, cycle_id: Uuid) -> Vec<RiskVerdict> {
        self.audit
            .read()
            .await
            .iter()
            .filter(|v| v.cycle_id == cycle_id)
            .cloned()
            .collect()
    }

    async fn persist(&self, state: &CircuitBreakerState) {
        if let Err(e) = self.store.save(state).await {
            error!("Failed to persist breaker state: {}", e);
        }
    }

    async fn publish(&self, payload: EventPayload) {
        let Some(bus) = &self.bus else {
            return;
        };
        let cycle_id = self.active_cycle.read().await.unwrap_or_else(Uuid::nil);
        bus.publish(CycleEvent::new(cycle_id, SOURCE, payload)).await;
    }
}

#[async_trait]
impl FillListener for RiskGuard {
    async fn on_fill(&self, fill: Fill) -> Result<()> {
        self.record_fill(&fill).await.map(|_| ())
    }
}
