//! Circuit breaker state
//!
//! Persisted across cycles and mutated only through the risk guard.
//! `Normal -> Paused` after consecutive realized losses, `Paused -> Normal`
//! once the window has elapsed, `Halted` only by external control and only
//! cleared by external control.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

const MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    Normal,
    Paused { until: DateTime<Utc> },
    Halted { reason: String, since: DateTime<Utc> },
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Normal => write!(f, "normal"),
            BreakerState::Paused { until } => write!(f, "paused until {}", until.to_rfc3339()),
            BreakerState::Halted { reason, .. } => write!(f, "halted ({})", reason),
        }
    }
}

/// Why the breaker changed state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum TripReason {
    ConsecutiveLosses(u32),
    PauseElapsed,
    ManualHalt(String),
    HaltCleared,
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::ConsecutiveLosses(n) => write!(f, "{} consecutive losses", n),
            TripReason::PauseElapsed => write!(f, "pause window elapsed"),
            TripReason::ManualHalt(reason) => write!(f, "manual: {}", reason),
            TripReason::HaltCleared => write!(f, "halt cleared"),
        }
    }
}

/// State transition record (bounded history)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub timestamp: DateTime<Utc>,
    pub reason: TripReason,
    pub state: BreakerState,
}

/// Returned when a loss trips or extends the pause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTrip {
    pub paused_until: DateTime<Utc>,
    pub consecutive_losses: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: BreakerState,
    pub consecutive_losses: u32,
    /// Active pause window, kept while halted so clearing a halt can
    /// fall back into it
    #[serde(default)]
    pub paused_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<BreakerEvent>,
    pub updated_at: DateTime<Utc>,
}

impl CircuitBreakerState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: BreakerState::Normal,
            consecutive_losses: 0,
            paused_until: None,
            history: Vec::new(),
            updated_at: now,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, BreakerState::Halted { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, BreakerState::Paused { .. })
    }

    /// Whether risk-increasing orders may pass the state check
    pub fn allows_new_risk(&self) -> bool {
        matches!(self.state, BreakerState::Normal)
    }

    /// Release an elapsed pause. Returns true if the state changed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let elapsed = matches!(self.paused_until, Some(until) if now >= until);
        if !elapsed {
            return false;
        }
        self.paused_until = None;
        if self.is_paused() {
            info!("Circuit breaker pause elapsed, back to normal");
            self.transition(BreakerState::Normal, TripReason::PauseElapsed, now);
            return true;
        }
        false
    }

    /// Feed one realized trade result.
    ///
    /// A loss increments the counter, a win resets it, breakeven leaves it.
    /// Reaching `threshold` opens (or extends) the pause window and resets
    /// the counter.
    pub fn record_outcome(
        &mut self,
        realized_pnl: Decimal,
        now: DateTime<Utc>,
        threshold: u32,
        pause: Duration,
    ) -> Option<BreakerTrip> {
        self.refresh(now);
        self.updated_at = now;

        if realized_pnl > Decimal::ZERO {
            self.consecutive_losses = 0;
            return None;
        }
        if realized_pnl == Decimal::ZERO {
            return None;
        }

        self.consecutive_losses += 1;
        if self.consecutive_losses < threshold.max(1) {
            return None;
        }

        let losses = self.consecutive_losses;
        let proposed = now + pause;
        // The window can only be extended, never shortened.
        let until = match self.paused_until {
            Some(existing) if existing > proposed => existing,
            _ => proposed,
        };
        self.paused_until = Some(until);
        self.consecutive_losses = 0;

        if self.is_halted() {
            warn!(
                "{} consecutive losses while halted; pause window recorded until {}",
                losses, until
            );
            return Some(BreakerTrip {
                paused_until: until,
                consecutive_losses: losses,
            });
        }

        error!(
            "CIRCUIT BREAKER TRIPPED: {} consecutive losses, paused until {}",
            losses, until
        );
        self.transition(
            BreakerState::Paused { until },
            TripReason::ConsecutiveLosses(losses),
            now,
        );
        Some(BreakerTrip {
            paused_until: until,
            consecutive_losses: losses,
        })
    }

    /// Enter `Halted`. Returns false if already halted.
    pub fn force_halt(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        if self.is_halted() {
            return false;
        }
        error!("EMERGENCY HALT: {}", reason);
        self.transition(
            BreakerState::Halted {
                reason: reason.to_string(),
                since: now,
            },
            TripReason::ManualHalt(reason.to_string()),
            now,
        );
        true
    }

    /// Leave `Halted`, falling back into a still-active pause window.
    /// Returns false if not halted.
    pub fn clear_halt(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_halted() {
            return false;
        }
        let next = match self.paused_until {
            Some(until) if until > now => BreakerState::Paused { until },
            _ => {
                self.paused_until = None;
                BreakerState::Normal
            }
        };
        info!("Halt cleared, breaker now {}", next);
        self.transition(next, TripReason::HaltCleared, now);
        true
    }

    fn transition(&mut self, state: BreakerState, reason: TripReason, now: DateTime<Utc>) {
        self.state = state.clone();
        self.updated_at = now;
        self.history.push(BreakerEvent {
            timestamp: now,
            reason,
            state,
        });
        if self.history.len() > MAX_HISTORY {
            let drain = self.history.len() - MAX_HISTORY;
            self.history.drain(0..drain);
        }
    }
}
