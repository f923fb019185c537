//! Local exit rules evaluated before the close oracle is consulted.
//!
//! Two sources can force an exit without asking the oracle:
//! - stop/target levels of a stop-target position crossed by the last price
//! - the optional configured [`ClosePolicy`] (leveraged PnL thresholds, max hold)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use super::config::ClosePolicy;
use crate::models::{CloseReason, Position};

/// Exit signal with reason.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub reason: CloseReason,
    pub note: String,
}

impl ExitSignal {
    fn new(reason: CloseReason, note: impl Into<String>) -> Self {
        Self {
            reason,
            note: note.into(),
        }
    }
}

/// Exit rules for one execution mode.
#[derive(Debug, Clone, Default)]
pub struct ExitRules {
    policy: Option<ClosePolicy>,
}

impl ExitRules {
    pub fn new(policy: Option<ClosePolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> Option<&ClosePolicy> {
        self.policy.as_ref()
    }

    /// Stop or target crossed for a position carrying protective levels.
    pub fn check_levels(&self, position: &Position, price: Decimal) -> Option<ExitSignal> {
        match position.stop_target_hit(price)? {
            true => Some(ExitSignal::new(
                CloseReason::TakeProfit,
                format!("Target {} reached at {}", position.target_price.unwrap_or_default(), price),
            )),
            false => Some(ExitSignal::new(
                CloseReason::StopLoss,
                format!("Stop {} hit at {}", position.stop_price.unwrap_or_default(), price),
            )),
        }
    }

    /// Configured PnL and holding-time thresholds.
    pub fn check_policy(
        &self,
        position: &Position,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<ExitSignal> {
        let policy = self.policy.as_ref()?;
        let pnl_pct = position.pnl_percent_at(price);

        if let Some(tp) = policy.take_profit_pct {
            if pnl_pct >= tp {
                return Some(ExitSignal::new(
                    CloseReason::TakeProfit,
                    format!("PnL {:.2}% >= take profit {}%", pnl_pct, tp),
                ));
            }
        }

        if let Some(sl) = policy.stop_loss_pct {
            // Accept the threshold written either as -8 or 8
            if pnl_pct <= -sl.abs() {
                return Some(ExitSignal::new(
                    CloseReason::StopLoss,
                    format!("PnL {:.2}% <= stop loss -{}%", pnl_pct, sl.abs()),
                ));
            }
        }

        if let Some(max_minutes) = policy.max_hold_minutes {
            let age = position.age_minutes(now);
            if age >= max_minutes {
                return Some(ExitSignal::new(
                    CloseReason::TimeExit,
                    format!("Held {} min >= {} min", age, max_minutes),
                ));
            }
        }

        debug!(instrument = %position.instrument, pnl_pct = %pnl_pct.round_dp(2), "Close policy: hold");
        None
    }

    /// Levels first, then policy.
    pub fn check_exit(
        &self,
        position: &Position,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<ExitSignal> {
        self.check_levels(position, price)
            .or_else(|| self.check_policy(position, price, now))
    }
}
