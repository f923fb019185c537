//! Closed trade record appended to history.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{CloseReason, Direction, Position};

/// Immutable copy of a position at the moment it was closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub instrument: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub notional_usd: Decimal,
    pub leverage: u32,
    pub realized_pnl: Decimal,
    pub close_reason: CloseReason,
    /// Oracle reasoning behind the close, if any
    pub close_note: String,
    pub confidence: u8,
    pub rationale: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn from_position(
        position: &Position,
        exit_price: Decimal,
        reason: CloseReason,
        note: impl Into<String>,
        closed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument: position.instrument.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            notional_usd: position.notional_usd,
            leverage: position.leverage,
            realized_pnl: position.pnl_at(exit_price),
            close_reason: reason,
            close_note: note.into(),
            confidence: position.confidence,
            rationale: position.rationale.clone(),
            opened_at: position.opened_at,
            closed_at,
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.closed_at - self.opened_at).num_minutes()
    }

    /// Realized PnL as a percent of committed capital.
    pub fn return_pct(&self) -> Decimal {
        if self.notional_usd.is_zero() {
            return Decimal::ZERO;
        }
        self.realized_pnl / self.notional_usd * Decimal::ONE_HUNDRED
    }
}
