//! Live leveraged position.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Side of a futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            other => anyhow::bail!("Unknown direction: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Active,
    Closed,
}

/// One open position. At most one exists per instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    /// Capital committed from the budget (margin), not leveraged exposure
    pub notional_usd: Decimal,
    pub leverage: u32,
    pub has_stop_target: bool,
    pub stop_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub confidence: u8,
    pub rationale: String,
}

impl Position {
    /// Exchange-facing exposure (size x leverage).
    pub fn exposure_usd(&self) -> Decimal {
        self.notional_usd * Decimal::from(self.leverage)
    }

    /// Realized/unrealized PnL in USD if the position were closed at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity * self.direction.sign()
    }

    /// Leveraged percent move since entry, signed for the position side.
    pub fn pnl_percent_at(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price
            * dec!(100)
            * Decimal::from(self.leverage)
            * self.direction.sign()
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_minutes()
    }

    /// Whether a stop or target level has been crossed at `price`.
    pub fn stop_target_hit(&self, price: Decimal) -> Option<bool> {
        if !self.has_stop_target {
            return None;
        }
        let (stop, target) = (self.stop_price?, self.target_price?);
        let hit_target = match self.direction {
            Direction::Long => price >= target,
            Direction::Short => price <= target,
        };
        if hit_target {
            return Some(true);
        }
        let hit_stop = match self.direction {
            Direction::Long => price <= stop,
            Direction::Short => price >= stop,
        };
        if hit_stop {
            return Some(false);
        }
        None
    }
}
