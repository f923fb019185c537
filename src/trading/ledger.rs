//! Risk ledger: the single owner of budget and live positions.
//!
//! Every instrument is in one of three ledger states: absent, reserved
//! (capital taken, order in flight), or active. Conservation holds after
//! every call:
//!
//! `available + committed == total_budget + realized_pnl`
//!
//! where `committed` is the capital held by reservations and active
//! positions.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::config::TradingConfig;
use super::error::{AdmissionRejected, LedgerError};
use crate::models::{Position, PositionStatus};

/// Handle shared by the coordinator, monitor, and persistence.
///
/// Holding the lock across an `await` is what makes admit, reserve, and
/// the opening order one critical section.
pub type SharedLedger = Arc<Mutex<RiskLedger>>;

#[derive(Debug, Clone)]
enum Slot {
    Reserved(Decimal),
    Active(Position),
}

impl Slot {
    fn committed(&self) -> Decimal {
        match self {
            Slot::Reserved(size) => *size,
            Slot::Active(position) => position.notional_usd,
        }
    }
}

/// Point-in-time view for logging, status output, and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub total_budget: Decimal,
    pub available_budget: Decimal,
    pub committed: Decimal,
    pub realized_pnl: Decimal,
    pub closed_trades: u32,
    pub positions: Vec<Position>,
}

#[derive(Debug, Clone)]
pub struct RiskLedger {
    total_budget: Decimal,
    max_concurrent_positions: usize,
    max_position_size_percent: Decimal,
    available: Decimal,
    realized_pnl: Decimal,
    closed_trades: u32,
    slots: HashMap<String, Slot>,
}

impl RiskLedger {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            total_budget: config.total_budget,
            max_concurrent_positions: config.max_concurrent_positions,
            max_position_size_percent: config.max_position_size_percent,
            available: config.total_budget,
            realized_pnl: Decimal::ZERO,
            closed_trades: 0,
            slots: HashMap::new(),
        }
    }

    /// Rebuild from persisted state. Available budget is derived, never stored.
    pub fn restore(
        config: &TradingConfig,
        realized_pnl: Decimal,
        closed_trades: u32,
        positions: Vec<Position>,
    ) -> Result<Self, LedgerError> {
        let mut ledger = Self::new(config);
        ledger.realized_pnl = realized_pnl;
        ledger.closed_trades = closed_trades;
        ledger.available = config.total_budget + realized_pnl;

        for position in positions {
            if ledger.slots.contains_key(&position.instrument) {
                return Err(LedgerError::AlreadyActive(position.instrument));
            }
            ledger.available -= position.notional_usd;
            ledger.slots.insert(position.instrument.clone(), Slot::Active(position));
        }

        Ok(ledger)
    }

    pub fn shared(self) -> SharedLedger {
        Arc::new(Mutex::new(self))
    }

    // ==================== Admission ====================

    /// Pure check; does not mutate.
    pub fn can_admit(&self, instrument: &str, size_usd: Decimal) -> Result<(), AdmissionRejected> {
        if size_usd <= Decimal::ZERO {
            return Err(AdmissionRejected::InvalidSize(size_usd));
        }
        if self.slots.contains_key(instrument) {
            return Err(AdmissionRejected::AlreadyOpen(instrument.to_string()));
        }
        if self.slots.len() >= self.max_concurrent_positions {
            return Err(AdmissionRejected::ConcurrencyLimit(self.max_concurrent_positions));
        }
        if size_usd > self.available {
            return Err(AdmissionRejected::InsufficientBudget {
                requested: size_usd,
                available: self.available,
            });
        }
        let cap = self.max_position_size();
        if size_usd > cap {
            return Err(AdmissionRejected::SizeLimit {
                requested: size_usd,
                cap,
            });
        }
        Ok(())
    }

    /// Take `size_usd` from the available budget for `instrument`.
    ///
    /// Re-runs the admission check so a stale `can_admit` result can never
    /// overshoot the limits.
    pub fn reserve(&mut self, instrument: &str, size_usd: Decimal) -> Result<(), AdmissionRejected> {
        self.can_admit(instrument, size_usd)?;
        self.available -= size_usd;
        self.slots.insert(instrument.to_string(), Slot::Reserved(size_usd));
        Ok(())
    }

    /// Turn a reservation into a live position once the exchange accepted the order.
    pub fn activate(&mut self, position: Position) -> Result<(), LedgerError> {
        match self.slots.get(&position.instrument) {
            Some(Slot::Reserved(reserved)) if *reserved == position.notional_usd => {
                self.slots.insert(position.instrument.clone(), Slot::Active(position));
                Ok(())
            }
            Some(Slot::Reserved(reserved)) => Err(LedgerError::SizeMismatch {
                instrument: position.instrument.clone(),
                reserved: *reserved,
                committed: position.notional_usd,
            }),
            Some(Slot::Active(_)) => Err(LedgerError::AlreadyActive(position.instrument)),
            None => Err(LedgerError::Unknown(position.instrument)),
        }
    }

    /// Return principal plus `realized_pnl` to the budget.
    ///
    /// Used both for closing an active position and for rolling back a
    /// reservation whose order failed (with zero PnL). Returns the removed
    /// position marked CLOSED, or `None` for a rollback.
    pub fn release(
        &mut self,
        instrument: &str,
        realized_pnl: Decimal,
    ) -> Result<Option<Position>, LedgerError> {
        let slot = self
            .slots
            .remove(instrument)
            .ok_or_else(|| LedgerError::Unknown(instrument.to_string()))?;

        self.available += slot.committed() + realized_pnl;
        self.realized_pnl += realized_pnl;

        match slot {
            Slot::Reserved(_) => Ok(None),
            Slot::Active(mut position) => {
                self.closed_trades += 1;
                position.status = PositionStatus::Closed;
                Ok(Some(position))
            }
        }
    }

    // ==================== Queries ====================

    pub fn position(&self, instrument: &str) -> Option<&Position> {
        match self.slots.get(instrument) {
            Some(Slot::Active(position)) => Some(position),
            _ => None,
        }
    }

    pub fn is_reserved(&self, instrument: &str) -> bool {
        matches!(self.slots.get(instrument), Some(Slot::Reserved(_)))
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(position) => Some(position.clone()),
                Slot::Reserved(_) => None,
            })
            .collect();
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        positions
    }

    /// Reservations count: they occupy a concurrency slot.
    pub fn open_count(&self) -> usize {
        self.slots.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.len() < self.max_concurrent_positions
    }

    pub fn available(&self) -> Decimal {
        self.available
    }

    pub fn total_budget(&self) -> Decimal {
        self.total_budget
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn committed(&self) -> Decimal {
        self.slots.values().map(Slot::committed).sum()
    }

    pub fn max_position_size(&self) -> Decimal {
        self.total_budget * self.max_position_size_percent / Decimal::ONE_HUNDRED
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            total_budget: self.total_budget,
            available_budget: self.available,
            committed: self.committed(),
            realized_pnl: self.realized_pnl,
            closed_trades: self.closed_trades,
            positions: self.positions(),
        }
    }

    /// Check conservation, concurrency, and per-position size.
    pub fn check_invariants(&self) -> Result<(), String> {
        let lhs = self.available + self.committed();
        let rhs = self.total_budget + self.realized_pnl;
        if lhs != rhs {
            return Err(format!("conservation broken: {} != {}", lhs, rhs));
        }
        if self.slots.len() > self.max_concurrent_positions {
            return Err(format!(
                "{} open slots exceed limit {}",
                self.slots.len(),
                self.max_concurrent_positions
            ));
        }
        if let Some(Slot::Active(p)) = self
            .slots
            .values()
            .find(|s| matches!(s, Slot::Active(p) if p.status != PositionStatus::Active))
        {
            return Err(format!("{} is live but marked {:?}", p.instrument, p.status));
        }
        let cap = self.max_position_size();
        if let Some(slot) = self.slots.values().find(|s| s.committed() > cap) {
            return Err(format!("slot commits {} above cap {}", slot.committed(), cap));
        }
        Ok(())
    }
}
