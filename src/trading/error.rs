//! Failure types for admission, ledger bookkeeping, and execution.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::exchange::ExchangeError;

/// Why the ledger refused to admit a new position.
///
/// Surfaced to the monitor as a no-op, never retried in the same tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionRejected {
    #[error("Position already exists for {0}")]
    AlreadyOpen(String),

    #[error("Max concurrent trades reached ({0})")]
    ConcurrencyLimit(usize),

    #[error("Insufficient budget: requested ${requested}, available ${available}")]
    InsufficientBudget { requested: Decimal, available: Decimal },

    #[error("Position size too large: ${requested} exceeds cap ${cap}")]
    SizeLimit { requested: Decimal, cap: Decimal },

    #[error("Position size must be positive, got ${0}")]
    InvalidSize(Decimal),
}

/// Bookkeeping call made against the wrong slot state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("No reservation or position for {0}")]
    Unknown(String),

    #[error("{0} already has an active position")]
    AlreadyActive(String),

    #[error("Reservation for {instrument} is ${reserved} but position commits ${committed}")]
    SizeMismatch {
        instrument: String,
        reserved: Decimal,
        committed: Decimal,
    },
}

/// A coordinator action that did not happen.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Invalid entry price {0}")]
    InvalidPrice(Decimal),

    #[error("Quantity for ${size_usd} x{leverage} at {price} rounds to zero")]
    ZeroQuantity {
        size_usd: Decimal,
        leverage: u32,
        price: Decimal,
    },

    #[error("Quantity for ${size_usd} x{leverage} at {price} is out of range")]
    QuantityOutOfRange {
        size_usd: Decimal,
        leverage: u32,
        price: Decimal,
    },

    #[error("Stop-target mode needs stop and target levels")]
    MissingStopTarget,

    #[error("{instrument} is busy ({state})")]
    Busy { instrument: String, state: String },

    #[error("Exchange call failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Ledger inconsistency: {0}")]
    Ledger(#[from] LedgerError),

    #[error("History append failed: {0}")]
    History(String),
}
