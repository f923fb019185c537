//! Trading logic: risk ledger, decision oracle, execution, exit rules.

mod config;
mod coordinator;
mod error;
mod fallback;
mod learning;
mod ledger;
mod oracle;
mod position_sizer;
mod prompt;
mod strategy;

pub use config::{AppConfig, ClosePolicy, ExecutionMode, OracleConfig, TradingConfig};
pub use coordinator::{ExecutionCoordinator, ExecutionOutcome, InstrumentState};
pub use learning::{LearningHook, TradeJournal};
pub use ledger::{LedgerSnapshot, RiskLedger};
pub use oracle::{AiOracle, DecisionOracle, EntryContext};
pub use strategy::ExitRules;
