//! Data models for positions, oracle decisions, signals, and trade history.

mod decision;
mod metrics;
mod position;
mod signal;
mod trade;

pub use decision::{Action, CloseDecision, CloseReason, Decision};
pub use metrics::TradeStats;
pub use position::{Direction, Position, PositionStatus};
pub use signal::{Candle, Crossover, SignalBundle, Timeframe, TimeframeSignal, Trend, TrendAlignment};
pub use trade::ClosedTrade;
