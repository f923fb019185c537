//! Performance statistics over trade history.

mod calculator;

pub use calculator::StatsCalculator;
