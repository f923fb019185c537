//! Aggregate statistics over closed trades.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Performance summary computed from trade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeStats {
    pub calculated_at: DateTime<Utc>,

    // === Counts ===
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,

    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    // === P&L ===
    pub total_pnl: Decimal,
    pub avg_pnl: Decimal,
    pub avg_win: Decimal,

    /// Average loss on losing trades (absolute value)
    pub avg_loss: Decimal,

    /// Gross profit / gross loss
    pub profit_factor: f64,

    pub best_trade: Decimal,
    pub worst_trade: Decimal,

    // === Risk ===
    /// Largest peak-to-trough decline of cumulative PnL in USD
    pub max_drawdown_usd: Decimal,

    /// Per-trade Sharpe ratio (risk-free rate 0)
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,

    pub avg_hold_minutes: f64,
}

impl TradeStats {
    pub fn empty() -> Self {
        Self {
            calculated_at: Utc::now(),
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            total_pnl: Decimal::ZERO,
            avg_pnl: Decimal::ZERO,
            avg_win: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            profit_factor: 0.0,
            best_trade: Decimal::ZERO,
            worst_trade: Decimal::ZERO,
            max_drawdown_usd: Decimal::ZERO,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            avg_hold_minutes: 0.0,
        }
    }
}

impl fmt::Display for TradeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Trading Statistics ===")?;
        writeln!(f, "Total Trades:    {} (Won: {}, Lost: {})",
            self.total_trades, self.winning_trades, self.losing_trades)?;
        writeln!(f, "Win Rate:        {:.1}%", self.win_rate * 100.0)?;
        writeln!(f, "Total P&L:       ${:.2}", self.total_pnl)?;
        writeln!(f, "Average P&L:     ${:.2}", self.avg_pnl)?;
        writeln!(f, "Avg Win / Loss:  ${:.2} / ${:.2}", self.avg_win, self.avg_loss)?;
        writeln!(f, "Profit Factor:   {:.2}", self.profit_factor)?;
        writeln!(f, "Best / Worst:    ${:.2} / ${:.2}", self.best_trade, self.worst_trade)?;
        writeln!(f, "Max Drawdown:    ${:.2}", self.max_drawdown_usd)?;
        writeln!(f, "Sharpe Ratio:    {:.2}", self.sharpe_ratio)?;
        writeln!(f, "Sortino Ratio:   {:.2}", self.sortino_ratio)?;
        writeln!(f, "Avg Hold:        {:.0} min", self.avg_hold_minutes)?;
        Ok(())
    }
}
