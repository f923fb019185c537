//! Trade statistics: win rate, profit factor, drawdown, Sharpe/Sortino.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{ClosedTrade, TradeStats};

/// Computes [`TradeStats`] from closed trades.
pub struct StatsCalculator;

impl StatsCalculator {
    /// Trades may arrive in any order; they are sorted by close time first.
    pub fn calculate(trades: &[ClosedTrade]) -> TradeStats {
        let mut stats = TradeStats::empty();
        if trades.is_empty() {
            return stats;
        }

        let mut ordered: Vec<&ClosedTrade> = trades.iter().collect();
        ordered.sort_by_key(|t| t.closed_at);
        let pnls: Vec<Decimal> = ordered.iter().map(|t| t.realized_pnl).collect();

        Self::calculate_pnl_stats(&mut stats, &pnls);
        Self::calculate_drawdown(&mut stats, &pnls);
        Self::calculate_sharpe_sortino(&mut stats, &pnls);

        let hold: Vec<f64> = ordered.iter().map(|t| t.duration_minutes() as f64).collect();
        stats.avg_hold_minutes = hold.mean();

        stats.calculated_at = Utc::now();
        stats
    }

    fn calculate_pnl_stats(stats: &mut TradeStats, pnls: &[Decimal]) {
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().partition(|&&p| p > Decimal::ZERO);

        stats.total_trades = pnls.len() as u32;
        stats.winning_trades = wins.len() as u32;
        stats.losing_trades = losses.len() as u32;
        stats.total_pnl = pnls.iter().copied().sum();
        stats.avg_pnl = stats.total_pnl / Decimal::from(pnls.len() as u32);
        stats.win_rate = wins.len() as f64 / pnls.len() as f64;

        if !wins.is_empty() {
            stats.avg_win = wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            stats.avg_loss = losses.iter().map(|l| l.abs()).sum::<Decimal>()
                / Decimal::from(losses.len() as u32);
        }

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();
        if gross_loss > Decimal::ZERO {
            stats.profit_factor =
                gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        }

        stats.best_trade = pnls.iter().copied().max().unwrap_or_default();
        stats.worst_trade = pnls.iter().copied().min().unwrap_or_default();
    }

    /// Drawdown of the cumulative PnL curve, starting from zero.
    fn calculate_drawdown(stats: &mut TradeStats, pnls: &[Decimal]) {
        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;

        for pnl in pnls {
            equity += pnl;
            if equity > peak {
                peak = equity;
            }
            max_dd = max_dd.max(peak - equity);
        }

        stats.max_drawdown_usd = max_dd;
    }

    fn calculate_sharpe_sortino(stats: &mut TradeStats, pnls: &[Decimal]) {
        if pnls.len() < 2 {
            return;
        }

        let returns: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();

        if std_dev > 0.0 {
            stats.sharpe_ratio = mean / std_dev;
        }

        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if downside.len() >= 2 {
            let downside_dev = downside.std_dev();
            if downside_dev > 0.0 {
                stats.sortino_ratio = mean / downside_dev;
            }
        }
    }
}
