//! Deterministic local decision used when the remote oracle is unavailable.
//!
//! Four votes, each bullish, bearish, or abstaining:
//! - 1h trend
//! - 4h trend
//! - 1h RSI extremity (< 35 bullish, > 65 bearish)
//! - 15m EMA crossover
//!
//! Three or more votes on one side with at most one opposing opens a
//! reduced-size position; anything else holds.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{Action, Crossover, Decision, SignalBundle, Timeframe, Trend};

const FALLBACK_SIZE_USD: Decimal = dec!(20);
const FALLBACK_LEVERAGE: u32 = 5;
const FALLBACK_CONFIDENCE: u8 = 60;
const HOLD_CONFIDENCE: u8 = 40;
const RSI_OVERSOLD: f64 = 35.0;
const RSI_OVERBOUGHT: f64 = 65.0;
const RSI_NEUTRAL: f64 = 50.0;

/// Bullish and bearish vote counts for a bundle.
pub fn tally(bundle: &SignalBundle) -> (u32, u32) {
    let mut bullish = 0;
    let mut bearish = 0;

    for tf in [Timeframe::H1, Timeframe::H4] {
        match bundle.trend(tf) {
            Some(Trend::Bullish) => bullish += 1,
            Some(Trend::Bearish) => bearish += 1,
            _ => {}
        }
    }

    let rsi = bundle.get(Timeframe::H1).and_then(|s| s.rsi).unwrap_or(RSI_NEUTRAL);
    if rsi < RSI_OVERSOLD {
        bullish += 1;
    } else if rsi > RSI_OVERBOUGHT {
        bearish += 1;
    }

    match bundle.get(Timeframe::M15).map(|s| s.crossover) {
        Some(Crossover::Golden) => bullish += 1,
        Some(Crossover::Death) => bearish += 1,
        _ => {}
    }

    (bullish, bearish)
}

/// Heuristic entry decision. Size is capped at `max_size_usd`.
pub fn decide(bundle: &SignalBundle, max_size_usd: Decimal) -> Decision {
    let (bullish, bearish) = tally(bundle);

    let directional = |action: Action, label: &str| Decision {
        action,
        size_usd: FALLBACK_SIZE_USD.min(max_size_usd),
        entry_price: bundle.current_price,
        leverage: FALLBACK_LEVERAGE,
        confidence: FALLBACK_CONFIDENCE,
        rationale: format!("Fallback: {} signals ({}/{})", label, bullish, bearish),
        stop_price: None,
        target_price: None,
    };

    if bullish >= 3 && bearish <= 1 {
        directional(Action::Long, "Bullish")
    } else if bearish >= 3 && bullish <= 1 {
        directional(Action::Short, "Bearish")
    } else {
        Decision {
            leverage: FALLBACK_LEVERAGE,
            confidence: HOLD_CONFIDENCE,
            ..Decision::hold(
                bundle.current_price,
                format!("Fallback: Mixed signals ({}/{})", bullish, bearish),
            )
        }
    }
}
