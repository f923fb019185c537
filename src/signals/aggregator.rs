//! Turns raw candles into a compact multi-timeframe signal bundle.
//!
//! Everything here is a pure function of its inputs.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::models::{Candle, Crossover, SignalBundle, Timeframe, TimeframeSignal, Trend, TrendAlignment};

const FAST_EMA: usize = 9;
const SLOW_EMA: usize = 21;
const RSI_PERIOD: usize = 14;
const VOLUME_LOOKBACK: usize = 20;
const VOLUME_SPIKE_RATIO: f64 = 1.5;
const LEVELS_LOOKBACK: usize = 20;
const CHANGE_BARS: usize = 4;
/// Relative EMA gap below which the trend is called neutral
const NEUTRAL_BAND: f64 = 0.0005;

/// Exponential moving average seeded with the SMA of the first `period` values.
///
/// Output index `i` corresponds to input index `i + period - 1`.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);
    for value in &values[period..] {
        let prev = out[out.len() - 1];
        out.push(prev + alpha * (value - prev));
    }
    out
}

/// Wilder RSI over `period`, rounded to two decimals.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let (mut avg_gain, mut avg_loss) = changes[..period].iter().fold((0.0, 0.0), |(g, l), c| {
        if *c > 0.0 {
            (g + c, l)
        } else {
            (g, l - c)
        }
    });
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    let p = period as f64;
    for change in &changes[period..] {
        let (gain, loss) = if *change > 0.0 { (*change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
    }

    let value = if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };
    Some((value * 100.0).round() / 100.0)
}

fn trend(fast: f64, slow: f64) -> Trend {
    if slow == 0.0 || ((fast - slow) / slow).abs() < NEUTRAL_BAND {
        Trend::Neutral
    } else if fast > slow {
        Trend::Bullish
    } else {
        Trend::Bearish
    }
}

/// Indicators for one timeframe. Candles must be oldest first.
pub fn analyze(candles: &[Candle]) -> TimeframeSignal {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let mut signal = TimeframeSignal {
        rsi: rsi(&closes, RSI_PERIOD),
        ..Default::default()
    };

    let fast = ema(&closes, FAST_EMA);
    let slow = ema(&closes, SLOW_EMA);
    if let (Some(f), Some(s)) = (fast.last(), slow.last()) {
        signal.trend = Some(trend(*f, *s));
    }
    if slow.len() >= 2 {
        // Align the fast series to the slow one's last two points
        let f_now = fast[fast.len() - 1];
        let f_prev = fast[fast.len() - 2];
        let s_now = slow[slow.len() - 1];
        let s_prev = slow[slow.len() - 2];
        signal.crossover = if f_prev <= s_prev && f_now > s_now {
            Crossover::Golden
        } else if f_prev >= s_prev && f_now < s_now {
            Crossover::Death
        } else {
            Crossover::None
        };
    }

    if candles.len() > VOLUME_LOOKBACK {
        let last = candles[candles.len() - 1].volume;
        let prior = &candles[candles.len() - 1 - VOLUME_LOOKBACK..candles.len() - 1];
        let mean = prior.iter().map(|c| c.volume).sum::<f64>() / VOLUME_LOOKBACK as f64;
        signal.volume_spike = mean > 0.0 && last > mean * VOLUME_SPIKE_RATIO;
    }

    let window = &candles[candles.len().saturating_sub(LEVELS_LOOKBACK)..];
    signal.support = window.iter().map(|c| c.low).reduce(f64::min);
    signal.resistance = window.iter().map(|c| c.high).reduce(f64::max);

    if closes.len() > CHANGE_BARS {
        let then = closes[closes.len() - 1 - CHANGE_BARS];
        if then != 0.0 {
            signal.price_change_pct = Some((closes[closes.len() - 1] - then) / then * 100.0);
        }
    }

    signal
}

/// STRONG when the two longest configured timeframes report the same trend.
pub fn trend_alignment(
    signals: &BTreeMap<Timeframe, TimeframeSignal>,
    configured: &[Timeframe],
) -> TrendAlignment {
    let mut ordered: Vec<Timeframe> = configured.to_vec();
    ordered.sort_by_key(|tf| std::cmp::Reverse(tf.minutes()));
    ordered.dedup();

    let trend_of = |tf: Option<&Timeframe>| tf.and_then(|tf| signals.get(tf)).and_then(|s| s.trend);
    match (trend_of(ordered.first()), trend_of(ordered.get(1))) {
        (Some(a), Some(b)) if a == b => TrendAlignment::Strong,
        _ => TrendAlignment::Weak,
    }
}

/// Assemble the bundle for one instrument.
pub fn build_bundle(
    instrument: &str,
    current_price: Decimal,
    series: Vec<(Timeframe, Vec<Candle>)>,
) -> SignalBundle {
    let configured: Vec<Timeframe> = series.iter().map(|(tf, _)| *tf).collect();
    let timeframes: BTreeMap<Timeframe, TimeframeSignal> = series
        .into_iter()
        .map(|(tf, candles)| (tf, analyze(&candles)))
        .collect();
    let alignment = trend_alignment(&timeframes, &configured);

    SignalBundle {
        instrument: instrument.to_string(),
        current_price,
        timeframes,
        alignment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Candle {
                open_time: i as i64 * 60_000,
                open: *c,
                high: c + 1.0,
                low: c - 1.0,
                close: *c,
                volume: 10.0,
            })
            .collect()
    }

    #[test]
    fn test_ema_seed_and_length() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let out = ema(&values, 3);
        assert_eq!(out.len(), 3);
        assert!((out[0] - 2.0).abs() < 1e-12);
        assert!((out[1] - 3.0).abs() < 1e-12);
        assert!(ema(&values, 6).is_empty());
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (1..=30).map(f64::from).collect();
        assert_eq!(rsi(&rising, 14), Some(100.0));

        let falling: Vec<f64> = (1..=30).rev().map(f64::from).collect();
        assert_eq!(rsi(&falling, 14), Some(0.0));

        assert_eq!(rsi(&rising[..14], 14), None);
    }

    #[test]
    fn test_rising_series_is_bullish() {
        let closes: Vec<f64> = (1..=40).map(f64::from).collect();
        let signal = analyze(&candles(&closes));

        assert_eq!(signal.trend, Some(Trend::Bullish));
        assert_eq!(signal.rsi, Some(100.0));
        assert_eq!(signal.support, Some(20.0));
        assert_eq!(signal.resistance, Some(41.0));
        assert!((signal.price_change_pct.unwrap() - 11.111111111111111).abs() < 1e-9);
    }

    #[test]
    fn test_golden_and_death_cross_on_last_bar() {
        let mut closes = vec![100.0; 30];
        closes.push(110.0);
        assert_eq!(analyze(&candles(&closes)).crossover, Crossover::Golden);

        let mut closes = vec![100.0; 30];
        closes.push(90.0);
        let signal = analyze(&candles(&closes));
        assert_eq!(signal.crossover, Crossover::Death);
        assert_eq!(signal.trend, Some(Trend::Bearish));
    }

    #[test]
    fn test_flat_series_is_neutral_without_cross() {
        let signal = analyze(&candles(&[50.0; 30]));
        assert_eq!(signal.trend, Some(Trend::Neutral));
        assert_eq!(signal.crossover, Crossover::None);
    }

    #[test]
    fn test_volume_spike() {
        let mut series = candles(&[100.0; 25]);
        assert!(!analyze(&series).volume_spike);

        series.last_mut().unwrap().volume = 16.0;
        assert!(analyze(&series).volume_spike);
    }

    #[test]
    fn test_short_series_has_no_trend() {
        let signal = analyze(&candles(&[1.0, 2.0, 3.0]));
        assert_eq!(signal.trend, None);
        assert_eq!(signal.rsi, None);
        assert_eq!(signal.crossover, Crossover::None);
        assert_eq!(signal.support, Some(0.0));
    }

    #[test]
    fn test_alignment_uses_two_longest_timeframes() {
        let up: Vec<f64> = (1..=40).map(f64::from).collect();
        let down: Vec<f64> = (1..=40).rev().map(f64::from).collect();

        let bundle = build_bundle(
            "SOLUSDT",
            dec!(40),
            vec![
                (Timeframe::M15, candles(&down)),
                (Timeframe::H1, candles(&up)),
                (Timeframe::H4, candles(&up)),
            ],
        );
        assert_eq!(bundle.alignment, TrendAlignment::Strong);

        let bundle = build_bundle(
            "SOLUSDT",
            dec!(40),
            vec![
                (Timeframe::H4, candles(&down)),
                (Timeframe::M15, candles(&up)),
                (Timeframe::H1, candles(&up)),
            ],
        );
        assert_eq!(bundle.alignment, TrendAlignment::Weak);
    }

    #[test]
    fn test_alignment_weak_when_trend_missing() {
        let up: Vec<f64> = (1..=40).map(f64::from).collect();
        let bundle = build_bundle(
            "SOLUSDT",
            dec!(40),
            vec![(Timeframe::H1, candles(&up)), (Timeframe::H4, candles(&[1.0, 2.0]))],
        );
        assert_eq!(bundle.alignment, TrendAlignment::Weak);
    }
}
