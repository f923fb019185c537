//! Market data and multi-timeframe signal types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Candle interval understood by the exchange kline endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Interval length in minutes.
    pub fn minutes(&self) -> u32 {
        match self {
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("Unknown timeframe: {}", s))
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Bullish => "BULLISH",
            Trend::Bearish => "BEARISH",
            Trend::Neutral => "NEUTRAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Crossover {
    Golden,
    Death,
    None,
}

impl Crossover {
    pub fn as_str(&self) -> &'static str {
        match self {
            Crossover::Golden => "GOLDEN",
            Crossover::Death => "DEATH",
            Crossover::None => "NONE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrendAlignment {
    Strong,
    Weak,
}

impl fmt::Display for TrendAlignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendAlignment::Strong => f.write_str("STRONG"),
            TrendAlignment::Weak => f.write_str("WEAK"),
        }
    }
}

/// Indicators derived from a single timeframe's candles.
///
/// Fields are `None` when the series was too short to compute them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeSignal {
    pub trend: Option<Trend>,
    pub rsi: Option<f64>,
    pub crossover: Crossover,
    pub volume_spike: bool,
    pub support: Option<f64>,
    pub resistance: Option<f64>,
    /// Percent change of the close over the last few bars
    pub price_change_pct: Option<f64>,
}

impl Default for TimeframeSignal {
    fn default() -> Self {
        Self {
            trend: None,
            rsi: None,
            crossover: Crossover::None,
            volume_spike: false,
            support: None,
            resistance: None,
            price_change_pct: None,
        }
    }
}

/// Everything the oracle sees about one instrument at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBundle {
    pub instrument: String,
    pub current_price: Decimal,
    pub timeframes: BTreeMap<Timeframe, TimeframeSignal>,
    pub alignment: TrendAlignment,
}

impl SignalBundle {
    pub fn get(&self, timeframe: Timeframe) -> Option<&TimeframeSignal> {
        self.timeframes.get(&timeframe)
    }

    pub fn trend(&self, timeframe: Timeframe) -> Option<Trend> {
        self.get(timeframe).and_then(|s| s.trend)
    }
}
