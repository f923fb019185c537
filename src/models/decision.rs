//! Normalized oracle outputs.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::Direction;

/// What the oracle wants done with an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Long,
    Short,
    Hold,
    ReverseLong,
    ReverseShort,
}

impl Action {
    pub fn is_reverse(&self) -> bool {
        matches!(self, Action::ReverseLong | Action::ReverseShort)
    }

    /// Target direction, if the action opens anything.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Action::Long | Action::ReverseLong => Some(Direction::Long),
            Action::Short | Action::ReverseShort => Some(Direction::Short),
            Action::Hold => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Long => "LONG",
            Action::Short => "SHORT",
            Action::Hold => "HOLD",
            Action::ReverseLong => "REVERSE_LONG",
            Action::ReverseShort => "REVERSE_SHORT",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "LONG" | "BUY" => Ok(Action::Long),
            "SHORT" | "SELL" => Ok(Action::Short),
            "HOLD" | "WAIT" | "NONE" => Ok(Action::Hold),
            "REVERSE_LONG" => Ok(Action::ReverseLong),
            "REVERSE_SHORT" => Ok(Action::ReverseShort),
            other => anyhow::bail!("Unknown action: {}", other),
        }
    }
}

/// Entry decision after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub size_usd: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub confidence: u8,
    pub rationale: String,
    /// Only honoured in stop-target execution mode
    pub stop_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
}

impl Decision {
    pub fn hold(entry_price: Decimal, rationale: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            size_usd: Decimal::ZERO,
            entry_price,
            leverage: 0,
            confidence: 0,
            rationale: rationale.into(),
            stop_price: None,
            target_price: None,
        }
    }

    pub fn is_reverse(&self) -> bool {
        self.action.is_reverse()
    }

    pub fn is_directional(&self) -> bool {
        self.action.direction().is_some()
    }
}

/// Why a position was (or was not) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    TrendReversal,
    TimeExit,
    MarketCondition,
    Error,
    AiUnavailable,
    /// Closed as the first leg of a reversal
    ReversePosition,
    /// Position vanished at the exchange (liquidation, manual close, triggered order)
    ExternalClose,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "TAKE_PROFIT",
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::TrendReversal => "TREND_REVERSAL",
            CloseReason::TimeExit => "TIME_EXIT",
            CloseReason::MarketCondition => "MARKET_CONDITION",
            CloseReason::Error => "ERROR",
            CloseReason::AiUnavailable => "AI_UNAVAILABLE",
            CloseReason::ReversePosition => "REVERSE_POSITION",
            CloseReason::ExternalClose => "EXTERNAL_CLOSE",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace([' ', '-'], "_");
        let reason = match normalized.as_str() {
            "TAKE_PROFIT" => CloseReason::TakeProfit,
            "STOP_LOSS" => CloseReason::StopLoss,
            "TREND_REVERSAL" => CloseReason::TrendReversal,
            "TIME_EXIT" => CloseReason::TimeExit,
            "MARKET_CONDITION" => CloseReason::MarketCondition,
            "ERROR" => CloseReason::Error,
            "AI_UNAVAILABLE" => CloseReason::AiUnavailable,
            "REVERSE_POSITION" => CloseReason::ReversePosition,
            "EXTERNAL_CLOSE" => CloseReason::ExternalClose,
            other => anyhow::bail!("Unknown close reason: {}", other),
        };
        Ok(reason)
    }
}

/// Close-variant oracle output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseDecision {
    pub should_close: bool,
    pub close_reason: CloseReason,
    pub confidence: u8,
    pub rationale: String,
}

impl CloseDecision {
    /// Fail-closed answer: never forces an exit.
    pub fn keep(reason: CloseReason, rationale: impl Into<String>) -> Self {
        Self {
            should_close: false,
            close_reason: reason,
            confidence: 0,
            rationale: rationale.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse() {
        assert_eq!("reverse_short".parse::<Action>().unwrap(), Action::ReverseShort);
        assert_eq!(" Long ".parse::<Action>().unwrap(), Action::Long);
        assert_eq!("REVERSE-LONG".parse::<Action>().unwrap(), Action::ReverseLong);
        assert!("MOON".parse::<Action>().is_err());
    }

    #[test]
    fn test_action_direction() {
        assert_eq!(Action::ReverseShort.direction(), Some(Direction::Short));
        assert_eq!(Action::Hold.direction(), None);
        assert!(Action::ReverseLong.is_reverse());
        assert!(!Action::Long.is_reverse());
    }

    #[test]
    fn test_close_reason_roundtrip_names() {
        for reason in [CloseReason::TakeProfit, CloseReason::ReversePosition, CloseReason::AiUnavailable] {
            assert_eq!(reason.as_str().parse::<CloseReason>().unwrap(), reason);
        }
    }
}
