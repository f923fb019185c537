//! Prompt construction for the entry and close oracle requests.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};

use crate::api::ChatMessage;
use crate::models::{Position, SignalBundle, Timeframe};

use super::config::ExecutionMode;

const ENTRY_SYSTEM_PROMPT: &str = "You are a disciplined crypto futures trader. \
Positions are closed manually by a separate review; there are no standing take-profit or stop-loss orders. \
Respond with a single JSON object and nothing else.";

const STOP_TARGET_SYSTEM_PROMPT: &str = "You are a disciplined crypto futures trader. \
Every entry is protected by reduce-only stop-loss and take-profit orders that you must specify. \
Respond with a single JSON object and nothing else.";

const CLOSE_SYSTEM_PROMPT: &str = "You review open crypto futures positions and decide whether to close them now. \
Only close on a clear reason. Respond with a single JSON object and nothing else.";

/// Inputs to an entry prompt.
pub struct EntryPrompt<'a> {
    pub bundle: &'a SignalBundle,
    pub available_budget: Decimal,
    pub max_position_size: Decimal,
    pub leverage_range: (u32, u32),
    pub mode: ExecutionMode,
    /// Present only when reversal is allowed and a position is open
    pub reverse_candidate: Option<&'a Position>,
    pub learning_context: Option<&'a str>,
}

fn timeframe_signals(bundle: &SignalBundle) -> Value {
    let mut map = Map::new();
    for (tf, signal) in &bundle.timeframes {
        map.insert(
            tf.as_str().to_string(),
            json!({
                "trend": signal.trend.map(|t| t.as_str()),
                "rsi": signal.rsi,
                "crossover": signal.crossover.as_str(),
                "volume_spike": signal.volume_spike,
                "support": signal.support,
                "resistance": signal.resistance,
                "price_change_pct": signal.price_change_pct.map(|p| (p * 100.0).round() / 100.0),
            }),
        );
    }
    Value::Object(map)
}

impl EntryPrompt<'_> {
    fn context(&self) -> Value {
        let (min_lev, max_lev) = self.leverage_range;
        let allowed = if self.reverse_candidate.is_some() {
            "LONG | SHORT | HOLD | REVERSE_LONG | REVERSE_SHORT"
        } else {
            "LONG | SHORT | HOLD"
        };

        let mut rules = vec![
            format!("position_size_usd must not exceed {}", self.max_position_size),
            format!("leverage must be between {} and {}", min_lev, max_lev),
            "prefer HOLD unless higher timeframes agree".to_string(),
        ];
        let mut schema = json!({
            "decision": allowed,
            "position_size_usd": "number",
            "entry_price": "number",
            "leverage": "integer",
            "confidence": "integer 0-100",
            "reasoning": "string",
        });
        match self.mode {
            ExecutionMode::ManualClose => {
                rules.push("no stop-loss or take-profit orders are placed".to_string());
            }
            ExecutionMode::StopTarget => {
                rules.push("stop_loss and take_profit prices are required".to_string());
                schema["stop_loss"] = json!("number");
                schema["take_profit"] = json!("number");
            }
        }

        let mut context = json!({
            "budget": {
                "available_usd": self.available_budget,
                "max_position_size_usd": self.max_position_size,
            },
            "instrument": self.bundle.instrument,
            "current_price": self.bundle.current_price,
            "signals": timeframe_signals(self.bundle),
            "trend_alignment": self.bundle.alignment.to_string(),
            "rules": rules,
            "response_format": schema,
        });

        if let Some(position) = self.reverse_candidate {
            let pnl_pct = position.pnl_percent_at(self.bundle.current_price).round_dp(2);
            context["current_position"] = json!({
                "direction": position.direction.as_str(),
                "entry_price": position.entry_price,
                "leverage": position.leverage,
                "pnl_percent": pnl_pct,
                "note": "choose REVERSE_LONG/REVERSE_SHORT only to flip this position, HOLD to keep it",
            });
        }
        if let Some(learning) = self.learning_context {
            context["learning"] = json!(learning);
        }
        context
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        let system = match self.mode {
            ExecutionMode::ManualClose => ENTRY_SYSTEM_PROMPT,
            ExecutionMode::StopTarget => STOP_TARGET_SYSTEM_PROMPT,
        };
        vec![
            ChatMessage::system(system),
            ChatMessage::user(format!(
                "Evaluate a trade for {}.\n{}",
                self.bundle.instrument,
                self.context()
            )),
        ]
    }
}

/// Close-review messages for `position` at `price`.
pub fn close_messages(position: &Position, price: Decimal, bundle: Option<&SignalBundle>) -> Vec<ChatMessage> {
    let h1 = bundle.and_then(|b| b.get(Timeframe::H1));
    let context = json!({
        "position": {
            "instrument": position.instrument,
            "direction": position.direction.as_str(),
            "entry_price": position.entry_price,
            "current_price": price,
            "pnl_percent": position.pnl_percent_at(price).round_dp(2),
            "size_usd": position.notional_usd,
            "leverage": position.leverage,
            "age_minutes": position.age_minutes(Utc::now()),
        },
        "market": {
            "change_1h_pct": h1.and_then(|s| s.price_change_pct).map(|p| (p * 100.0).round() / 100.0),
            "support": h1.and_then(|s| s.support),
            "resistance": h1.and_then(|s| s.resistance),
            "trend_1h": h1.and_then(|s| s.trend).map(|t| t.as_str()),
            "trend_alignment": bundle.map(|b| b.alignment.to_string()),
        },
        "response_format": {
            "should_close": "boolean",
            "close_reason": "TAKE_PROFIT | STOP_LOSS | TREND_REVERSAL | TIME_EXIT | MARKET_CONDITION",
            "confidence": "integer 0-100",
            "reasoning": "string",
        },
    });

    vec![
        ChatMessage::system(CLOSE_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Should this position be closed now?\n{}",
            context
        )),
    ]
}
