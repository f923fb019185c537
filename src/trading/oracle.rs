//! Decision oracle: remote model with retries, normalization, and local fallback.
//!
//! Entry decisions never fail: exhausted retries or an unparseable answer
//! yield the deterministic fallback. Close decisions fail closed and never
//! force an exit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::config::{ExecutionMode, OracleConfig, TradingConfig};
use super::fallback;
use super::position_sizer::PositionSizer;
use super::prompt::{close_messages, EntryPrompt};
use crate::api::{ChatBackend, ChatMessage, OracleError};
use crate::models::{Action, CloseDecision, CloseReason, Decision, Position, SignalBundle};

/// What the oracle sees when asked for an entry decision.
#[derive(Debug, Clone, Copy)]
pub struct EntryContext<'a> {
    pub bundle: &'a SignalBundle,
    /// Open position on the instrument, offered as a reverse candidate
    pub current_position: Option<&'a Position>,
    pub available_budget: Decimal,
    pub learning_context: Option<&'a str>,
}

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn entry_decision(&self, ctx: EntryContext<'_>) -> Decision;

    async fn close_decision(
        &self,
        position: &Position,
        price: Decimal,
        bundle: Option<&SignalBundle>,
    ) -> CloseDecision;
}

/// Fixed number of retries with a fixed delay.
#[derive(Debug, Clone)]
struct FixedRetry {
    delay: Duration,
    retries: u32,
    remaining: u32,
}

impl FixedRetry {
    fn new(max_attempts: u32, delay: Duration) -> Self {
        let retries = max_attempts.saturating_sub(1);
        Self {
            delay,
            retries,
            remaining: retries,
        }
    }
}

impl Backoff for FixedRetry {
    fn reset(&mut self) {
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.delay)
    }
}

/// Oracle backed by a chat model.
pub struct AiOracle {
    backend: Option<Arc<dyn ChatBackend>>,
    config: OracleConfig,
    sizer: PositionSizer,
    mode: ExecutionMode,
    allow_reverse: bool,
}

impl AiOracle {
    /// `backend = None` means no API key: fallback entries, fail-closed exits.
    pub fn new(
        backend: Option<Arc<dyn ChatBackend>>,
        config: OracleConfig,
        trading: &TradingConfig,
    ) -> Self {
        Self {
            backend,
            config,
            sizer: PositionSizer::new(trading),
            mode: trading.execution_mode,
            allow_reverse: trading.allow_reverse_positions,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.backend.is_some()
    }

    async fn query(
        &self,
        backend: &Arc<dyn ChatBackend>,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, OracleError> {
        let policy = FixedRetry::new(self.config.max_attempts, self.config.retry_delay());

        backoff::future::retry_notify(
            policy,
            || {
                let backend = backend.clone();
                let messages = messages.clone();
                async move {
                    backend
                        .complete(messages, max_tokens, timeout)
                        .await
                        .map_err(|e| {
                            if e.is_transient() {
                                backoff::Error::transient(e)
                            } else {
                                backoff::Error::permanent(e)
                            }
                        })
                }
            },
            |e: OracleError, delay: Duration| {
                warn!(error = %e, retry_in = ?delay, "Oracle call failed, retrying");
            },
        )
        .await
    }

    fn normalize_entry(
        &self,
        map: &Map<String, Value>,
        bundle: &SignalBundle,
        has_position: bool,
    ) -> Decision {
        let raw_action = read_str(map, &["decision", "action"]).unwrap_or("HOLD");
        let mut action = raw_action.parse::<Action>().unwrap_or_else(|_| {
            warn!(instrument = %bundle.instrument, action = %raw_action, "Unknown action, treating as HOLD");
            Action::Hold
        });
        // Nothing to reverse on a flat instrument
        if action.is_reverse() && !has_position {
            action = match action {
                Action::ReverseLong => Action::Long,
                _ => Action::Short,
            };
        }

        let entry_price = read_decimal(map, &["entry_price", "price"])
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(bundle.current_price);
        let size_usd = read_decimal(map, &["position_size_usd", "size_usd", "position_size"])
            .unwrap_or(Decimal::ZERO)
            .max(Decimal::ZERO);
        let leverage = self.sizer.clamp_leverage(
            read_i64(map, &["leverage"]).unwrap_or(i64::from(self.sizer.leverage_range().0)),
        );
        let confidence = read_i64(map, &["confidence"]).unwrap_or(0).clamp(0, 100) as u8;
        let rationale = read_str(map, &["reasoning", "rationale", "reason"])
            .unwrap_or_default()
            .to_string();

        let (stop_price, target_price) = match self.mode {
            ExecutionMode::StopTarget => (
                read_decimal(map, &["stop_loss", "stop_price"]).filter(|p| *p > Decimal::ZERO),
                read_decimal(map, &["take_profit", "target_price"]).filter(|p| *p > Decimal::ZERO),
            ),
            ExecutionMode::ManualClose => (None, None),
        };

        Decision {
            action,
            size_usd,
            entry_price,
            leverage,
            confidence,
            rationale,
            stop_price,
            target_price,
        }
    }
}

#[async_trait]
impl DecisionOracle for AiOracle {
    async fn entry_decision(&self, ctx: EntryContext<'_>) -> Decision {
        let bundle = ctx.bundle;
        let fallback = || fallback::decide(bundle, self.sizer.max_position_size());

        let Some(backend) = &self.backend else {
            let decision = fallback();
            debug!(instrument = %bundle.instrument, action = %decision.action, "No oracle configured, using fallback");
            return decision;
        };

        let reverse_candidate = ctx.current_position.filter(|_| self.allow_reverse);
        let prompt = EntryPrompt {
            bundle,
            available_budget: ctx.available_budget,
            max_position_size: self.sizer.max_position_size(),
            leverage_range: self.sizer.leverage_range(),
            mode: self.mode,
            reverse_candidate,
            learning_context: ctx.learning_context,
        };

        let text = match self
            .query(backend, prompt.messages(), self.config.entry_max_tokens, self.config.entry_timeout())
            .await
        {
            Ok(text) => text,
            Err(e) => {
                let decision = fallback();
                warn!(
                    instrument = %bundle.instrument,
                    error = %e,
                    action = %decision.action,
                    "Oracle unavailable, using fallback decision"
                );
                return decision;
            }
        };

        let Some(map) = extract_json_object(&text) else {
            let decision = fallback();
            warn!(
                instrument = %bundle.instrument,
                action = %decision.action,
                "Oracle answer had no JSON object, using fallback decision"
            );
            return decision;
        };

        let decision = self.normalize_entry(&map, bundle, reverse_candidate.is_some());
        info!(
            instrument = %bundle.instrument,
            action = %decision.action,
            size = %decision.size_usd,
            leverage = decision.leverage,
            confidence = decision.confidence,
            "Oracle entry decision"
        );
        decision
    }

    async fn close_decision(
        &self,
        position: &Position,
        price: Decimal,
        bundle: Option<&SignalBundle>,
    ) -> CloseDecision {
        let Some(backend) = &self.backend else {
            return CloseDecision::keep(CloseReason::AiUnavailable, "Oracle not configured");
        };

        let messages = close_messages(position, price, bundle);
        let text = match self
            .query(backend, messages, self.config.close_max_tokens, self.config.close_timeout())
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(instrument = %position.instrument, error = %e, "Close oracle unavailable, keeping position");
                return CloseDecision::keep(CloseReason::AiUnavailable, e.to_string());
            }
        };

        let Some(map) = extract_json_object(&text) else {
            warn!(instrument = %position.instrument, "Close answer had no JSON object, keeping position");
            return CloseDecision::keep(CloseReason::Error, "Unparseable close response");
        };

        let decision = parse_close(&map);
        debug!(
            instrument = %position.instrument,
            should_close = decision.should_close,
            reason = %decision.close_reason,
            "Oracle close decision"
        );
        decision
    }
}

// ==================== Response parsing ====================

/// First well-formed JSON object in `text`; surrounding prose is ignored.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    for (start, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(map))) = stream.next() {
            return Some(map);
        }
    }
    None
}

fn first<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| map.get(*k)).filter(|v| !v.is_null())
}

fn read_str<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    first(map, keys)?.as_str()
}

fn read_decimal(map: &Map<String, Value>, keys: &[&str]) -> Option<Decimal> {
    match first(map, keys)? {
        Value::Number(n) => n
            .to_string()
            .parse()
            .ok()
            .or_else(|| n.as_f64().and_then(Decimal::from_f64)),
        Value::String(s) => s.trim().trim_start_matches('$').replace(',', "").parse().ok(),
        _ => None,
    }
}

fn read_i64(map: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    match first(map, keys)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s
            .trim()
            .trim_end_matches(['x', 'X', '%'])
            .parse::<f64>()
            .ok()
            .map(|f| f.round() as i64),
        _ => None,
    }
}

fn read_bool(map: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    match first(map, keys)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "close" => Some(true),
            "false" | "no" | "hold" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_close(map: &Map<String, Value>) -> CloseDecision {
    let should_close = read_bool(map, &["should_close", "close"]).unwrap_or(false);
    let close_reason = read_str(map, &["close_reason", "reason"])
        .and_then(|s| s.parse().ok())
        .unwrap_or(CloseReason::MarketCondition);

    CloseDecision {
        should_close,
        close_reason,
        confidence: read_i64(map, &["confidence"]).unwrap_or(0).clamp(0, 100) as u8,
        rationale: read_str(map, &["reasoning", "rationale"]).unwrap_or_default().to_string(),
    }
}
