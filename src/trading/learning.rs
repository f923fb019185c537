//! Optional learning capability fed by closed trades.
//!
//! The monitor calls a hook only when one is configured. [`TradeJournal`]
//! records a feature row per trade, surfaces recent mistakes to the oracle
//! prompt, and vetoes entries that repeat a losing pattern.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::db::{Database, TradeFeature};
use crate::models::{ClosedTrade, Decision, SignalBundle, Timeframe};

#[async_trait]
pub trait LearningHook: Send + Sync {
    /// Called after a trade is durably recorded. `signals` is the bundle seen at close time.
    async fn on_trade_closed(&self, trade: &ClosedTrade, signals: Option<&SignalBundle>) -> Result<()>;

    /// Extra text for the entry prompt, if any.
    async fn prompt_context(&self, instrument: &str) -> Option<String>;

    /// Reason to veto `decision`, or `None` to let it through.
    async fn should_block(&self, decision: &Decision, bundle: &SignalBundle) -> Option<String>;
}

/// Learning journal stored alongside trade history.
pub struct TradeJournal {
    db: Arc<Database>,
    /// Loss beyond this percent of committed capital marks a mistake
    mistake_loss_pct: Decimal,
    /// Same-signature trades inspected before blocking
    lookback: usize,
}

impl TradeJournal {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            mistake_loss_pct: dec!(5),
            lookback: 3,
        }
    }

    fn feature(&self, trade: &ClosedTrade, signals: Option<&SignalBundle>) -> TradeFeature {
        let return_pct = trade.return_pct();
        let loss_pct = if return_pct < Decimal::ZERO { -return_pct } else { Decimal::ZERO };
        let h1 = signals.and_then(|s| s.get(Timeframe::H1));

        TradeFeature {
            instrument: trade.instrument.clone(),
            direction: trade.direction.as_str().to_string(),
            entry_price: trade.entry_price.to_f64().unwrap_or(0.0),
            exit_price: trade.exit_price.to_f64().unwrap_or(0.0),
            realized_pnl: trade.realized_pnl.to_f64().unwrap_or(0.0),
            leverage: i64::from(trade.leverage),
            loss_pct: loss_pct.to_f64().unwrap_or(0.0),
            rsi_1h: h1.and_then(|s| s.rsi),
            trend_1h: h1.and_then(|s| s.trend).map(|t| t.as_str().to_string()),
            alignment: signals
                .map(|s| s.alignment.to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            is_mistake: loss_pct > self.mistake_loss_pct,
            closed_at: trade.closed_at.to_rfc3339(),
        }
    }
}

#[async_trait]
impl LearningHook for TradeJournal {
    async fn on_trade_closed(&self, trade: &ClosedTrade, signals: Option<&SignalBundle>) -> Result<()> {
        let feature = self.feature(trade, signals);
        if feature.is_mistake {
            info!(
                instrument = %trade.instrument,
                direction = %trade.direction,
                loss_pct = feature.loss_pct,
                "Trade journaled as mistake"
            );
        }
        self.db.insert_feature(&feature).await
    }

    async fn prompt_context(&self, instrument: &str) -> Option<String> {
        let rows = match self.db.recent_features(instrument, 10).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(instrument = %instrument, error = %e, "Journal unavailable");
                return None;
            }
        };

        let mistakes: Vec<String> = rows
            .iter()
            .filter(|r| r.is_mistake)
            .take(3)
            .map(|r| {
                format!(
                    "{} under {} alignment lost {:.1}% (1h trend {}, RSI {})",
                    r.direction,
                    r.alignment,
                    r.loss_pct,
                    r.trend_1h.as_deref().unwrap_or("n/a"),
                    r.rsi_1h.map(|v| format!("{:.0}", v)).unwrap_or_else(|| "n/a".to_string()),
                )
            })
            .collect();

        if mistakes.is_empty() {
            return None;
        }
        Some(format!("Recent mistakes on {}: {}", instrument, mistakes.join("; ")))
    }

    async fn should_block(&self, decision: &Decision, bundle: &SignalBundle) -> Option<String> {
        let direction = decision.action.direction()?;
        let alignment = bundle.alignment.to_string();

        let rows = self.db.recent_features(&bundle.instrument, 50).await.ok()?;
        let same: Vec<&TradeFeature> = rows
            .iter()
            .filter(|r| r.direction == direction.as_str() && r.alignment == alignment)
            .take(self.lookback)
            .collect();

        if same.len() == self.lookback && same.iter().all(|r| r.is_mistake) {
            return Some(format!(
                "Last {} {} trades under {} alignment were all mistakes",
                self.lookback, direction, alignment
            ));
        }
        None
    }
}
