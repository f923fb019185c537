//! Test doubles shared across module tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use crate::db::HistoryStore;
use crate::exchange::{Exchange, ExchangeError, LivePosition, OrderAck, OrderSide, PaperExchange};
use crate::models::{
    Action, CloseDecision, CloseReason, ClosedTrade, Decision, Direction, Position, PositionStatus,
    SignalBundle, Timeframe, TimeframeSignal, Trend, TrendAlignment,
};
use crate::signals::SignalSource;
use crate::trading::{DecisionOracle, EntryContext};

/// Active position with `quantity = size * leverage / entry`.
pub fn position(symbol: &str, direction: Direction, size: Decimal, entry: Decimal, leverage: u32) -> Position {
    Position {
        instrument: symbol.to_string(),
        direction,
        entry_price: entry,
        quantity: size * Decimal::from(leverage) / entry,
        notional_usd: size,
        leverage,
        has_stop_target: false,
        stop_price: None,
        target_price: None,
        opened_at: Utc::now(),
        status: PositionStatus::Active,
        confidence: 70,
        rationale: "test".to_string(),
    }
}

/// Directional decision at `entry`.
pub fn decision(action: Action, size: Decimal, entry: Decimal, leverage: u32) -> Decision {
    Decision {
        action,
        size_usd: size,
        entry_price: entry,
        leverage,
        confidence: 70,
        rationale: format!("scripted {}", action),
        stop_price: None,
        target_price: None,
    }
}

/// Bundle with neutral trends on 15m/1h/4h.
pub fn bundle(symbol: &str, price: Decimal) -> SignalBundle {
    let timeframes: BTreeMap<Timeframe, TimeframeSignal> = [Timeframe::M15, Timeframe::H1, Timeframe::H4]
        .into_iter()
        .map(|tf| {
            (
                tf,
                TimeframeSignal {
                    trend: Some(Trend::Neutral),
                    rsi: Some(50.0),
                    ..Default::default()
                },
            )
        })
        .collect();
    SignalBundle {
        instrument: symbol.to_string(),
        current_price: price,
        timeframes,
        alignment: TrendAlignment::Strong,
    }
}

// ==================== Oracle ====================

/// Oracle replaying queued decisions; HOLD / keep when the queue is empty.
#[derive(Default)]
pub struct ScriptedOracle {
    entries: Mutex<VecDeque<Decision>>,
    closes: Mutex<VecDeque<CloseDecision>>,
    entry_calls: AtomicUsize,
    close_calls: AtomicUsize,
    /// Whether each entry call saw a current position
    saw_position: Mutex<Vec<bool>>,
    /// Bundle price each entry call was asked about
    seen_prices: Mutex<Vec<Decimal>>,
}

impl ScriptedOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_entry(&self, decision: Decision) {
        self.entries.lock().unwrap().push_back(decision);
    }

    pub fn push_close(&self, decision: CloseDecision) {
        self.closes.lock().unwrap().push_back(decision);
    }

    pub fn entry_calls(&self) -> usize {
        self.entry_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn saw_position(&self) -> Vec<bool> {
        self.saw_position.lock().unwrap().clone()
    }

    pub fn seen_prices(&self) -> Vec<Decimal> {
        self.seen_prices.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn entry_decision(&self, ctx: EntryContext<'_>) -> Decision {
        self.entry_calls.fetch_add(1, Ordering::SeqCst);
        self.saw_position.lock().unwrap().push(ctx.current_position.is_some());
        self.seen_prices.lock().unwrap().push(ctx.bundle.current_price);
        self.entries
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Decision::hold(ctx.bundle.current_price, "scripted hold"))
    }

    async fn close_decision(
        &self,
        _position: &Position,
        _price: Decimal,
        _bundle: Option<&SignalBundle>,
    ) -> CloseDecision {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| CloseDecision::keep(CloseReason::MarketCondition, "scripted keep"))
    }
}

// ==================== Signals ====================

/// Fixed bundles per instrument; unknown instruments fail.
#[derive(Default)]
pub struct StaticSignals {
    bundles: Mutex<HashMap<String, SignalBundle>>,
}

impl StaticSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, bundle: SignalBundle) {
        self.bundles.lock().unwrap().insert(bundle.instrument.clone(), bundle);
    }
}

#[async_trait]
impl SignalSource for StaticSignals {
    async fn signal_bundle(&self, instrument: &str) -> Result<SignalBundle> {
        self.bundles
            .lock()
            .unwrap()
            .get(instrument)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no signals for {}", instrument))
    }
}

// ==================== History ====================

#[derive(Default)]
pub struct MemoryHistory {
    trades: Mutex<Vec<ClosedTrade>>,
    fail_appends: AtomicBool,
}

impl MemoryHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trades(&self) -> Vec<ClosedTrade> {
        self.trades.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_appends.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, trade: &ClosedTrade) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.trades.lock().unwrap().push(trade.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ClosedTrade>> {
        Ok(self.trades.lock().unwrap().iter().rev().take(limit).cloned().collect())
    }
}

// ==================== Exchange ====================

/// Paper exchange with switchable failures.
#[derive(Default)]
pub struct FailingExchange {
    pub inner: PaperExchange,
    fail_opening_orders: AtomicBool,
    fail_reads: AtomicBool,
    orders: AtomicUsize,
}

impl FailingExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject every non reduce-only order.
    pub fn fail_opening_orders(&self, fail: bool) {
        self.fail_opening_orders.store(fail, Ordering::SeqCst);
    }

    /// Time out position and price reads.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn order_count(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Exchange for FailingExchange {
    fn name(&self) -> &str {
        "failing-paper"
    }

    fn is_live(&self) -> bool {
        false
    }

    fn quantity_precision(&self, symbol: &str) -> u32 {
        self.inner.quantity_precision(symbol)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        if !reduce_only && self.fail_opening_orders.load(Ordering::SeqCst) {
            return Err(ExchangeError::Rejected("Margin is insufficient.".to_string()));
        }
        self.orders.fetch_add(1, Ordering::SeqCst);
        self.inner.place_market_order(symbol, side, quantity, reduce_only).await
    }

    async fn place_protective_orders(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: Decimal,
        stop_price: Decimal,
        target_price: Decimal,
    ) -> Result<(), ExchangeError> {
        self.inner
            .place_protective_orders(symbol, direction, quantity, stop_price, target_price)
            .await
    }

    async fn cancel_reduce_only_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        self.inner.cancel_reduce_only_orders(symbol).await
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ExchangeError::Timeout(std::time::Duration::from_secs(10)));
        }
        self.inner.last_price(symbol).await
    }

    async fn live_position(&self, symbol: &str) -> Result<Option<LivePosition>, ExchangeError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ExchangeError::Timeout(std::time::Duration::from_secs(10)));
        }
        self.inner.live_position(symbol).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.inner.set_leverage(symbol, leverage).await
    }
}
