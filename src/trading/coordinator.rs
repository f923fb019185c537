//! Execution coordinator: turns decisions into exchange effects and keeps
//! the ledger in step with them.
//!
//! Per instrument the state is FLAT or ACTIVE (derived from the ledger)
//! plus the transient OPENING, CLOSING and REVERSING states held while a
//! transition is in flight. A second transition on a busy instrument is
//! refused with [`ExecutionError::Busy`].
//!
//! Opening holds the ledger lock from reservation until the order has been
//! accepted or rolled back, so admission, reservation and the order form
//! one critical section across instruments.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::config::{ClosePolicy, ExecutionMode, TradingConfig};
use super::error::{AdmissionRejected, ExecutionError};
use super::learning::LearningHook;
use super::ledger::SharedLedger;
use super::oracle::{DecisionOracle, EntryContext};
use super::position_sizer::PositionSizer;
use crate::db::HistoryStore;
use crate::exchange::{Exchange, OrderSide};
use crate::signals::SignalSource;
use crate::models::{
    Action, CloseReason, ClosedTrade, Decision, Direction, Position, PositionStatus, SignalBundle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentState {
    Flat,
    Opening,
    Active,
    Closing,
    Reversing,
}

impl fmt::Display for InstrumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstrumentState::Flat => "FLAT",
            InstrumentState::Opening => "OPENING",
            InstrumentState::Active => "ACTIVE",
            InstrumentState::Closing => "CLOSING",
            InstrumentState::Reversing => "REVERSING",
        };
        f.write_str(s)
    }
}

/// What a coordinator call did.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Opened(Position),
    Closed(ClosedTrade),
    /// Old position closed; `opened` is the opposite position if one was admitted
    Reversed {
        closed: ClosedTrade,
        opened: Option<Position>,
    },
    /// Ledger refused the entry; nothing changed
    Rejected(AdmissionRejected),
    /// Nothing to do (HOLD, already flat, screened out)
    Skipped(String),
}

/// Clears the transient state of an instrument when dropped.
struct Transition<'a> {
    busy: &'a Mutex<HashMap<String, InstrumentState>>,
    instrument: String,
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.remove(&self.instrument);
        }
    }
}

fn entry_action(direction: Direction) -> Action {
    match direction {
        Direction::Long => Action::Long,
        Direction::Short => Action::Short,
    }
}

pub struct ExecutionCoordinator {
    exchange: Arc<dyn Exchange>,
    ledger: SharedLedger,
    history: Arc<dyn HistoryStore>,
    oracle: Arc<dyn DecisionOracle>,
    signals: Arc<dyn SignalSource>,
    learning: Option<Arc<dyn LearningHook>>,
    sizer: PositionSizer,
    mode: ExecutionMode,
    close_policy: Option<ClosePolicy>,
    min_entry_confidence: u8,
    busy: Mutex<HashMap<String, InstrumentState>>,
}

impl ExecutionCoordinator {
    pub fn new(
        config: &TradingConfig,
        exchange: Arc<dyn Exchange>,
        ledger: SharedLedger,
        history: Arc<dyn HistoryStore>,
        oracle: Arc<dyn DecisionOracle>,
        signals: Arc<dyn SignalSource>,
    ) -> Self {
        Self {
            exchange,
            ledger,
            history,
            oracle,
            signals,
            learning: None,
            sizer: PositionSizer::new(config),
            mode: config.execution_mode,
            close_policy: config.close_policy.clone(),
            min_entry_confidence: config.min_entry_confidence,
            busy: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_learning(mut self, hook: Option<Arc<dyn LearningHook>>) -> Self {
        self.learning = hook;
        self
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.exchange
    }

    pub async fn state(&self, instrument: &str) -> InstrumentState {
        let transient = self.busy.lock().ok().and_then(|b| b.get(instrument).copied());
        if let Some(state) = transient {
            return state;
        }
        if self.ledger.lock().await.position(instrument).is_some() {
            InstrumentState::Active
        } else {
            InstrumentState::Flat
        }
    }

    fn enter(&self, instrument: &str, state: InstrumentState) -> Result<Transition<'_>, ExecutionError> {
        let mut busy = self.busy.lock().map_err(|_| ExecutionError::Busy {
            instrument: instrument.to_string(),
            state: "poisoned".to_string(),
        })?;
        if let Some(current) = busy.get(instrument) {
            return Err(ExecutionError::Busy {
                instrument: instrument.to_string(),
                state: current.to_string(),
            });
        }
        busy.insert(instrument.to_string(), state);
        Ok(Transition {
            busy: &self.busy,
            instrument: instrument.to_string(),
        })
    }

    /// Confidence floor and learning veto. Returns the reason to skip, if any.
    pub async fn screen(&self, decision: &Decision, bundle: &SignalBundle) -> Option<String> {
        if !decision.is_directional() {
            return None;
        }
        if decision.confidence < self.min_entry_confidence {
            return Some(format!(
                "confidence {} below minimum {}",
                decision.confidence, self.min_entry_confidence
            ));
        }
        match &self.learning {
            Some(hook) => hook.should_block(decision, bundle).await,
            None => None,
        }
    }

    /// Dispatch an entry-variant decision for `instrument`.
    pub async fn execute(&self, instrument: &str, decision: &Decision) -> Result<ExecutionOutcome, ExecutionError> {
        if decision.is_reverse() {
            return self.reverse(instrument, decision).await;
        }
        if decision.is_directional() {
            return self.open(instrument, decision).await;
        }
        Ok(ExecutionOutcome::Skipped(format!("{} on {}", decision.action, instrument)))
    }

    // ==================== Open ====================

    /// FLAT -> OPENING -> ACTIVE, or back to FLAT with the reservation released.
    pub async fn open(&self, instrument: &str, decision: &Decision) -> Result<ExecutionOutcome, ExecutionError> {
        let _transition = self.enter(instrument, InstrumentState::Opening)?;
        self.open_inner(instrument, decision).await
    }

    async fn open_inner(&self, instrument: &str, decision: &Decision) -> Result<ExecutionOutcome, ExecutionError> {
        let Some(direction) = decision.action.direction() else {
            return Ok(ExecutionOutcome::Skipped("HOLD".to_string()));
        };

        let mut ledger = self.ledger.lock().await;
        if let Err(reason) = ledger.can_admit(instrument, decision.size_usd) {
            info!(instrument = %instrument, size = %decision.size_usd, reason = %reason, "Admission rejected");
            return Ok(ExecutionOutcome::Rejected(reason));
        }

        // Everything that can fail without touching the exchange happens before reserving
        let leverage = decision.leverage;
        let precision = self.exchange.quantity_precision(instrument);
        let quantity = self
            .sizer
            .quantity(decision.size_usd, leverage, decision.entry_price, precision)?;
        let levels = match self.mode {
            ExecutionMode::StopTarget => Some(self.sizer.protective_levels(
                direction,
                decision.entry_price,
                leverage,
                (decision.stop_price, decision.target_price),
                self.close_policy.as_ref(),
            )?),
            ExecutionMode::ManualClose => None,
        };

        if let Err(reason) = ledger.reserve(instrument, decision.size_usd) {
            info!(instrument = %instrument, size = %decision.size_usd, reason = %reason, "Admission rejected");
            return Ok(ExecutionOutcome::Rejected(reason));
        }
        debug!(instrument = %instrument, size = %decision.size_usd, available = %ledger.available(), "Budget reserved");

        if let Err(e) = self.exchange.set_leverage(instrument, leverage).await {
            warn!(instrument = %instrument, leverage = leverage, error = %e, "Failed to set leverage");
        }

        let ack = match self
            .exchange
            .place_market_order(instrument, OrderSide::opening(direction), quantity, false)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                ledger.release(instrument, Decimal::ZERO)?;
                warn!(
                    instrument = %instrument,
                    direction = %direction,
                    error = %e,
                    available = %ledger.available(),
                    "Entry order failed, reservation rolled back"
                );
                return Err(e.into());
            }
        };

        let entry_price = ack.avg_price.unwrap_or(decision.entry_price);
        let quantity = if ack.executed_qty > Decimal::ZERO { ack.executed_qty } else { quantity };

        let mut position = Position {
            instrument: instrument.to_string(),
            direction,
            entry_price,
            quantity,
            notional_usd: decision.size_usd,
            leverage,
            has_stop_target: false,
            stop_price: None,
            target_price: None,
            opened_at: Utc::now(),
            status: PositionStatus::Active,
            confidence: decision.confidence,
            rationale: decision.rationale.clone(),
        };

        if let Some((stop, target)) = levels {
            position.has_stop_target = true;
            position.stop_price = Some(stop);
            position.target_price = Some(target);
            // Levels are also checked locally each tick, so a failure here is not fatal
            if let Err(e) = self
                .exchange
                .place_protective_orders(instrument, direction, quantity, stop, target)
                .await
            {
                warn!(instrument = %instrument, error = %e, "Failed to place protective orders");
            }
        }

        ledger.activate(position.clone())?;
        info!(
            instrument = %instrument,
            direction = %direction,
            size = %position.notional_usd,
            leverage = leverage,
            quantity = %quantity,
            entry = %entry_price,
            available = %ledger.available(),
            "Position opened"
        );

        Ok(ExecutionOutcome::Opened(position))
    }

    // ==================== Close ====================

    /// ACTIVE -> CLOSING -> FLAT. A no-op on a flat instrument.
    pub async fn close(
        &self,
        instrument: &str,
        reason: CloseReason,
        note: &str,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let _transition = self.enter(instrument, InstrumentState::Closing)?;
        self.close_inner(instrument, reason, note).await
    }

    async fn close_inner(
        &self,
        instrument: &str,
        reason: CloseReason,
        note: &str,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let position = self.ledger.lock().await.position(instrument).cloned();
        let Some(position) = position else {
            debug!(instrument = %instrument, "Close requested on flat instrument");
            return Ok(ExecutionOutcome::Skipped(format!("{} already flat", instrument)));
        };

        match self.exchange.cancel_reduce_only_orders(instrument).await {
            Ok(0) => {}
            Ok(n) => debug!(instrument = %instrument, cancelled = n, "Cancelled reduce-only orders"),
            Err(e) => warn!(instrument = %instrument, error = %e, "Failed to cancel reduce-only orders"),
        }

        let exit_price = match self.exchange.live_position(instrument).await? {
            Some(live) => {
                let ack = self
                    .exchange
                    .place_market_order(instrument, OrderSide::closing(position.direction), live.quantity, true)
                    .await?;
                match ack.avg_price {
                    Some(price) => price,
                    None => self.exchange.last_price(instrument).await?,
                }
            }
            None => {
                info!(instrument = %instrument, reason = %reason, "No live position at exchange, recording close only");
                self.exchange.last_price(instrument).await?
            }
        };

        let trade = ClosedTrade::from_position(&position, exit_price, reason, note, Utc::now());

        // The position stays ACTIVE until history has it; the next tick retries
        self.history
            .append(&trade)
            .await
            .map_err(|e| ExecutionError::History(e.to_string()))?;

        let mut ledger = self.ledger.lock().await;
        ledger.release(instrument, trade.realized_pnl)?;

        info!(
            instrument = %instrument,
            direction = %trade.direction,
            reason = %reason,
            entry = %trade.entry_price,
            exit = %exit_price,
            pnl = %trade.realized_pnl.round_dp(4),
            available = %ledger.available(),
            "Position closed"
        );

        Ok(ExecutionOutcome::Closed(trade))
    }

    // ==================== Reverse ====================

    /// Close the active position, then ask for a fresh decision on fresh
    /// signals and open the opposite side only if that decision is directional.
    pub async fn reverse(&self, instrument: &str, decision: &Decision) -> Result<ExecutionOutcome, ExecutionError> {
        let _transition = self.enter(instrument, InstrumentState::Reversing)?;

        let Some(current) = self.ledger.lock().await.position(instrument).cloned() else {
            return Ok(ExecutionOutcome::Skipped(format!("{} has nothing to reverse", instrument)));
        };
        if decision.action.direction() == Some(current.direction) {
            warn!(
                instrument = %instrument,
                action = %decision.action,
                direction = %current.direction,
                "Reverse targets current direction, treating as HOLD"
            );
            return Ok(ExecutionOutcome::Skipped("reverse into same direction".to_string()));
        }

        let closed = match self
            .close_inner(instrument, CloseReason::ReversePosition, &decision.rationale)
            .await?
        {
            ExecutionOutcome::Closed(trade) => trade,
            other => return Ok(other),
        };

        let available = {
            let ledger = self.ledger.lock().await;
            if ledger.position(instrument).is_some() {
                warn!(instrument = %instrument, "Position still present after reverse close");
                return Ok(ExecutionOutcome::Reversed { closed, opened: None });
            }
            ledger.available()
        };

        let bundle = match self.signals.signal_bundle(instrument).await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Signal refresh after reverse close failed, staying flat");
                return Ok(ExecutionOutcome::Reversed { closed, opened: None });
            }
        };
        let fresh = self
            .oracle
            .entry_decision(EntryContext {
                bundle: &bundle,
                current_position: None,
                available_budget: available,
                learning_context: None,
            })
            .await;

        if !fresh.is_directional() {
            info!(instrument = %instrument, "Fresh decision after reverse is HOLD, staying flat");
            return Ok(ExecutionOutcome::Reversed { closed, opened: None });
        }
        if let Some(reason) = self.screen(&fresh, &bundle).await {
            info!(instrument = %instrument, reason = %reason, "Reverse entry screened out");
            return Ok(ExecutionOutcome::Reversed { closed, opened: None });
        }

        let target = current.direction.opposite();
        if fresh.action.direction() != Some(target) {
            debug!(instrument = %instrument, fresh = %fresh.action, forced = %target, "Forcing reverse direction");
        }
        let forced = Decision {
            action: entry_action(target),
            ..fresh
        };

        let opened = match self.open_inner(instrument, &forced).await {
            Ok(ExecutionOutcome::Opened(position)) => Some(position),
            Ok(other) => {
                info!(instrument = %instrument, outcome = ?other, "Reverse entry not opened");
                None
            }
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Reverse entry failed, instrument left flat");
                None
            }
        };

        Ok(ExecutionOutcome::Reversed { closed, opened })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bundle, decision, FailingExchange, MemoryHistory, ScriptedOracle, StaticSignals};
    use crate::trading::ledger::RiskLedger;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    struct Harness {
        coordinator: ExecutionCoordinator,
        exchange: Arc<FailingExchange>,
        history: Arc<MemoryHistory>,
        oracle: Arc<ScriptedOracle>,
        signals: Arc<StaticSignals>,
    }

    fn harness_with(config: TradingConfig) -> Harness {
        let exchange = FailingExchange::new();
        let history = MemoryHistory::new();
        let oracle = ScriptedOracle::new();
        let signals = StaticSignals::new();
        let coordinator = ExecutionCoordinator::new(
            &config,
            exchange.clone(),
            RiskLedger::new(&config).shared(),
            history.clone(),
            oracle.clone(),
            signals.clone(),
        );
        Harness {
            coordinator,
            exchange,
            history,
            oracle,
            signals,
        }
    }

    fn harness() -> Harness {
        harness_with(TradingConfig::default())
    }

    async fn available(h: &Harness) -> Decimal {
        h.coordinator.ledger().lock().await.available()
    }

    async fn assert_invariants(h: &Harness) {
        h.coordinator.ledger().lock().await.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_take_profit_scenario() {
        let h = harness();
        h.exchange.inner.set_price("SOLUSDT", dec!(100)).await;

        let outcome = h
            .coordinator
            .open("SOLUSDT", &decision(Action::Long, dec!(40), dec!(100), 10))
            .await
            .unwrap();
        let ExecutionOutcome::Opened(position) = outcome else {
            panic!("expected open, got {:?}", outcome);
        };
        assert_eq!(position.quantity, dec!(4));
        assert_eq!(available(&h).await, dec!(460));
        assert_eq!(h.coordinator.state("SOLUSDT").await, InstrumentState::Active);

        h.exchange.inner.set_price("SOLUSDT", dec!(110)).await;
        let outcome = h
            .coordinator
            .close("SOLUSDT", CloseReason::TakeProfit, "target")
            .await
            .unwrap();
        let ExecutionOutcome::Closed(trade) = outcome else {
            panic!("expected close, got {:?}", outcome);
        };

        assert_eq!(trade.realized_pnl, dec!(40));
        assert_eq!(available(&h).await, dec!(540));
        assert_eq!(h.history.trades().len(), 1);
        assert_eq!(h.history.trades()[0].close_reason, CloseReason::TakeProfit);
        assert_eq!(h.coordinator.state("SOLUSDT").await, InstrumentState::Flat);
        assert!(h.exchange.inner.live_position("SOLUSDT").await.unwrap().is_none());
        assert_invariants(&h).await;
    }

    #[tokio::test]
    async fn test_reverse_with_hold_ends_flat() {
        let h = harness();
        h.exchange.inner.set_price("BNBUSDT", dec!(100)).await;
        h.coordinator
            .open("BNBUSDT", &decision(Action::Long, dec!(40), dec!(100), 10))
            .await
            .unwrap();

        // -0.3% at 10x is -3%
        h.exchange.inner.set_price("BNBUSDT", dec!(99.7)).await;
        h.signals.set(bundle("BNBUSDT", dec!(99.7)));
        let reverse = decision(Action::ReverseShort, dec!(40), dec!(99.7), 10);
        let outcome = h
            .coordinator
            .reverse("BNBUSDT", &reverse)
            .await
            .unwrap();

        let ExecutionOutcome::Reversed { closed, opened } = outcome else {
            panic!("expected reverse, got {:?}", outcome);
        };
        assert!(opened.is_none());
        assert_eq!(closed.close_reason, CloseReason::ReversePosition);
        assert_eq!(closed.realized_pnl, dec!(-1.2));
        assert_eq!(h.history.trades().len(), 1);
        assert_eq!(h.oracle.entry_calls(), 1);
        assert_eq!(h.oracle.saw_position(), vec![false]);
        assert_eq!(h.coordinator.state("BNBUSDT").await, InstrumentState::Flat);
        assert_eq!(available(&h).await, dec!(498.8));
        assert_invariants(&h).await;
    }

    #[tokio::test]
    async fn test_reverse_forces_opposite_direction() {
        let h = harness();
        h.exchange.inner.set_price("SOLUSDT", dec!(100)).await;
        h.coordinator
            .open("SOLUSDT", &decision(Action::Long, dec!(40), dec!(100), 10))
            .await
            .unwrap();

        // Fresh decision says LONG again; the reverse still opens SHORT
        h.signals.set(bundle("SOLUSDT", dec!(100)));
        h.oracle.push_entry(decision(Action::Long, dec!(30), dec!(100), 5));
        let outcome = h
            .coordinator
            .execute("SOLUSDT", &decision(Action::ReverseShort, dec!(40), dec!(100), 10))
            .await
            .unwrap();

        let ExecutionOutcome::Reversed { opened: Some(opened), .. } = outcome else {
            panic!("expected reverse with open, got {:?}", outcome);
        };
        assert_eq!(opened.direction, Direction::Short);
        assert_eq!(opened.notional_usd, dec!(30));
        let live = h.exchange.inner.live_position("SOLUSDT").await.unwrap().unwrap();
        assert_eq!(live.direction, Direction::Short);
        assert_eq!(available(&h).await, dec!(470));
        assert_invariants(&h).await;
    }

    #[tokio::test]
    async fn test_reverse_into_same_direction_is_hold() {
        let h = harness();
        h.coordinator
            .open("AVAXUSDT", &decision(Action::Short, dec!(20), dec!(35), 5))
            .await
            .unwrap();

        let outcome = h
            .coordinator
            .reverse("AVAXUSDT", &decision(Action::ReverseShort, dec!(20), dec!(35), 5))
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Skipped(_)));
        assert!(h.history.trades().is_empty());
        assert_eq!(h.coordinator.state("AVAXUSDT").await, InstrumentState::Active);
    }

    #[tokio::test]
    async fn test_reverse_asks_on_post_close_signals() {
        let h = harness();
        h.exchange.inner.set_price("SOLUSDT", dec!(100)).await;
        h.coordinator
            .open("SOLUSDT", &decision(Action::Long, dec!(40), dec!(100), 10))
            .await
            .unwrap();

        // Market moved between the reverse signal and the close
        h.exchange.inner.set_price("SOLUSDT", dec!(96)).await;
        h.signals.set(bundle("SOLUSDT", dec!(96)));
        h.oracle.push_entry(decision(Action::Short, dec!(30), dec!(96), 5));

        let outcome = h
            .coordinator
            .reverse("SOLUSDT", &decision(Action::ReverseShort, dec!(40), dec!(100), 10))
            .await
            .unwrap();

        assert_eq!(h.oracle.seen_prices(), vec![dec!(96)]);
        let ExecutionOutcome::Reversed { opened: Some(opened), .. } = outcome else {
            panic!("expected reverse with open, got {:?}", outcome);
        };
        assert_eq!(opened.direction, Direction::Short);
        assert_eq!(opened.entry_price, dec!(96));
        assert_invariants(&h).await;
    }

    #[tokio::test]
    async fn test_reverse_without_fresh_signals_ends_flat() {
        let h = harness();
        h.exchange.inner.set_price("AVAXUSDT", dec!(35)).await;
        h.coordinator
            .open("AVAXUSDT", &decision(Action::Long, dec!(35), dec!(35), 5))
            .await
            .unwrap();

        // No bundle registered for AVAXUSDT, so the refresh fails
        let outcome = h
            .coordinator
            .reverse("AVAXUSDT", &decision(Action::ReverseShort, dec!(35), dec!(35), 5))
            .await
            .unwrap();

        let ExecutionOutcome::Reversed { closed, opened } = outcome else {
            panic!("expected reverse, got {:?}", outcome);
        };
        assert!(opened.is_none());
        assert_eq!(closed.close_reason, CloseReason::ReversePosition);
        assert_eq!(h.oracle.entry_calls(), 0);
        assert_eq!(h.coordinator.state("AVAXUSDT").await, InstrumentState::Flat);
        assert_eq!(available(&h).await, dec!(500));
        assert_invariants(&h).await;
    }

    #[tokio::test]
    async fn test_oversized_oracle_size_is_rejected() {
        let h = harness();
        h.exchange.inner.set_price("SOLUSDT", dec!(100)).await;
        let huge = Decimal::from_i128_with_scale(50_000_000_000_000_000_000_000_000_000, 0);

        let outcome = h
            .coordinator
            .execute("SOLUSDT", &decision(Action::Long, huge, dec!(100), 10))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ExecutionOutcome::Rejected(AdmissionRejected::InsufficientBudget { .. })
        ));
        assert_eq!(h.exchange.order_count(), 0);
        assert_eq!(available(&h).await, dec!(500));
        assert_eq!(h.coordinator.state("SOLUSDT").await, InstrumentState::Flat);
    }

    #[tokio::test]
    async fn test_failed_order_rolls_back_reservation() {
        let h = harness();
        h.exchange.fail_opening_orders(true);

        let result = h
            .coordinator
            .open("SOLUSDT", &decision(Action::Long, dec!(40), dec!(180), 5))
            .await;

        assert!(matches!(result, Err(ExecutionError::Exchange(_))));
        assert_eq!(available(&h).await, dec!(500));
        let ledger = h.coordinator.ledger().lock().await;
        assert!(!ledger.is_reserved("SOLUSDT"));
        assert_eq!(ledger.open_count(), 0);
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let h = harness();
        h.coordinator
            .open("BNBUSDT", &decision(Action::Long, dec!(40), dec!(300), 5))
            .await
            .unwrap();

        let first = h.coordinator.close("BNBUSDT", CloseReason::TimeExit, "").await.unwrap();
        assert!(matches!(first, ExecutionOutcome::Closed(_)));
        let after_first = available(&h).await;

        let second = h.coordinator.close("BNBUSDT", CloseReason::TimeExit, "").await.unwrap();
        assert!(matches!(second, ExecutionOutcome::Skipped(_)));
        assert_eq!(h.history.trades().len(), 1);
        assert_eq!(available(&h).await, after_first);
    }

    #[tokio::test]
    async fn test_admission_rejection_changes_nothing() {
        let h = harness();
        let outcome = h
            .coordinator
            .open("SOLUSDT", &decision(Action::Long, dec!(60), dec!(180), 5))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ExecutionOutcome::Rejected(AdmissionRejected::SizeLimit {
                requested: dec!(60),
                cap: dec!(50)
            })
        );
        assert_eq!(h.exchange.order_count(), 0);
        assert_eq!(available(&h).await, dec!(500));
    }

    #[tokio::test]
    async fn test_zero_quantity_fails_before_reserving() {
        let h = harness();
        let result = h
            .coordinator
            .open("BTCUSDT", &decision(Action::Long, dec!(1), dec!(45000), 5))
            .await;

        assert!(matches!(result, Err(ExecutionError::ZeroQuantity { .. })));
        assert_eq!(available(&h).await, dec!(500));
        assert_eq!(h.exchange.order_count(), 0);
    }

    #[tokio::test]
    async fn test_history_failure_keeps_position_until_retried() {
        let h = harness();
        h.coordinator
            .open("SOLUSDT", &decision(Action::Long, dec!(40), dec!(180), 5))
            .await
            .unwrap();

        h.history.set_failing(true);
        let result = h.coordinator.close("SOLUSDT", CloseReason::StopLoss, "").await;
        assert!(matches!(result, Err(ExecutionError::History(_))));
        assert_eq!(h.coordinator.state("SOLUSDT").await, InstrumentState::Active);
        assert!(h.exchange.inner.live_position("SOLUSDT").await.unwrap().is_none());

        h.history.set_failing(false);
        let outcome = h
            .coordinator
            .close("SOLUSDT", CloseReason::ExternalClose, "")
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Closed(_)));
        assert_eq!(h.history.trades().len(), 1);
        assert_eq!(available(&h).await, dec!(500));
        assert_invariants(&h).await;
    }

    #[tokio::test]
    async fn test_busy_instrument_refused() {
        let h = harness();
        let _held = h.coordinator.enter("SOLUSDT", InstrumentState::Closing).unwrap();

        let result = h
            .coordinator
            .open("SOLUSDT", &decision(Action::Long, dec!(40), dec!(180), 5))
            .await;
        assert!(matches!(result, Err(ExecutionError::Busy { .. })));
        assert_eq!(h.coordinator.state("SOLUSDT").await, InstrumentState::Closing);
    }

    #[tokio::test]
    async fn test_stop_target_mode_places_levels() {
        let h = harness_with(TradingConfig {
            execution_mode: ExecutionMode::StopTarget,
            ..Default::default()
        });
        h.exchange.inner.set_price("BNBUSDT", dec!(300)).await;

        let mut entry = decision(Action::Short, dec!(40), dec!(300), 10);
        entry.stop_price = Some(dec!(306));
        entry.target_price = Some(dec!(291));
        let ExecutionOutcome::Opened(position) = h.coordinator.open("BNBUSDT", &entry).await.unwrap() else {
            panic!("expected open");
        };
        assert!(position.has_stop_target);
        assert_eq!(position.stop_price, Some(dec!(306)));

        // Missing levels with no policy is an execution failure, not a naked entry
        let naked = decision(Action::Long, dec!(40), dec!(35), 10);
        let result = h.coordinator.open("AVAXUSDT", &naked).await;
        assert!(matches!(result, Err(ExecutionError::MissingStopTarget)));
        assert_eq!(available(&h).await, dec!(460));
    }

    #[tokio::test]
    async fn test_close_read_failure_keeps_position() {
        let h = harness();
        h.coordinator
            .open("SOLUSDT", &decision(Action::Long, dec!(40), dec!(180), 5))
            .await
            .unwrap();

        h.exchange.fail_reads(true);
        let result = h.coordinator.close("SOLUSDT", CloseReason::TrendReversal, "").await;
        assert!(matches!(result, Err(ExecutionError::Exchange(_))));
        assert_eq!(h.coordinator.state("SOLUSDT").await, InstrumentState::Active);
        assert!(h.history.trades().is_empty());
    }

    #[tokio::test]
    async fn test_screen_applies_confidence_floor() {
        let h = harness_with(TradingConfig {
            min_entry_confidence: 75,
            ..Default::default()
        });
        let b = bundle("SOLUSDT", dec!(100));
        let d = decision(Action::Long, dec!(40), dec!(100), 5);
        assert!(h.coordinator.screen(&d, &b).await.is_some());

        let confident = Decision { confidence: 80, ..d };
        assert!(h.coordinator.screen(&confident, &b).await.is_none());
        assert!(h.coordinator.screen(&Decision::hold(dec!(100), ""), &b).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_overshoot() {
        let config = TradingConfig {
            total_budget: dec!(100),
            max_position_size_percent: dec!(50),
            max_concurrent_positions: 10,
            ..Default::default()
        };
        let h = Arc::new(harness_with(config));
        let symbols = ["A1USDT", "A2USDT", "A3USDT", "A4USDT", "A5USDT", "A6USDT"];
        for symbol in symbols {
            h.exchange.inner.set_price(symbol, dec!(100)).await;
        }

        let tasks = symbols.iter().map(|s| {
            let h = h.clone();
            let symbol = s.to_string();
            tokio::spawn(async move {
                h.coordinator
                    .open(&symbol, &decision(Action::Long, dec!(40), dec!(100), 5))
                    .await
            })
        });
        let results = futures::future::join_all(tasks).await;

        let opened = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(ExecutionOutcome::Opened(_)))))
            .count();
        assert_eq!(opened, 2);
        assert_eq!(available(&h).await, dec!(20));
        assert_invariants(&h).await;
    }

    #[derive(Debug, Clone)]
    enum Fresh {
        Hold,
        Long,
        Short,
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn reverse_leaves_at_most_one_opposite_position(
            start_long in any::<bool>(),
            fresh in prop_oneof![Just(Fresh::Hold), Just(Fresh::Long), Just(Fresh::Short)],
            fresh_size in 1u32..80,
            fail_open in any::<bool>(),
            exit_price in 90u32..110,
        ) {
            tokio_test::block_on(async {
                let h = harness();
                h.exchange.inner.set_price("SOLUSDT", dec!(100)).await;
                let start = if start_long { Direction::Long } else { Direction::Short };
                h.coordinator
                    .open("SOLUSDT", &decision(entry_action(start), dec!(40), dec!(100), 10))
                    .await
                    .unwrap();

                let price = Decimal::from(exit_price);
                h.exchange.inner.set_price("SOLUSDT", price).await;
                h.signals.set(bundle("SOLUSDT", price));
                h.exchange.fail_opening_orders(fail_open);
                match fresh {
                    Fresh::Hold => {}
                    Fresh::Long => h.oracle.push_entry(decision(Action::Long, Decimal::from(fresh_size), price, 5)),
                    Fresh::Short => h.oracle.push_entry(decision(Action::Short, Decimal::from(fresh_size), price, 5)),
                }
                let reverse_action = match start {
                    Direction::Long => Action::ReverseShort,
                    Direction::Short => Action::ReverseLong,
                };

                let outcome = h
                    .coordinator
                    .reverse("SOLUSDT", &decision(reverse_action, dec!(40), price, 10))
                    .await
                    .unwrap();
                prop_assert!(matches!(outcome, ExecutionOutcome::Reversed { .. }), "unexpected {:?}", outcome);

                let ledger = h.coordinator.ledger().lock().await;
                let positions = ledger.positions();
                prop_assert!(positions.len() <= 1);
                if let Some(p) = positions.first() {
                    prop_assert_eq!(p.direction, start.opposite());
                }
                prop_assert!(!ledger.is_reserved("SOLUSDT"));
                prop_assert!(ledger.check_invariants().is_ok());
                prop_assert_eq!(h.history.trades().len(), 1);
                Ok(())
            })?;
        }
    }

    #[tokio::test]
    async fn test_external_close_places_no_order() {
        let h = harness();
        h.exchange.inner.set_price("AVAXUSDT", dec!(35)).await;
        h.coordinator
            .open("AVAXUSDT", &decision(Action::Long, dec!(35), dec!(35), 5))
            .await
            .unwrap();
        let orders = h.exchange.order_count();

        h.exchange.inner.force_flat("AVAXUSDT").await;
        h.exchange.inner.set_price("AVAXUSDT", dec!(34)).await;
        let ExecutionOutcome::Closed(trade) = h
            .coordinator
            .close("AVAXUSDT", CloseReason::ExternalClose, "liquidated")
            .await
            .unwrap()
        else {
            panic!("expected close");
        };

        assert_eq!(h.exchange.order_count(), orders);
        assert_eq!(trade.exit_price, dec!(34));
        assert_eq!(trade.realized_pnl, dec!(-5));
    }
}
