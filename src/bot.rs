//! Bot runner: the position monitor loop.
//!
//! Handles:
//! - Reconciling active positions with the exchange
//! - Local exit rules, then the close oracle, then reversal
//! - Scanning flat instruments for entries
//! - Persisting the ledger snapshot for crash recovery

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::models::{CloseReason, Position, SignalBundle};
use crate::signals::SignalSource;
use crate::trading::{
    DecisionOracle, EntryContext, ExecutionCoordinator, ExecutionOutcome, ExitRules,
    InstrumentState, LearningHook, TradingConfig,
};

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Seconds between monitor ticks
    pub interval_secs: u64,

    /// Instruments visited each tick, in order
    pub instruments: Vec<String>,

    /// Offer open positions to the oracle as reverse candidates
    pub allow_reverse_positions: bool,

    /// Flat instruments are only scanned while more than this is available
    pub min_budget_to_scan: Decimal,
}

impl BotConfig {
    pub fn from_trading(trading: &TradingConfig, interval_secs: u64) -> Self {
        Self {
            interval_secs,
            instruments: trading.instruments.clone(),
            allow_reverse_positions: trading.allow_reverse_positions,
            min_budget_to_scan: trading.min_budget_to_scan,
        }
    }
}

/// Stop request set by the Ctrl+C handler.
///
/// The current tick always runs to completion; only the wait between ticks
/// is interrupted.
#[derive(Clone, Default)]
struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ShutdownHandle {
    fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        self.wake.notified().await;
    }
}

/// Counters since start.
#[derive(Debug, Default, Clone)]
struct Counters {
    ticks: u64,
    opened: u64,
    closed: u64,
    reversed: u64,
    rejected: u64,
    errors: u64,
}

/// Position monitor.
pub struct Bot {
    config: BotConfig,
    coordinator: ExecutionCoordinator,
    oracle: Arc<dyn DecisionOracle>,
    signals: Arc<dyn SignalSource>,
    exit_rules: ExitRules,
    learning: Option<Arc<dyn LearningHook>>,
    db: Option<Arc<Database>>,
    counters: Counters,
    shutdown: ShutdownHandle,
}

impl Bot {
    pub fn new(
        config: BotConfig,
        coordinator: ExecutionCoordinator,
        oracle: Arc<dyn DecisionOracle>,
        signals: Arc<dyn SignalSource>,
    ) -> Self {
        Self {
            config,
            coordinator,
            oracle,
            signals,
            exit_rules: ExitRules::default(),
            learning: None,
            db: None,
            counters: Counters::default(),
            shutdown: ShutdownHandle::default(),
        }
    }

    pub fn with_exit_rules(mut self, exit_rules: ExitRules) -> Self {
        self.exit_rules = exit_rules;
        self
    }

    pub fn with_learning(mut self, learning: Option<Arc<dyn LearningHook>>) -> Self {
        self.learning = learning;
        self
    }

    /// Persist the ledger snapshot after every tick and at shutdown.
    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            exchange = self.coordinator.exchange().name(),
            live = self.coordinator.exchange().is_live(),
            interval = self.config.interval_secs,
            instruments = ?self.config.instruments,
            "Starting monitor loop"
        );

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, finishing current tick");
                shutdown.trigger();
            }
        });

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.shutdown.is_triggered() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.wait() => break,
            }
            self.tick().await;
        }

        self.stop().await
    }

    /// One tick followed by a clean stop.
    pub async fn run_once(&mut self) -> Result<()> {
        self.tick().await;
        self.stop().await
    }

    /// Visit every configured instrument once.
    ///
    /// A failure on one instrument is logged and never stops the others.
    pub async fn tick(&mut self) {
        self.counters.ticks += 1;
        debug!(tick = self.counters.ticks, "Monitor tick");

        for instrument in self.config.instruments.clone() {
            if let Err(e) = self.process_instrument(&instrument).await {
                self.counters.errors += 1;
                error!(instrument = %instrument, error = %e, "Instrument processing failed");
            }
        }

        let snapshot = {
            let ledger = self.coordinator.ledger().lock().await;
            if let Err(violation) = ledger.check_invariants() {
                error!(violation = %violation, "Ledger invariant violated");
            }
            ledger.snapshot()
        };
        info!(
            tick = self.counters.ticks,
            active = snapshot.positions.len(),
            available = %snapshot.available_budget.round_dp(2),
            realized_pnl = %snapshot.realized_pnl.round_dp(2),
            "Tick complete"
        );

        if let Err(e) = self.persist(true).await {
            warn!(error = %e, "Failed to persist ledger snapshot");
        }
    }

    async fn process_instrument(&mut self, instrument: &str) -> Result<()> {
        match self.coordinator.state(instrument).await {
            InstrumentState::Flat => self.scan_entry(instrument).await,
            InstrumentState::Active => {
                let position = self.coordinator.ledger().lock().await.position(instrument).cloned();
                match position {
                    Some(position) => self.manage_position(position).await,
                    None => Ok(()),
                }
            }
            busy => {
                debug!(instrument = %instrument, state = %busy, "Transition in flight, skipping");
                Ok(())
            }
        }
    }

    // ==================== Active Positions ====================

    async fn manage_position(&mut self, position: Position) -> Result<()> {
        let instrument = position.instrument.clone();
        let exchange = self.coordinator.exchange().clone();

        if exchange.live_position(&instrument).await?.is_none() {
            warn!(instrument = %instrument, "Position missing at exchange");
            let outcome = self
                .coordinator
                .close(&instrument, CloseReason::ExternalClose, "position no longer open at exchange")
                .await?;
            self.record(outcome, None).await;
            return Ok(());
        }

        let price = exchange.last_price(&instrument).await?;
        debug!(
            instrument = %instrument,
            price = %price,
            pnl_pct = %position.pnl_percent_at(price).round_dp(2),
            "Checking position"
        );

        if let Some(exit) = self.exit_rules.check_exit(&position, price, Utc::now()) {
            info!(instrument = %instrument, reason = %exit.reason, note = %exit.note, "Exit rule triggered");
            let outcome = self.coordinator.close(&instrument, exit.reason, &exit.note).await?;
            self.record(outcome, None).await;
            return Ok(());
        }

        let bundle = match self.signals.signal_bundle(&instrument).await {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Signals unavailable for open position");
                None
            }
        };

        let close = self.oracle.close_decision(&position, price, bundle.as_ref()).await;
        if close.should_close {
            info!(
                instrument = %instrument,
                reason = %close.close_reason,
                confidence = close.confidence,
                "Close oracle requested exit"
            );
            let outcome = self
                .coordinator
                .close(&instrument, close.close_reason, &close.rationale)
                .await?;
            self.record(outcome, bundle.as_ref()).await;
            return Ok(());
        }

        if !self.config.allow_reverse_positions {
            return Ok(());
        }
        let Some(bundle) = bundle else {
            return Ok(());
        };

        let available = self.coordinator.ledger().lock().await.available();
        let learning_context = self.learning_context(&instrument).await;
        let decision = self
            .oracle
            .entry_decision(EntryContext {
                bundle: &bundle,
                current_position: Some(&position),
                available_budget: available,
                learning_context: learning_context.as_deref(),
            })
            .await;

        if !decision.is_reverse() {
            debug!(instrument = %instrument, action = %decision.action, "Keeping position");
            return Ok(());
        }

        info!(
            instrument = %instrument,
            action = %decision.action,
            confidence = decision.confidence,
            "Reversing position"
        );
        let outcome = self.coordinator.reverse(&instrument, &decision).await?;
        self.record(outcome, Some(&bundle)).await;
        Ok(())
    }

    // ==================== Flat Instruments ====================

    async fn scan_entry(&mut self, instrument: &str) -> Result<()> {
        let (available, has_capacity) = {
            let ledger = self.coordinator.ledger().lock().await;
            (ledger.available(), ledger.has_capacity())
        };
        if available <= self.config.min_budget_to_scan {
            debug!(instrument = %instrument, available = %available, "Budget below scan floor");
            return Ok(());
        }
        if !has_capacity {
            debug!(instrument = %instrument, "No free position slot");
            return Ok(());
        }

        let bundle = self.signals.signal_bundle(instrument).await?;
        let learning_context = self.learning_context(instrument).await;
        let decision = self
            .oracle
            .entry_decision(EntryContext {
                bundle: &bundle,
                current_position: None,
                available_budget: available,
                learning_context: learning_context.as_deref(),
            })
            .await;

        if !decision.is_directional() {
            info!(instrument = %instrument, rationale = %decision.rationale, "HOLD");
            return Ok(());
        }
        if let Some(reason) = self.coordinator.screen(&decision, &bundle).await {
            info!(instrument = %instrument, action = %decision.action, reason = %reason, "Entry skipped");
            return Ok(());
        }

        let outcome = self.coordinator.execute(instrument, &decision).await?;
        self.record(outcome, Some(&bundle)).await;
        Ok(())
    }

    async fn learning_context(&self, instrument: &str) -> Option<String> {
        match &self.learning {
            Some(hook) => hook.prompt_context(instrument).await,
            None => None,
        }
    }

    /// Update counters and feed closed trades to the learning hook.
    async fn record(&mut self, outcome: ExecutionOutcome, bundle: Option<&SignalBundle>) {
        let closed = match outcome {
            ExecutionOutcome::Opened(_) => {
                self.counters.opened += 1;
                None
            }
            ExecutionOutcome::Closed(trade) => {
                self.counters.closed += 1;
                Some(trade)
            }
            ExecutionOutcome::Reversed { closed, opened } => {
                self.counters.closed += 1;
                self.counters.reversed += 1;
                if opened.is_some() {
                    self.counters.opened += 1;
                }
                Some(closed)
            }
            ExecutionOutcome::Rejected(_) => {
                self.counters.rejected += 1;
                None
            }
            ExecutionOutcome::Skipped(reason) => {
                debug!(reason = %reason, "Nothing executed");
                None
            }
        };

        if let (Some(trade), Some(hook)) = (closed, &self.learning) {
            if let Err(e) = hook.on_trade_closed(&trade, bundle).await {
                warn!(instrument = %trade.instrument, error = %e, "Learning hook failed");
            }
        }
    }

    async fn persist(&self, is_running: bool) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let snapshot = self.coordinator.ledger().lock().await.snapshot();
        db.save_snapshot(&snapshot, is_running).await
    }

    /// Graceful stop: final snapshot with the running flag cleared.
    async fn stop(&mut self) -> Result<()> {
        info!("Stopping monitor...");
        self.persist(false).await?;
        info!("{}", self.get_stats().await);
        info!("Monitor stopped");
        Ok(())
    }

    /// Get current stats.
    pub async fn get_stats(&self) -> BotStats {
        let ledger = self.coordinator.ledger().lock().await;
        BotStats {
            total_budget: ledger.total_budget(),
            available_budget: ledger.available(),
            realized_pnl: ledger.realized_pnl(),
            open_positions: ledger.positions().len(),
            ticks: self.counters.ticks,
            opened: self.counters.opened,
            closed: self.counters.closed,
            reversed: self.counters.reversed,
            rejected: self.counters.rejected,
            errors: self.counters.errors,
            is_running: !self.shutdown.is_triggered(),
            live: self.coordinator.exchange().is_live(),
        }
    }
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub total_budget: Decimal,
    pub available_budget: Decimal,
    pub realized_pnl: Decimal,
    pub open_positions: usize,
    pub ticks: u64,
    pub opened: u64,
    pub closed: u64,
    pub reversed: u64,
    pub rejected: u64,
    pub errors: u64,
    pub is_running: bool,
    pub live: bool,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Monitor Statistics ===")?;
        writeln!(f, "Total Budget:     ${:.2}", self.total_budget)?;
        writeln!(f, "Available:        ${:.2}", self.available_budget)?;
        writeln!(f, "Realized P&L:     ${:.2}", self.realized_pnl)?;
        writeln!(f, "Open Positions:   {}", self.open_positions)?;
        writeln!(f, "Ticks:            {}", self.ticks)?;
        writeln!(f, "Trades:           {} opened, {} closed ({} reversed)",
            self.opened, self.closed, self.reversed)?;
        writeln!(f, "Rejected/Errors:  {} / {}", self.rejected, self.errors)?;
        writeln!(f, "Status:           {} {}",
            if self.is_running { "Running" } else { "Stopped" },
            if self.live { "(LIVE)" } else { "(Paper)" })?;
        Ok(())
    }
}
