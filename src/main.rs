//! AI Futures Trader
//!
//! Trades a small universe of perpetual futures on decisions from an LLM
//! oracle, with a deterministic local fallback, a single risk ledger, and
//! a paper exchange unless live trading is explicitly confirmed.

mod api;
mod bot;
mod db;
mod exchange;
mod metrics;
mod models;
mod signals;
mod trading;

#[cfg(test)]
mod testing;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{BinanceClient, ChatBackend, OracleClient};
use crate::bot::{Bot, BotConfig};
use crate::db::{Database, HistoryStore};
use crate::exchange::{Exchange, PaperExchange};
use crate::metrics::StatsCalculator;
use crate::signals::{CandleFeed, MarketSignalSource, SignalSource};
use crate::trading::{
    AiOracle, AppConfig, DecisionOracle, ExecutionCoordinator, ExecutionMode, ExitRules,
    LearningHook, RiskLedger, TradeJournal,
};

/// Phrase that must be typed before any order moves real money.
const LIVE_CONFIRMATION: &str = "I ACCEPT LIVE TRADING RISK";

/// Default monitor interval when neither the config file nor the CLI sets one.
const DEFAULT_INTERVAL_SECS: u64 = 180;

/// AI-driven futures trading bot CLI.
#[derive(Parser)]
#[command(name = "aitrader")]
#[command(about = "Leveraged futures trading driven by an AI decision oracle", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./aitrader.db?mode=rwc", env = "AITRADER_DATABASE")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON config file; CLI flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the position monitor (paper unless --live)
    Run {
        /// Trade real money on Binance futures
        #[arg(long)]
        live: bool,

        /// Seconds between monitor ticks
        #[arg(short, long)]
        interval: Option<u64>,

        /// Total budget in USD
        #[arg(short, long)]
        budget: Option<Decimal>,

        /// Execution mode (manual, stop-target)
        #[arg(short, long)]
        mode: Option<ExecutionMode>,

        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Show the persisted ledger and open positions
    Status,

    /// Show recent closed trades
    History {
        /// Number of trades to show
        #[arg(short, long, default_value = "15")]
        limit: usize,
    },

    /// Show statistics over the whole trade history
    Stats,

    /// Show current configuration
    Config,

    /// Fetch and print the signal bundle for a symbol
    Signals {
        /// Futures symbol, e.g. SOLUSDT
        symbol: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    // Initialize database
    let db = Arc::new(
        Database::new(&cli.database)
            .await?
            .with_retention(config.trading.history_retention),
    );

    match cli.command {
        Commands::Run {
            live,
            interval,
            budget,
            mode,
            once,
        } => {
            if let Some(budget) = budget {
                config.trading.total_budget = budget;
            }
            if let Some(mode) = mode {
                config.trading.execution_mode = mode;
            }
            config.trading.validate()?;
            let interval = interval
                .or(config.monitor_interval_secs)
                .unwrap_or(DEFAULT_INTERVAL_SECS);

            if live {
                confirm_live()?;
            }
            run(config, db, live, interval, once).await?;
        }

        Commands::Status => {
            let Some(state) = db.load_snapshot().await? else {
                println!("No session found. Run 'aitrader run' to start the bot.");
                return Ok(());
            };

            let committed: Decimal = state.positions.iter().map(|p| p.notional_usd).sum();
            let exposure: Decimal = state.positions.iter().map(|p| p.exposure_usd()).sum();
            let available = state.total_budget + state.realized_pnl - committed;
            let recorded = db.trade_count().await?;

            println!("\n=== Ledger ===");
            println!("Total Budget:   ${:.2}", state.total_budget);
            println!("Available:      ${:.2}", available);
            println!("Committed:      ${:.2}", committed);
            println!("Exposure:       ${:.2}", exposure);
            println!("Realized P&L:   ${:.2}", state.realized_pnl);
            println!("Closed Trades:  {} ({} in history)", state.closed_trades, recorded);
            println!("Status:         {}", if state.was_running { "Running" } else { "Stopped" });
            println!("Updated:        {}", state.updated_at);

            println!("\n--- Open Positions ({}) ---", state.positions.len());
            for pos in &state.positions {
                println!(
                    "  {:<10} {:<5} ${:>7.2} x{:<3} @ {} (qty {}){}",
                    pos.instrument,
                    pos.direction.as_str(),
                    pos.notional_usd,
                    pos.leverage,
                    pos.entry_price,
                    pos.quantity,
                    match (pos.stop_price, pos.target_price) {
                        (Some(stop), Some(target)) => format!(" SL {} / TP {}", stop, target),
                        _ => String::new(),
                    }
                );
            }
        }

        Commands::History { limit } => {
            let trades = db.recent(limit).await?;
            if trades.is_empty() {
                println!("No closed trades yet.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<10} {:<5} {:>10} {:>10} {:>10} {:>8}  {}",
                "CLOSED", "SYMBOL", "SIDE", "ENTRY", "EXIT", "P&L", "MIN", "REASON"
            );
            println!("{}", "-".repeat(100));

            for trade in trades {
                println!(
                    "{:<20} {:<10} {:<5} {:>10} {:>10} {:>10.2} {:>8}  {}",
                    trade.closed_at.format("%Y-%m-%d %H:%M:%S"),
                    trade.instrument,
                    trade.direction.as_str(),
                    trade.entry_price.round_dp(4),
                    trade.exit_price.round_dp(4),
                    trade.realized_pnl,
                    trade.duration_minutes(),
                    trade.close_reason
                );
            }
        }

        Commands::Stats => {
            let trades = db.all_trades().await?;
            let stats = StatsCalculator::calculate(&trades);
            println!("\n{}", stats);
        }

        Commands::Config => {
            let trading = &config.trading;
            let (min_lev, max_lev) = trading.leverage_range();

            println!("\n=== Trading Configuration ===\n");
            println!("Budget:");
            println!("  Total Budget:         ${}", trading.total_budget);
            println!("  Max Position Size:    ${} ({}%)", trading.max_position_size(), trading.max_position_size_percent);
            println!("  Max Concurrent:       {}", trading.max_concurrent_positions);
            println!("  Min Budget To Scan:   ${}", trading.min_budget_to_scan);

            println!("\nExecution:");
            println!("  Mode:                 {}", trading.execution_mode);
            println!("  Leverage:             {}x - {}x", min_lev, max_lev);
            println!("  Reverse Positions:    {}", trading.allow_reverse_positions);
            println!("  Min Entry Confidence: {}", trading.min_entry_confidence);
            match &trading.close_policy {
                Some(policy) => println!(
                    "  Close Policy:         TP {:?}% / SL {:?}% / max {:?} min",
                    policy.take_profit_pct, policy.stop_loss_pct, policy.max_hold_minutes
                ),
                None => println!("  Close Policy:         none (close oracle only)"),
            }

            println!("\nUniverse:");
            println!("  Instruments:          {}", trading.instruments.join(", "));
            println!(
                "  Timeframes:           {}",
                trading.timeframes.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
            );
            println!("  History Retention:    {}", trading.history_retention);

            let oracle = config.oracle.clone().with_env_overrides();
            println!("\n=== Oracle ===\n");
            println!("  Endpoint:             {}", oracle.base_url);
            println!("  Model:                {}", oracle.model);
            println!("  Attempts:             {} ({}s apart)", oracle.max_attempts, oracle.retry_delay_secs);
            println!("  Timeouts:             {}s entry / {}s close", oracle.entry_timeout_secs, oracle.close_timeout_secs);
            println!(
                "  API Key:              {}",
                if std::env::var("OPENROUTER_API_KEY").is_ok() { "set" } else { "missing (local fallback)" }
            );
            println!(
                "\nMonitor Interval:       {}s",
                config.monitor_interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS)
            );
        }

        Commands::Signals { symbol } => {
            let feed: Arc<dyn CandleFeed> = Arc::new(BinanceClient::public()?);
            let source = MarketSignalSource::new(feed, config.trading.timeframes.clone());
            let bundle = source.signal_bundle(&symbol.to_uppercase()).await?;

            println!("\n=== {} @ {} ===", bundle.instrument, bundle.current_price);
            println!("Trend Alignment: {}", bundle.alignment);
            println!(
                "\n{:<5} {:<8} {:>7} {:<7} {:<6} {:>12} {:>12} {:>8}",
                "TF", "TREND", "RSI", "CROSS", "VOLUME", "SUPPORT", "RESISTANCE", "CHG%"
            );
            println!("{}", "-".repeat(74));
            for (tf, s) in &bundle.timeframes {
                println!(
                    "{:<5} {:<8} {:>7} {:<7} {:<6} {:>12} {:>12} {:>8}",
                    tf.as_str(),
                    s.trend.map(|t| t.as_str()).unwrap_or("-"),
                    s.rsi.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string()),
                    s.crossover.as_str(),
                    if s.volume_spike { "SPIKE" } else { "-" },
                    s.support.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string()),
                    s.resistance.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string()),
                    s.price_change_pct.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string()),
                );
            }
        }
    }

    Ok(())
}

/// Require the typed confirmation phrase on stdin.
fn confirm_live() -> Result<()> {
    println!("\n*** LIVE TRADING ***");
    println!("Orders will be placed with real funds on Binance futures.");
    println!("Type '{}' to continue:", LIVE_CONFIRMATION);

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read confirmation")?;

    if line.trim() != LIVE_CONFIRMATION {
        anyhow::bail!("Live trading not confirmed");
    }
    Ok(())
}

/// Wire the ledger, exchange, oracle and monitor together and run.
async fn run(config: AppConfig, db: Arc<Database>, live: bool, interval: u64, once: bool) -> Result<()> {
    let trading = config.trading;

    // Restore ledger from the last session
    let restored = db.load_snapshot().await?;
    let ledger = match &restored {
        Some(state) => {
            if state.was_running {
                warn!(updated_at = %state.updated_at, "Previous session did not stop cleanly");
            }
            if state.total_budget != trading.total_budget {
                info!(
                    previous = %state.total_budget,
                    current = %trading.total_budget,
                    "Total budget changed since last session"
                );
            }
            info!(
                realized_pnl = %state.realized_pnl,
                closed_trades = state.closed_trades,
                positions = state.positions.len(),
                "Resuming from previous session"
            );
            RiskLedger::restore(&trading, state.realized_pnl, state.closed_trades, state.positions.clone())?
        }
        None => RiskLedger::new(&trading),
    };
    let ledger = ledger.shared();

    // Exchange and market data
    let (exchange, feed): (Arc<dyn Exchange>, Arc<dyn CandleFeed>) = if live {
        let client = Arc::new(
            BinanceClient::from_env().context("Live mode needs BINANCE_API_KEY and BINANCE_SECRET_KEY")?,
        );
        if let Err(e) = client.load_precision(&trading.instruments).await {
            warn!(error = %e, "Failed to load quantity precision, using defaults");
        }
        client
            .prepare_symbols(&trading.instruments, trading.leverage_range().0)
            .await;
        (client.clone() as Arc<dyn Exchange>, client as Arc<dyn CandleFeed>)
    } else {
        let public = Arc::new(BinanceClient::public()?);
        let paper = PaperExchange::with_feed(public.clone());
        if let Some(state) = &restored {
            for position in &state.positions {
                paper.restore_position(position).await;
            }
        }
        (Arc::new(paper) as Arc<dyn Exchange>, public as Arc<dyn CandleFeed>)
    };
    let signals: Arc<dyn SignalSource> = Arc::new(MarketSignalSource::new(feed, trading.timeframes.clone()));

    // Decision oracle
    let oracle_config = config.oracle.with_env_overrides();
    let backend = match OracleClient::from_env(&oracle_config)? {
        Some(client) => {
            info!(model = client.model(), "Decision oracle configured");
            Some(Arc::new(client) as Arc<dyn ChatBackend>)
        }
        None => {
            warn!("OPENROUTER_API_KEY not set, entries use the local fallback and closes never fire from the oracle");
            None
        }
    };
    let ai_oracle = AiOracle::new(backend, oracle_config, &trading);
    info!(remote = ai_oracle.is_remote(), mode = %trading.execution_mode, "Decision oracle ready");
    let oracle: Arc<dyn DecisionOracle> = Arc::new(ai_oracle);

    let journal: Arc<dyn LearningHook> = Arc::new(TradeJournal::new(db.clone()));
    let learning = Some(journal);

    let history: Arc<dyn HistoryStore> = db.clone();
    let coordinator = ExecutionCoordinator::new(
        &trading,
        exchange.clone(),
        ledger,
        history,
        oracle.clone(),
        signals.clone(),
    )
    .with_learning(learning.clone());

    let mut bot = Bot::new(
        BotConfig::from_trading(&trading, interval),
        coordinator,
        oracle,
        signals,
    )
    .with_exit_rules(ExitRules::new(trading.close_policy.clone()))
    .with_learning(learning)
    .with_database(db);

    println!("\n=== AI Futures Trader ===");
    println!("Exchange:   {}", if exchange.is_live() { "LIVE (Binance futures)" } else { "PAPER" });
    println!("Mode:       {}", trading.execution_mode);
    println!("Budget:     ${}", trading.total_budget);
    println!("Interval:   {}s", interval);
    println!("Universe:   {}", trading.instruments.join(", "));
    if !once {
        println!("\nPress Ctrl+C to stop.\n");
    }

    if once {
        bot.run_once().await?;
    } else {
        bot.run().await?;
    }

    let stats = bot.get_stats().await;
    println!("\n{}", stats);

    Ok(())
}
