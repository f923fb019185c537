//! SQLite persistence for trade history and ledger state.
//!
//! Stores everything needed to resume after restart:
//! - Closed trade history (bounded retention, oldest pruned)
//! - Ledger totals and the running flag
//! - Snapshot of open positions, rewritten every tick
//! - Learning journal feature rows
//!
//! Money columns are TEXT holding exact decimal strings.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{ClosedTrade, Position, PositionStatus};
use crate::trading::LedgerSnapshot;

const DEFAULT_HISTORY_RETENTION: usize = 200;

/// Append-only sink for closed trades.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Durably record one closed trade.
    async fn append(&self, trade: &ClosedTrade) -> Result<()>;

    /// Most recent trades, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<ClosedTrade>>;
}

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
    history_retention: usize,
}

/// Stored closed trade.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: i64,
    pub instrument: String,
    pub direction: String,
    pub entry_price: String,
    pub exit_price: String,
    pub quantity: String,
    pub notional_usd: String,
    pub leverage: i64,
    pub realized_pnl: String,
    pub close_reason: String,
    pub close_note: String,
    pub confidence: i64,
    pub rationale: String,
    pub duration_minutes: i64,
    pub opened_at: String,
    pub closed_at: String,
}

/// Ledger totals stored in database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerState {
    pub id: i64,
    pub total_budget: String,
    pub realized_pnl: String,
    pub closed_trades: i64,
    pub is_running: bool,
    pub started_at: String,
    pub updated_at: String,
}

/// Stored open position.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub instrument: String,
    pub direction: String,
    pub entry_price: String,
    pub quantity: String,
    pub notional_usd: String,
    pub leverage: i64,
    pub has_stop_target: bool,
    pub stop_price: Option<String>,
    pub target_price: Option<String>,
    pub opened_at: String,
    pub confidence: i64,
    pub rationale: String,
}

/// Learning journal row, one per closed trade.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TradeFeature {
    pub instrument: String,
    pub direction: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub leverage: i64,
    pub loss_pct: f64,
    pub rsi_1h: Option<f64>,
    pub trend_1h: Option<String>,
    pub alignment: String,
    pub is_mistake: bool,
    pub closed_at: String,
}

/// Persisted ledger plus the positions open at the last snapshot.
#[derive(Debug, Clone)]
pub struct RestoredLedger {
    pub total_budget: Decimal,
    pub realized_pnl: Decimal,
    pub closed_trades: u32,
    pub was_running: bool,
    pub updated_at: String,
    pub positions: Vec<Position>,
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal> {
    raw.parse()
        .with_context(|| format!("Invalid decimal in {}: {}", field, raw))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp: {}", raw))?
        .with_timezone(&Utc))
}

impl TryFrom<StoredTrade> for ClosedTrade {
    type Error = anyhow::Error;

    fn try_from(row: StoredTrade) -> Result<Self> {
        Ok(ClosedTrade {
            direction: row.direction.parse()?,
            entry_price: parse_decimal(&row.entry_price, "entry_price")?,
            exit_price: parse_decimal(&row.exit_price, "exit_price")?,
            quantity: parse_decimal(&row.quantity, "quantity")?,
            notional_usd: parse_decimal(&row.notional_usd, "notional_usd")?,
            leverage: u32::try_from(row.leverage).context("Invalid leverage")?,
            realized_pnl: parse_decimal(&row.realized_pnl, "realized_pnl")?,
            close_reason: row.close_reason.parse()?,
            close_note: row.close_note,
            confidence: u8::try_from(row.confidence).unwrap_or(0),
            rationale: row.rationale,
            opened_at: parse_time(&row.opened_at)?,
            closed_at: parse_time(&row.closed_at)?,
            instrument: row.instrument,
        })
    }
}

impl TryFrom<StoredPosition> for Position {
    type Error = anyhow::Error;

    fn try_from(row: StoredPosition) -> Result<Self> {
        Ok(Position {
            direction: row.direction.parse()?,
            entry_price: parse_decimal(&row.entry_price, "entry_price")?,
            quantity: parse_decimal(&row.quantity, "quantity")?,
            notional_usd: parse_decimal(&row.notional_usd, "notional_usd")?,
            leverage: u32::try_from(row.leverage).context("Invalid leverage")?,
            has_stop_target: row.has_stop_target,
            stop_price: row
                .stop_price
                .as_deref()
                .map(|s| parse_decimal(s, "stop_price"))
                .transpose()?,
            target_price: row
                .target_price
                .as_deref()
                .map(|s| parse_decimal(s, "target_price"))
                .transpose()?,
            opened_at: parse_time(&row.opened_at)?,
            status: PositionStatus::Active,
            confidence: u8::try_from(row.confidence).unwrap_or(0),
            rationale: row.rationale,
            instrument: row.instrument,
        })
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self {
            pool,
            history_retention: DEFAULT_HISTORY_RETENTION,
        };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self {
            pool,
            history_retention: DEFAULT_HISTORY_RETENTION,
        };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Number of closed trades kept before the oldest are pruned.
    pub fn with_retention(mut self, history_retention: usize) -> Self {
        self.history_retention = history_retention.max(1);
        self
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Closed trades
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                notional_usd TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                realized_pnl TEXT NOT NULL,
                close_reason TEXT NOT NULL,
                close_note TEXT NOT NULL DEFAULT '',
                confidence INTEGER NOT NULL DEFAULT 0,
                rationale TEXT NOT NULL DEFAULT '',
                duration_minutes INTEGER NOT NULL DEFAULT 0,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Ledger totals
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_budget TEXT NOT NULL,
                realized_pnl TEXT NOT NULL DEFAULT '0',
                closed_trades INTEGER NOT NULL DEFAULT 0,
                is_running INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Open position snapshot
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS open_positions (
                instrument TEXT PRIMARY KEY,
                direction TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                notional_usd TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                has_stop_target INTEGER NOT NULL DEFAULT 0,
                stop_price TEXT,
                target_price TEXT,
                opened_at TEXT NOT NULL,
                confidence INTEGER NOT NULL DEFAULT 0,
                rationale TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Learning journal
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_features (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                leverage INTEGER NOT NULL,
                loss_pct REAL NOT NULL DEFAULT 0,
                rsi_1h REAL,
                trend_1h TEXT,
                alignment TEXT NOT NULL,
                is_mistake INTEGER NOT NULL DEFAULT 0,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_features_instrument ON trade_features(instrument)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Trade History ====================

    /// All retained trades, oldest first.
    pub async fn all_trades(&self) -> Result<Vec<ClosedTrade>> {
        let rows = sqlx::query_as::<_, StoredTrade>("SELECT * FROM trade_history ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch trade history")?;

        rows.into_iter().map(ClosedTrade::try_from).collect()
    }

    pub async fn trade_count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trade_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    // ==================== Ledger State ====================

    /// Write ledger totals and replace the open-position snapshot atomically.
    pub async fn save_snapshot(&self, snapshot: &LedgerSnapshot, is_running: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO ledger_state (id, total_budget, realized_pnl, closed_trades, is_running, started_at, updated_at)
            VALUES (1, ?, ?, ?, ?, datetime('now'), datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                total_budget = excluded.total_budget,
                realized_pnl = excluded.realized_pnl,
                closed_trades = excluded.closed_trades,
                is_running = excluded.is_running,
                updated_at = datetime('now')
            "#,
        )
        .bind(snapshot.total_budget.to_string())
        .bind(snapshot.realized_pnl.to_string())
        .bind(i64::from(snapshot.closed_trades))
        .bind(is_running)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM open_positions")
            .execute(&mut *tx)
            .await?;

        for position in &snapshot.positions {
            sqlx::query(
                r#"
                INSERT INTO open_positions (
                    instrument, direction, entry_price, quantity, notional_usd, leverage,
                    has_stop_target, stop_price, target_price, opened_at, confidence, rationale
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&position.instrument)
            .bind(position.direction.as_str())
            .bind(position.entry_price.to_string())
            .bind(position.quantity.to_string())
            .bind(position.notional_usd.to_string())
            .bind(i64::from(position.leverage))
            .bind(position.has_stop_target)
            .bind(position.stop_price.map(|p| p.to_string()))
            .bind(position.target_price.map(|p| p.to_string()))
            .bind(position.opened_at.to_rfc3339())
            .bind(i64::from(position.confidence))
            .bind(&position.rationale)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to commit ledger snapshot")?;
        Ok(())
    }

    /// Last persisted ledger, if any.
    pub async fn load_snapshot(&self) -> Result<Option<RestoredLedger>> {
        let state = sqlx::query_as::<_, LedgerState>("SELECT * FROM ledger_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read ledger state")?;

        let Some(state) = state else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, StoredPosition>("SELECT * FROM open_positions ORDER BY instrument")
            .fetch_all(&self.pool)
            .await
            .context("Failed to read open positions")?;
        let positions = rows
            .into_iter()
            .map(Position::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(RestoredLedger {
            total_budget: parse_decimal(&state.total_budget, "total_budget")?,
            realized_pnl: parse_decimal(&state.realized_pnl, "realized_pnl")?,
            closed_trades: u32::try_from(state.closed_trades).unwrap_or(0),
            was_running: state.is_running,
            updated_at: state.updated_at,
            positions,
        }))
    }

    // ==================== Learning Journal ====================

    pub async fn insert_feature(&self, feature: &TradeFeature) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_features (
                instrument, direction, entry_price, exit_price, realized_pnl, leverage,
                loss_pct, rsi_1h, trend_1h, alignment, is_mistake, closed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&feature.instrument)
        .bind(&feature.direction)
        .bind(feature.entry_price)
        .bind(feature.exit_price)
        .bind(feature.realized_pnl)
        .bind(feature.leverage)
        .bind(feature.loss_pct)
        .bind(feature.rsi_1h)
        .bind(&feature.trend_1h)
        .bind(&feature.alignment)
        .bind(feature.is_mistake)
        .bind(&feature.closed_at)
        .execute(&self.pool)
        .await
        .context("Failed to record trade features")?;

        Ok(())
    }

    /// Feature rows for an instrument, newest first.
    pub async fn recent_features(&self, instrument: &str, limit: i64) -> Result<Vec<TradeFeature>> {
        sqlx::query_as::<_, TradeFeature>(
            r#"
            SELECT instrument, direction, entry_price, exit_price, realized_pnl, leverage,
                   loss_pct, rsi_1h, trend_1h, alignment, is_mistake, closed_at
            FROM trade_features
            WHERE instrument = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(instrument)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trade features")
    }
}

#[async_trait]
impl HistoryStore for Database {
    async fn append(&self, trade: &ClosedTrade) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO trade_history (
                instrument, direction, entry_price, exit_price, quantity, notional_usd, leverage,
                realized_pnl, close_reason, close_note, confidence, rationale, duration_minutes,
                opened_at, closed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.instrument)
        .bind(trade.direction.as_str())
        .bind(trade.entry_price.to_string())
        .bind(trade.exit_price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.notional_usd.to_string())
        .bind(i64::from(trade.leverage))
        .bind(trade.realized_pnl.to_string())
        .bind(trade.close_reason.as_str())
        .bind(&trade.close_note)
        .bind(i64::from(trade.confidence))
        .bind(&trade.rationale)
        .bind(trade.duration_minutes())
        .bind(trade.opened_at.to_rfc3339())
        .bind(trade.closed_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("Failed to append trade history")?;

        sqlx::query(
            r#"
            DELETE FROM trade_history
            WHERE id NOT IN (SELECT id FROM trade_history ORDER BY id DESC LIMIT ?)
            "#,
        )
        .bind(self.history_retention as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.context("Failed to commit trade history")?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ClosedTrade>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM trade_history ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trade history")?;

        rows.into_iter().map(ClosedTrade::try_from).collect()
    }
}
