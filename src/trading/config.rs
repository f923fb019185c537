//! Trading and oracle configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::Timeframe;

/// How positions are exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// No standing orders; the close oracle decides every exit
    ManualClose,
    /// Legacy mode with reduce-only stop and target orders
    StopTarget,
}

impl std::str::FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" | "manual-close" => Ok(ExecutionMode::ManualClose),
            "stop-target" | "tpsl" | "legacy" => Ok(ExecutionMode::StopTarget),
            other => anyhow::bail!("Unknown execution mode: {}", other),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::ManualClose => f.write_str("manual-close"),
            ExecutionMode::StopTarget => f.write_str("stop-target"),
        }
    }
}

/// Local exit thresholds, evaluated before the close oracle.
///
/// Percentages are leveraged PnL percent of committed capital.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosePolicy {
    pub take_profit_pct: Option<Decimal>,
    pub stop_loss_pct: Option<Decimal>,
    pub max_hold_minutes: Option<i64>,
}

/// Budget, limits, and universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Total capital the ledger manages (USD)
    pub total_budget: Decimal,

    /// Maximum number of simultaneously open positions
    pub max_concurrent_positions: usize,

    /// Per-position cap as percent of total budget
    pub max_position_size_percent: Decimal,

    /// Tradable universe
    pub instruments: Vec<String>,

    /// Timeframes fed to the signal aggregator
    pub timeframes: Vec<Timeframe>,

    pub execution_mode: ExecutionMode,

    /// Leverage clamp; `None` picks the mode default
    pub min_leverage: Option<u32>,
    pub max_leverage: Option<u32>,

    /// Whether open positions may be reversed
    pub allow_reverse_positions: bool,

    /// Flat instruments are only scanned while more than this is available
    pub min_budget_to_scan: Decimal,

    /// Entry decisions below this confidence are treated as HOLD
    pub min_entry_confidence: u8,

    /// Optional local exit thresholds; none by default
    pub close_policy: Option<ClosePolicy>,

    /// Number of closed trades kept in history
    pub history_retention: usize,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            total_budget: dec!(500),              // $500 managed capital
            max_concurrent_positions: 4,
            max_position_size_percent: dec!(10),  // $50 cap at default budget
            instruments: vec![
                "BNBUSDT".to_string(),
                "SOLUSDT".to_string(),
                "AVAXUSDT".to_string(),
            ],
            timeframes: vec![Timeframe::M15, Timeframe::H1, Timeframe::H4],
            execution_mode: ExecutionMode::ManualClose,
            min_leverage: None,
            max_leverage: None,
            allow_reverse_positions: true,
            min_budget_to_scan: dec!(100),
            min_entry_confidence: 0,
            close_policy: None,
            history_retention: 200,
        }
    }
}

impl TradingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.total_budget <= Decimal::ZERO {
            anyhow::bail!("total_budget must be positive");
        }
        if self.max_concurrent_positions == 0 {
            anyhow::bail!("max_concurrent_positions must be at least 1");
        }
        if self.max_position_size_percent <= Decimal::ZERO
            || self.max_position_size_percent > dec!(100)
        {
            anyhow::bail!("max_position_size_percent must be in (0, 100]");
        }
        if self.instruments.is_empty() {
            anyhow::bail!("at least one instrument is required");
        }
        if self.timeframes.is_empty() {
            anyhow::bail!("at least one timeframe is required");
        }
        let (lo, hi) = self.leverage_range();
        if lo == 0 || lo > hi {
            anyhow::bail!("invalid leverage range [{}, {}]", lo, hi);
        }
        Ok(())
    }

    /// Inclusive leverage bounds for the active execution mode.
    pub fn leverage_range(&self) -> (u32, u32) {
        let (lo, hi) = match self.execution_mode {
            ExecutionMode::ManualClose => (5, 10),
            ExecutionMode::StopTarget => (5, 20),
        };
        (self.min_leverage.unwrap_or(lo), self.max_leverage.unwrap_or(hi))
    }

    /// Per-position cap in USD.
    pub fn max_position_size(&self) -> Decimal {
        self.total_budget * self.max_position_size_percent / dec!(100)
    }
}

/// Remote decision oracle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub entry_max_tokens: u32,
    pub close_max_tokens: u32,
    pub entry_timeout_secs: u64,
    pub close_timeout_secs: u64,

    /// Total attempts per decision, including the first
    pub max_attempts: u32,
    pub retry_delay_secs: u64,

    /// Sent as HTTP-Referer / X-Title
    pub referer: String,
    pub title: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "deepseek/deepseek-chat-v3.1".to_string(),
            temperature: 0.3,
            entry_max_tokens: 800,
            close_max_tokens: 600,
            entry_timeout_secs: 60,
            close_timeout_secs: 45,
            max_attempts: 3,
            retry_delay_secs: 2,
            referer: "https://github.com/ai-futures-trader".to_string(),
            title: "AI Futures Trader".to_string(),
        }
    }
}

impl OracleConfig {
    pub fn entry_timeout(&self) -> Duration {
        Duration::from_secs(self.entry_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Apply `ORACLE_MODEL` / `ORACLE_URL` overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var("ORACLE_MODEL") {
            self.model = model;
        }
        if let Ok(url) = std::env::var("ORACLE_URL") {
            self.base_url = url;
        }
        self
    }
}

/// Full file layout accepted by `--config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub trading: TradingConfig,
    pub oracle: OracleConfig,
    /// Monitor tick interval in seconds
    pub monitor_interval_secs: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.trading.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TradingConfig::default();
        assert_eq!(config.max_position_size(), dec!(50));
        assert_eq!(config.leverage_range(), (5, 10));
        assert!(config.close_policy.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stop_target_leverage_range() {
        let config = TradingConfig {
            execution_mode: ExecutionMode::StopTarget,
            ..Default::default()
        };
        assert_eq!(config.leverage_range(), (5, 20));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let raw = r#"{
            "trading": {
                "total_budget": "1000",
                "close_policy": { "take_profit_pct": "8", "stop_loss_pct": "10", "max_hold_minutes": 120 }
            },
            "oracle": { "max_attempts": 5 }
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.trading.total_budget, dec!(1000));
        assert_eq!(config.trading.max_concurrent_positions, 4);
        assert_eq!(config.trading.close_policy.unwrap().max_hold_minutes, Some(120));
        assert_eq!(config.oracle.max_attempts, 5);
        assert_eq!(config.oracle.model, "deepseek/deepseek-chat-v3.1");
    }

    #[test]
    fn test_rejects_bad_limits() {
        let config = TradingConfig {
            max_concurrent_positions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
