//! Exchange capability: the operations the coordinator needs, live or simulated.

mod paper;

pub use paper::PaperExchange;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Direction;

/// Order side at the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens a position in `direction`.
    pub fn opening(direction: Direction) -> Self {
        match direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Side that reduces a position in `direction`.
    pub fn closing(direction: Direction) -> Self {
        Self::opening(direction.opposite())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Exchange acknowledgement of a filled market order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    /// Average fill price when the exchange reports one
    pub avg_price: Option<Decimal>,
    pub executed_qty: Decimal,
}

/// Position as the exchange sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct LivePosition {
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response: {0}")]
    Malformed(String),

    #[error("No price available for {0}")]
    NoPrice(String),

    #[error("Credentials not configured: {0}")]
    MissingCredentials(String),
}

/// Trading operations against a futures venue.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Human-readable venue name for logs.
    fn name(&self) -> &str;

    /// True when orders move real money.
    fn is_live(&self) -> bool;

    /// Decimal places accepted for order quantities on `symbol`.
    fn quantity_precision(&self, symbol: &str) -> u32;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError>;

    /// Reduce-only stop and take-profit orders for stop-target mode.
    async fn place_protective_orders(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: Decimal,
        stop_price: Decimal,
        target_price: Decimal,
    ) -> Result<(), ExchangeError>;

    /// Cancel open reduce-only orders; returns how many were cancelled.
    async fn cancel_reduce_only_orders(&self, symbol: &str) -> Result<usize, ExchangeError>;

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    async fn live_position(&self, symbol: &str) -> Result<Option<LivePosition>, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;
}
