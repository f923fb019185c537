//! Simulated exchange against an in-memory price feed.
//!
//! Orders fill instantly at the last known price. Positions are netted
//! per symbol so reduce-only and disappearance checks behave like the
//! live venue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Exchange, ExchangeError, LivePosition, OrderAck, OrderSide};
use crate::models::{Direction, Position};
use crate::signals::CandleFeed;

/// Seed prices used until the feed delivers real quotes.
const REFERENCE_PRICES: [(&str, Decimal); 6] = [
    ("BTCUSDT", dec!(45000)),
    ("ETHUSDT", dec!(2500)),
    ("BNBUSDT", dec!(300)),
    ("SOLUSDT", dec!(180)),
    ("DOGEUSDT", dec!(0.12)),
    ("AVAXUSDT", dec!(35)),
];

const DEFAULT_QUANTITY_PRECISION: u32 = 3;

#[derive(Debug, Clone)]
struct PaperStop {
    direction: Direction,
    stop_price: Decimal,
    target_price: Decimal,
}

#[derive(Default)]
struct PaperBook {
    prices: HashMap<String, Decimal>,
    positions: HashMap<String, LivePosition>,
    protective: HashMap<String, PaperStop>,
}

/// Paper trading venue.
pub struct PaperExchange {
    book: RwLock<PaperBook>,
    /// Optional public quote source used to refresh prices
    feed: Option<Arc<dyn CandleFeed>>,
}

impl PaperExchange {
    /// Exchange with reference prices only.
    pub fn new() -> Self {
        let prices = REFERENCE_PRICES
            .iter()
            .map(|(symbol, price)| (symbol.to_string(), *price))
            .collect();
        Self {
            book: RwLock::new(PaperBook {
                prices,
                ..Default::default()
            }),
            feed: None,
        }
    }

    /// Refresh prices from a public market-data feed when reachable.
    pub fn with_feed(feed: Arc<dyn CandleFeed>) -> Self {
        Self {
            feed: Some(feed),
            ..Self::new()
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.book.write().await.prices.insert(symbol.to_string(), price);
    }

    /// Re-create exchange-side state for a position restored from disk.
    pub async fn restore_position(&self, position: &Position) {
        let mut book = self.book.write().await;
        book.positions.insert(
            position.instrument.clone(),
            LivePosition {
                symbol: position.instrument.clone(),
                direction: position.direction,
                quantity: position.quantity,
                entry_price: position.entry_price,
            },
        );
        if let (true, Some(stop), Some(target)) =
            (position.has_stop_target, position.stop_price, position.target_price)
        {
            book.protective.insert(
                position.instrument.clone(),
                PaperStop {
                    direction: position.direction,
                    stop_price: stop,
                    target_price: target,
                },
            );
        }
    }

    /// Drop a position as if it were liquidated or closed elsewhere.
    #[cfg(test)]
    pub async fn force_flat(&self, symbol: &str) {
        let mut book = self.book.write().await;
        book.positions.remove(symbol);
        book.protective.remove(symbol);
    }

    async fn refresh_price(&self, symbol: &str) {
        let Some(feed) = &self.feed else {
            return;
        };
        match feed.ticker_price(symbol).await {
            Ok(price) if price > Decimal::ZERO => {
                self.set_price(symbol, price).await;
            }
            Ok(price) => warn!(symbol = %symbol, price = %price, "Ignoring non-positive quote"),
            Err(e) => debug!(symbol = %symbol, error = %e, "Quote refresh failed, using last price"),
        }
    }

    /// Fire paper stop/target orders crossed by the current price.
    async fn trigger_protective(&self, symbol: &str, price: Decimal) {
        let mut book = self.book.write().await;
        let Some(stop) = book.protective.get(symbol).cloned() else {
            return;
        };
        let crossed = match stop.direction {
            Direction::Long => price <= stop.stop_price || price >= stop.target_price,
            Direction::Short => price >= stop.stop_price || price <= stop.target_price,
        };
        if crossed {
            info!(symbol = %symbol, price = %price, "[PAPER] Protective order triggered");
            book.positions.remove(symbol);
            book.protective.remove(symbol);
        }
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    fn is_live(&self) -> bool {
        false
    }

    fn quantity_precision(&self, _symbol: &str) -> u32 {
        DEFAULT_QUANTITY_PRECISION
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!("invalid quantity {}", quantity)));
        }

        let mut book = self.book.write().await;
        let price = *book
            .prices
            .get(symbol)
            .ok_or_else(|| ExchangeError::NoPrice(symbol.to_string()))?;

        let existing = book.positions.get(symbol).cloned();
        match (existing, reduce_only) {
            (Some(pos), true) => {
                if side != OrderSide::closing(pos.direction) {
                    return Err(ExchangeError::Rejected("reduce-only order would increase position".into()));
                }
                let remaining = pos.quantity - quantity;
                if remaining <= Decimal::ZERO {
                    book.positions.remove(symbol);
                    book.protective.remove(symbol);
                } else if let Some(p) = book.positions.get_mut(symbol) {
                    p.quantity = remaining;
                }
            }
            (None, true) => {
                return Err(ExchangeError::Rejected("reduce-only order with no position".into()));
            }
            (Some(pos), false) if side == OrderSide::opening(pos.direction) => {
                let total = pos.quantity + quantity;
                let avg = (pos.entry_price * pos.quantity + price * quantity) / total;
                if let Some(p) = book.positions.get_mut(symbol) {
                    p.quantity = total;
                    p.entry_price = avg;
                }
            }
            (Some(_), false) => {
                return Err(ExchangeError::Rejected("paper venue does not net opposite orders".into()));
            }
            (None, false) => {
                let direction = match side {
                    OrderSide::Buy => Direction::Long,
                    OrderSide::Sell => Direction::Short,
                };
                book.positions.insert(
                    symbol.to_string(),
                    LivePosition {
                        symbol: symbol.to_string(),
                        direction,
                        quantity,
                        entry_price: price,
                    },
                );
            }
        }

        let order_id = uuid::Uuid::new_v4().to_string();
        info!(
            symbol = %symbol,
            side = side.as_str(),
            quantity = %quantity,
            price = %price,
            reduce_only = reduce_only,
            order_id = %order_id,
            "[PAPER] Market order filled"
        );

        Ok(OrderAck {
            order_id,
            avg_price: Some(price),
            executed_qty: quantity,
        })
    }

    async fn place_protective_orders(
        &self,
        symbol: &str,
        direction: Direction,
        _quantity: Decimal,
        stop_price: Decimal,
        target_price: Decimal,
    ) -> Result<(), ExchangeError> {
        let mut book = self.book.write().await;
        if !book.positions.contains_key(symbol) {
            return Err(ExchangeError::Rejected("no position to protect".into()));
        }
        book.protective.insert(
            symbol.to_string(),
            PaperStop {
                direction,
                stop_price,
                target_price,
            },
        );
        Ok(())
    }

    async fn cancel_reduce_only_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        // Paper protection is one stop plus one target
        match self.book.write().await.protective.remove(symbol) {
            Some(_) => Ok(2),
            None => Ok(0),
        }
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.refresh_price(symbol).await;
        let price = *self
            .book
            .write()
            .await
            .prices
            .entry(symbol.to_string())
            .or_insert(dec!(100));
        self.trigger_protective(symbol, price).await;
        Ok(price)
    }

    async fn live_position(&self, symbol: &str) -> Result<Option<LivePosition>, ExchangeError> {
        Ok(self.book.read().await.positions.get(symbol).cloned())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        debug!(symbol = %symbol, leverage = leverage, "[PAPER] Leverage set");
        Ok(())
    }
}
