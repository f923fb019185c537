//! Market data feeds and the signal-source capability.

pub mod aggregator;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use rust_decimal::Decimal;
use tracing::debug;

use crate::models::{Candle, SignalBundle, Timeframe};

/// Candles to request per timeframe; enough for the slow EMA and RSI warm-up
const CANDLE_LIMIT: u32 = 100;

/// Raw market data.
#[async_trait]
pub trait CandleFeed: Send + Sync {
    /// Candles oldest first.
    async fn candles(&self, symbol: &str, timeframe: Timeframe, limit: u32) -> Result<Vec<Candle>>;

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal>;
}

/// Produces the per-instrument signal bundle consumed by the oracle.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn signal_bundle(&self, instrument: &str) -> Result<SignalBundle>;
}

/// Signal source backed by a candle feed.
pub struct MarketSignalSource {
    feed: Arc<dyn CandleFeed>,
    timeframes: Vec<Timeframe>,
}

impl MarketSignalSource {
    pub fn new(feed: Arc<dyn CandleFeed>, timeframes: Vec<Timeframe>) -> Self {
        Self { feed, timeframes }
    }
}

#[async_trait]
impl SignalSource for MarketSignalSource {
    async fn signal_bundle(&self, instrument: &str) -> Result<SignalBundle> {
        let fetches = self.timeframes.iter().map(|tf| {
            let feed = self.feed.clone();
            async move {
                let candles = feed
                    .candles(instrument, *tf, CANDLE_LIMIT)
                    .await
                    .with_context(|| format!("Failed to fetch {} candles for {}", tf, instrument))?;
                Ok::<_, anyhow::Error>((*tf, candles))
            }
        });
        let series = try_join_all(fetches).await?;

        let price = self
            .feed
            .ticker_price(instrument)
            .await
            .with_context(|| format!("Failed to fetch price for {}", instrument))?;

        debug!(instrument = %instrument, price = %price, timeframes = series.len(), "Signals fetched");
        Ok(aggregator::build_bundle(instrument, price, series))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrendAlignment;
    use rust_decimal_macros::dec;

    struct RampFeed;

    #[async_trait]
    impl CandleFeed for RampFeed {
        async fn candles(&self, _symbol: &str, timeframe: Timeframe, limit: u32) -> Result<Vec<Candle>> {
            if timeframe == Timeframe::D1 {
                anyhow::bail!("daily candles unavailable");
            }
            Ok((0..limit)
                .map(|i| {
                    let close = 100.0 + f64::from(i);
                    Candle {
                        open_time: i64::from(i),
                        open: close,
                        high: close + 1.0,
                        low: close - 1.0,
                        close,
                        volume: 5.0,
                    }
                })
                .collect())
        }

        async fn ticker_price(&self, _symbol: &str) -> Result<Decimal> {
            Ok(dec!(199))
        }
    }

    #[tokio::test]
    async fn test_bundle_from_feed() {
        let source = MarketSignalSource::new(
            Arc::new(RampFeed),
            vec![Timeframe::M15, Timeframe::H1, Timeframe::H4],
        );

        let bundle = source.signal_bundle("SOLUSDT").await.unwrap();

        assert_eq!(bundle.current_price, dec!(199));
        assert_eq!(bundle.timeframes.len(), 3);
        assert_eq!(bundle.alignment, TrendAlignment::Strong);
    }

    #[tokio::test]
    async fn test_feed_failure_propagates() {
        let source = MarketSignalSource::new(Arc::new(RampFeed), vec![Timeframe::H1, Timeframe::D1]);
        assert!(source.signal_bundle("SOLUSDT").await.is_err());
    }
}
