//! USDⓈ-M futures REST client.
//!
//! Public market data (klines, ticker, exchange info) needs no credentials.
//! Trading endpoints are HMAC-SHA256 signed with the account secret.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::types::*;
use crate::exchange::{Exchange, ExchangeError, LivePosition, OrderAck, OrderSide};
use crate::models::{Candle, Direction, Timeframe};
use crate::signals::CandleFeed;

type HmacSha256 = Hmac<Sha256>;

const FUTURES_API_BASE: &str = "https://fapi.binance.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_WINDOW_MS: u64 = 5000;
const DEFAULT_QUANTITY_PRECISION: u32 = 3;
/// "No need to change margin type."
const MARGIN_TYPE_UNCHANGED: i64 = -4046;

struct Credentials {
    api_key: String,
    secret: String,
}

/// Futures exchange client used both as a market-data feed and as the live venue.
pub struct BinanceClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    precision: RwLock<HashMap<String, u32>>,
}

impl BinanceClient {
    /// Client for public endpoints only.
    pub fn public() -> anyhow::Result<Self> {
        Self::build(FUTURES_API_BASE.to_string(), None)
    }

    /// Authenticated client from `BINANCE_API_KEY` / `BINANCE_SECRET_KEY`.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY not set")?;
        let secret = std::env::var("BINANCE_SECRET_KEY").context("BINANCE_SECRET_KEY not set")?;
        if api_key.trim().is_empty() || secret.trim().is_empty() {
            anyhow::bail!("Binance credentials are empty");
        }
        Self::build(
            FUTURES_API_BASE.to_string(),
            Some(Credentials { api_key, secret }),
        )
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String, credentials: Option<(String, String)>) -> anyhow::Result<Self> {
        Self::build(
            base_url,
            credentials.map(|(api_key, secret)| Credentials { api_key, secret }),
        )
    }

    fn build(base_url: String, credentials: Option<Credentials>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            credentials,
            precision: RwLock::new(HashMap::new()),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    // ==================== Setup ====================

    /// Load quantity precision for `symbols` from exchange info.
    pub async fn load_precision(&self, symbols: &[String]) -> Result<(), ExchangeError> {
        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;

        let mut loaded = 0;
        if let Ok(mut map) = self.precision.write() {
            for symbol in info.symbols.iter().filter(|s| symbols.contains(&s.symbol)) {
                if let Some(decimals) = symbol.lot_precision() {
                    map.insert(symbol.symbol.clone(), decimals);
                    loaded += 1;
                }
            }
        }
        info!(symbols = loaded, "Quantity precision loaded");
        Ok(())
    }

    /// Default leverage and isolated margin for each instrument. Failures are logged only.
    pub async fn prepare_symbols(&self, symbols: &[String], leverage: u32) {
        for symbol in symbols {
            if let Err(e) = self.set_leverage(symbol, leverage).await {
                warn!(symbol = %symbol, error = %e, "Failed to set leverage");
            }
            if let Err(e) = self.set_isolated_margin(symbol).await {
                warn!(symbol = %symbol, error = %e, "Failed to set margin type");
            }
        }
    }

    async fn set_isolated_margin(&self, symbol: &str) -> Result<(), ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("marginType", "ISOLATED".to_string())];
        match self.signed::<serde_json::Value>(Method::POST, "/fapi/v1/marginType", &params).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::Rejected(body)) if body.contains(&MARGIN_TYPE_UNCHANGED.to_string()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ==================== Transport ====================

    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::MissingCredentials("BINANCE_API_KEY".to_string()))?;
        let mut mac = HmacSha256::new_from_slice(creds.secret.as_bytes())
            .map_err(|e| ExchangeError::MissingCredentials(e.to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let api_key = match &self.credentials {
            Some(creds) => creds.api_key.clone(),
            None => return Err(ExchangeError::MissingCredentials("BINANCE_API_KEY".to_string())),
        };

        let mut query = encode_query(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            RECV_WINDOW_MS,
            Utc::now().timestamp_millis()
        ));
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        debug!(method = %method, path = %path, "Signed request");
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .map_err(map_transport)?;

        read_json(response).await
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let query = encode_query(params);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let response = self.client.get(&url).send().await.map_err(map_transport)?;
        read_json(response).await
    }
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn map_transport(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Timeout(DEFAULT_TIMEOUT)
    } else {
        ExchangeError::Transport(e.to_string())
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ExchangeError> {
    let status = response.status();
    let body = response.text().await.map_err(map_transport)?;

    if !status.is_success() {
        let detail = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|e| format!("{} {}", e.code, e.msg))
            .unwrap_or(body);
        if status.is_server_error() {
            return Err(ExchangeError::Transport(format!("{} - {}", status, detail)));
        }
        return Err(ExchangeError::Rejected(format!("{} - {}", status, detail)));
    }

    serde_json::from_str(&body).map_err(|e| ExchangeError::Malformed(e.to_string()))
}

fn parse_kline(row: &[serde_json::Value]) -> Option<Candle> {
    let num = |i: usize| -> Option<f64> {
        match row.get(i)? {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };
    Some(Candle {
        open_time: row.first()?.as_i64()?,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}

#[async_trait]
impl CandleFeed for BinanceClient {
    async fn candles(&self, symbol: &str, timeframe: Timeframe, limit: u32) -> anyhow::Result<Vec<Candle>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", timeframe.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<Vec<serde_json::Value>> = self.public_get("/fapi/v1/klines", &params).await?;

        let candles: Vec<Candle> = rows.iter().filter_map(|row| parse_kline(row)).collect();
        if candles.len() != rows.len() {
            warn!(symbol = %symbol, skipped = rows.len() - candles.len(), "Skipped malformed klines");
        }
        Ok(candles)
    }

    async fn ticker_price(&self, symbol: &str) -> anyhow::Result<Decimal> {
        let ticker: TickerPrice = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        Ok(ticker.price)
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    fn name(&self) -> &str {
        "binance-futures"
    }

    fn is_live(&self) -> bool {
        self.has_credentials()
    }

    fn quantity_precision(&self, symbol: &str) -> u32 {
        self.precision
            .read()
            .ok()
            .and_then(|map| map.get(symbol).copied())
            .unwrap_or(DEFAULT_QUANTITY_PRECISION)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newOrderRespType", "RESULT".to_string()),
            ("newClientOrderId", uuid::Uuid::new_v4().simple().to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let resp: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        info!(
            symbol = %symbol,
            side = side.as_str(),
            quantity = %quantity,
            order_id = resp.order_id,
            client_order_id = %resp.client_order_id,
            status = %resp.status,
            avg_price = %resp.avg_price,
            "Market order placed"
        );

        Ok(OrderAck {
            order_id: resp.order_id.to_string(),
            avg_price: (resp.avg_price > Decimal::ZERO).then_some(resp.avg_price),
            executed_qty: resp.executed_qty,
        })
    }

    async fn place_protective_orders(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: Decimal,
        stop_price: Decimal,
        target_price: Decimal,
    ) -> Result<(), ExchangeError> {
        let side = OrderSide::closing(direction);
        for (order_type, trigger) in [("STOP_MARKET", stop_price), ("TAKE_PROFIT_MARKET", target_price)] {
            let params = [
                ("symbol", symbol.to_string()),
                ("side", side.as_str().to_string()),
                ("type", order_type.to_string()),
                ("stopPrice", trigger.normalize().to_string()),
                ("quantity", quantity.normalize().to_string()),
                ("reduceOnly", "true".to_string()),
            ];
            let resp: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
            info!(symbol = %symbol, order_type = order_type, trigger = %trigger, order_id = resp.order_id, "Protective order placed");
        }
        Ok(())
    }

    async fn cancel_reduce_only_orders(&self, symbol: &str) -> Result<usize, ExchangeError> {
        let orders: Vec<OpenOrder> = self
            .signed(Method::GET, "/fapi/v1/openOrders", &[("symbol", symbol.to_string())])
            .await?;

        let mut cancelled = 0;
        for order in orders.iter().filter(|o| o.reduce_only || o.close_position) {
            let params = [("symbol", order.symbol.clone()), ("orderId", order.order_id.to_string())];
            self.signed::<serde_json::Value>(Method::DELETE, "/fapi/v1/order", &params)
                .await?;
            debug!(symbol = %symbol, order_id = order.order_id, order_type = %order.order_type, "Cancelled reduce-only order");
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let ticker: TickerPrice = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        if ticker.price <= Decimal::ZERO {
            return Err(ExchangeError::NoPrice(ticker.symbol));
        }
        Ok(ticker.price)
    }

    async fn live_position(&self, symbol: &str) -> Result<Option<LivePosition>, ExchangeError> {
        let risks: Vec<PositionRisk> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", &[("symbol", symbol.to_string())])
            .await?;

        Ok(risks
            .into_iter()
            .find(|r| r.symbol == symbol && !r.position_amt.is_zero())
            .map(|r| LivePosition {
                symbol: r.symbol,
                direction: if r.position_amt > Decimal::ZERO {
                    Direction::Long
                } else {
                    Direction::Short
                },
                quantity: r.position_amt.abs(),
                entry_price: r.entry_price,
            }))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("leverage", leverage.to_string())];
        self.signed::<serde_json::Value>(Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        debug!(symbol = %symbol, leverage = leverage, "Leverage set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn signed_client(server: &MockServer) -> BinanceClient {
        BinanceClient::with_base_url(server.uri(), Some(("key".to_string(), "secret".to_string()))).unwrap()
    }

    #[test]
    fn test_signature_matches_reference_vector() {
        let client = BinanceClient::with_base_url(
            "http://localhost".to_string(),
            Some((
                "key".to_string(),
                "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j".to_string(),
            )),
        )
        .unwrap();
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";

        assert_eq!(
            client.sign(query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[tokio::test]
    async fn test_klines_parsed_oldest_first() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/klines"))
            .and(query_param("interval", "1h"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                [1700000000000i64, "100.0", "101.0", "99.0", "100.5", "1200.0", 1700003599999i64],
                [1700003600000i64, "100.5", "103.0", "100.0", "102.0", "1500.0", 1700007199999i64]
            ])))
            .mount(&mock_server)
            .await;

        let client = BinanceClient::with_base_url(mock_server.uri(), None).unwrap();
        let candles = client.candles("SOLUSDT", Timeframe::H1, 2).await.unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 102.0);
        assert_eq!(candles[0].open_time, 1700000000000);
    }

    #[tokio::test]
    async fn test_market_order_is_signed() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .and(header("X-MBX-APIKEY", "key"))
            .and(query_param("reduceOnly", "true"))
            .and(query_param("quantity", "4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderId": 7,
                "status": "FILLED",
                "avgPrice": "110.00",
                "executedQty": "4"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let ack = signed_client(&mock_server)
            .place_market_order("SOLUSDT", OrderSide::Sell, dec!(4.000), true)
            .await
            .unwrap();

        assert_eq!(ack.order_id, "7");
        assert_eq!(ack.avg_price, Some(dec!(110)));
    }

    #[tokio::test]
    async fn test_rejected_order_maps_to_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -2019,
                "msg": "Margin is insufficient."
            })))
            .mount(&mock_server)
            .await;

        let result = signed_client(&mock_server)
            .place_market_order("SOLUSDT", OrderSide::Buy, dec!(1), false)
            .await;

        match result {
            Err(ExchangeError::Rejected(msg)) => assert!(msg.contains("-2019")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trading_without_credentials_fails() {
        let client = BinanceClient::with_base_url("http://127.0.0.1:9".to_string(), None).unwrap();
        let result = client.set_leverage("SOLUSDT", 5).await;
        assert!(matches!(result, Err(ExchangeError::MissingCredentials(_))));
        assert!(!client.is_live());
    }

    #[tokio::test]
    async fn test_live_position_short() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"symbol": "BNBUSDT", "positionAmt": "-0.50", "entryPrice": "300.0"}
            ])))
            .mount(&mock_server)
            .await;

        let client = signed_client(&mock_server);
        let live = client.live_position("BNBUSDT").await.unwrap().unwrap();
        assert_eq!(live.direction, Direction::Short);
        assert_eq!(live.quantity, dec!(0.5));

        assert!(client.live_position("SOLUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_only_reduce_only_orders() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/openOrders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"orderId": 1, "symbol": "SOLUSDT", "reduceOnly": true, "type": "STOP_MARKET"},
                {"orderId": 2, "symbol": "SOLUSDT", "reduceOnly": false, "type": "LIMIT"}
            ])))
            .mount(&mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/fapi/v1/order"))
            .and(query_param("orderId", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"orderId": 1})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let cancelled = signed_client(&mock_server)
            .cancel_reduce_only_orders("SOLUSDT")
            .await
            .unwrap();
        assert_eq!(cancelled, 1);
    }

    #[tokio::test]
    async fn test_load_precision() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/exchangeInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbols": [
                    {"symbol": "SOLUSDT", "filters": [{"filterType": "LOT_SIZE", "stepSize": "1"}]},
                    {"symbol": "BNBUSDT", "filters": [{"filterType": "LOT_SIZE", "stepSize": "0.01"}]}
                ]
            })))
            .mount(&mock_server)
            .await;

        let client = BinanceClient::with_base_url(mock_server.uri(), None).unwrap();
        client.load_precision(&["SOLUSDT".to_string()]).await.unwrap();

        assert_eq!(client.quantity_precision("SOLUSDT"), 0);
        assert_eq!(client.quantity_precision("BNBUSDT"), DEFAULT_QUANTITY_PRECISION);
    }
}
