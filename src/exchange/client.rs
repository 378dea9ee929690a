//! Binance USDⓈ-M Futures REST client.

use super::traits::{ExchangeGateway, GatewayError, GatewayResult};
use super::types::*;
use crate::config::BinanceConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const RECV_WINDOW_MS: u64 = 5_000;

/// Binance futures client implementing [`ExchangeGateway`].
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    /// Exchange metadata is static; positions and orders are never cached.
    filters: RwLock<HashMap<String, SymbolFilters>>,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(config: &BinanceConfig) -> Result<Self> {
        let base_url = if config.testnet {
            FUTURES_TESTNET_URL
        } else {
            FUTURES_BASE_URL
        };
        Self::with_base_url(config, base_url)
    }

    /// Create a client against an explicit base URL (testnets, proxies, fixtures).
    pub fn with_base_url(config: &BinanceConfig, base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            filters: RwLock::new(HashMap::new()),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> GatewayResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| GatewayError::Configuration(format!("invalid secret key: {e}")))?;
        mac.update(query_string.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Turn a response into `T`, classifying HTTP and Binance error codes.
    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> GatewayResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(GatewayError::from);
        }

        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::IM_A_TEAPOT
            || status.is_server_error()
        {
            warn!(%status, "Binance request throttled or failed upstream");
            return Err(GatewayError::Transient(format!("HTTP {status}: {body}")));
        }

        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(err) => Err(GatewayError::from_api_code(err.code, err.msg)),
            Err(_) => Err(GatewayError::Rejected {
                code: i64::from(status.as_u16()),
                msg: body,
            }),
        }
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> GatewayResult<T> {
        let mut url = format!("{}{}", self.base_url, path);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&Self::encode_query(params));
        }

        let response = self.http.get(&url).send().await?;
        Self::decode(response).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> GatewayResult<T> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Self::timestamp().to_string()));

        let query = Self::encode_query(&params);
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        Self::decode(response).await
    }

    fn order_params(order: &NewOrder) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", order.order_type.as_str().to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];

        if let Some(qty) = order.quantity {
            params.push(("quantity", qty.to_string()));
        }
        if let Some(price) = order.price {
            params.push(("price", price.to_string()));
        }
        if let Some(stop_price) = order.stop_price {
            params.push(("stopPrice", stop_price.to_string()));
        }
        if let Some(tif) = order.time_in_force {
            params.push(("timeInForce", tif.as_str().to_string()));
        }
        if let Some(reduce_only) = order.reduce_only {
            params.push(("reduceOnly", reduce_only.to_string()));
        }
        if let Some(close_position) = order.close_position {
            params.push(("closePosition", close_position.to_string()));
        }
        if let Some(working_type) = order.working_type {
            params.push(("workingType", working_type.as_str().to_string()));
        }
        if let Some(client_id) = &order.new_client_order_id {
            params.push(("newClientOrderId", client_id.clone()));
        }

        params
    }

    /// Fetch exchange info and refresh the filter cache.
    async fn refresh_filters(&self) -> GatewayResult<()> {
        let info: FuturesExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;

        let mut cache = self.filters.write().await;
        for symbol in &info.symbols {
            if let Some(filters) = symbol.filters() {
                cache.insert(symbol.symbol.clone(), filters);
            }
        }
        debug!(symbols = cache.len(), "Symbol filters cached");
        Ok(())
    }
}

#[async_trait]
impl ExchangeGateway for BinanceClient {
    // ==================== Account (Authenticated) ====================

    #[instrument(skip(self))]
    async fn get_positions(&self) -> GatewayResult<Vec<Position>> {
        self.signed(Method::GET, "/fapi/v2/positionRisk", vec![]).await
    }

    #[instrument(skip(self))]
    async fn get_balances(&self) -> GatewayResult<Vec<AccountBalance>> {
        self.signed(Method::GET, "/fapi/v2/balance", vec![]).await
    }

    #[instrument(skip(self))]
    async fn set_leverage(&self, symbol: &str, leverage: u8) -> GatewayResult<()> {
        let _: serde_json::Value = self
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                vec![("symbol", symbol.to_string()), ("leverage", leverage.to_string())],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_margin_mode(&self, symbol: &str, margin_type: MarginType) -> GatewayResult<()> {
        let _: serde_json::Value = self
            .signed(
                Method::POST,
                "/fapi/v1/marginType",
                vec![
                    ("symbol", symbol.to_string()),
                    ("marginType", margin_type.as_api_str().to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    // ==================== Orders (Authenticated) ====================

    #[instrument(skip(self))]
    async fn get_open_orders(&self, symbol: Option<&str>) -> GatewayResult<Vec<Order>> {
        let params = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        self.signed(Method::GET, "/fapi/v1/openOrders", params).await
    }

    #[instrument(skip(self), fields(symbol = %order.symbol))]
    async fn place_order(&self, order: &NewOrder) -> GatewayResult<Order> {
        debug!("Placing futures order: {:?}", order);
        self.signed(Method::POST, "/fapi/v1/order", Self::order_params(order))
            .await
    }

    #[instrument(skip(self))]
    async fn get_order(&self, symbol: &str, order_id: i64) -> GatewayResult<Order> {
        self.signed(
            Method::GET,
            "/fapi/v1/order",
            vec![("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
        )
        .await
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> GatewayResult<()> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/order",
                vec![("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_all(&self, symbol: &str) -> GatewayResult<()> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        Ok(())
    }

    // ==================== Market Data (Public) ====================

    #[instrument(skip(self))]
    async fn get_symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters> {
        if let Some(filters) = self.filters.read().await.get(symbol) {
            return Ok(*filters);
        }

        self.refresh_filters().await?;

        self.filters
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Configuration(format!("no usable filters for {symbol}")))
    }

    #[instrument(skip(self))]
    async fn get_mark_price(&self, symbol: &str) -> GatewayResult<Decimal> {
        let index: PremiumIndex = self
            .public_get("/fapi/v1/premiumIndex", &[("symbol", symbol.to_string())])
            .await?;
        Ok(index.mark_price)
    }

    #[instrument(skip(self))]
    async fn get_funding_rate(&self, symbol: &str) -> GatewayResult<Decimal> {
        let history: Vec<FundingRateEntry> = self
            .public_get(
                "/fapi/v1/fundingRate",
                &[("symbol", symbol.to_string()), ("limit", "1".to_string())],
            )
            .await?;

        history
            .last()
            .map(|entry| entry.funding_rate)
            .ok_or_else(|| GatewayError::Configuration(format!("no funding history for {symbol}")))
    }

    #[instrument(skip(self))]
    async fn get_book_ticker(&self, symbol: &str) -> GatewayResult<BookTicker> {
        self.public_get("/fapi/v1/ticker/bookTicker", &[("symbol", symbol.to_string())])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tokio_test::assert_ok;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> BinanceConfig {
        BinanceConfig {
            api_key: "test-key".to_string(),
            secret_key: "test-secret".to_string(),
            testnet: true,
        }
    }

    async fn client_for(server: &MockServer) -> BinanceClient {
        BinanceClient::with_base_url(&test_config(), server.uri()).unwrap()
    }

    fn exchange_info() -> serde_json::Value {
        json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "status": "TRADING",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "1", "maxPrice": "1000000"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000"},
                    {"filterType": "MARKET_LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "120"}
                ]
            }]
        })
    }

    #[tokio::test]
    async fn test_get_positions_signed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .and(header("X-MBX-APIKEY", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "symbol": "BTCUSDT",
                    "positionAmt": "-0.010",
                    "entryPrice": "60000.0",
                    "markPrice": "59900.0",
                    "unRealizedProfit": "1.00",
                    "leverage": "7"
                }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let positions = client.get_positions().await.unwrap();

        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].position_amt, dec!(-0.010));
        assert_eq!(positions[0].side(), Some(OrderSide::Sell));
    }

    #[tokio::test]
    async fn test_margin_type_unchanged_is_already_in_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/marginType"))
            .and(query_param("marginType", "ISOLATED"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": -4046,
                "msg": "No need to change margin type."
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .set_margin_mode("BTCUSDT", MarginType::Isolated)
            .await
            .unwrap_err();
        assert!(err.is_already_in_state());
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/leverage"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "code": -1003,
                "msg": "Too many requests."
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.set_leverage("BTCUSDT", 7).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_symbol_filters_are_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/exchangeInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(exchange_info()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let first = client.get_symbol_filters("BTCUSDT").await.unwrap();
        let second = client.get_symbol_filters("BTCUSDT").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.max_qty, dec!(120));
        assert_eq!(first.price_tick, dec!(0.10));
    }

    #[tokio::test]
    async fn test_unknown_symbol_filters_is_configuration_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/exchangeInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(exchange_info()))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.get_symbol_filters("NOPEUSDT").await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_place_post_only_order_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .and(query_param("timeInForce", "GTX"))
            .and(query_param("type", "LIMIT"))
            .and(query_param("newClientOrderId", "btr-BTCUSDT-entry-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "orderId": 42,
                "symbol": "BTCUSDT",
                "status": "NEW",
                "clientOrderId": "btr-BTCUSDT-entry-1",
                "price": "59990.0",
                "avgPrice": "0.00",
                "origQty": "0.010",
                "executedQty": "0",
                "stopPrice": "0",
                "side": "BUY",
                "type": "LIMIT",
                "reduceOnly": false,
                "closePosition": false,
                "timeInForce": "GTX",
                "updateTime": 1700000000000i64
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let order = NewOrder::post_only_limit("BTCUSDT", OrderSide::Buy, dec!(0.010), dec!(59990.0))
            .with_client_id("btr-BTCUSDT-entry-1");
        let placed = client.place_order(&order).await.unwrap();

        assert_eq!(placed.order_id, 42);
        assert_eq!(placed.status, OrderStatus::New);
    }

    #[tokio::test]
    async fn test_post_only_cross_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": -5022,
                "msg": "Due to the order could not be executed as maker, the Post Only order will be rejected."
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let order = NewOrder::post_only_limit("BTCUSDT", OrderSide::Buy, dec!(0.010), dec!(60100));
        let err = client.place_order(&order).await.unwrap_err();

        assert!(matches!(err, GatewayError::Rejected { code: -5022, .. }));
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": -2011,
                "msg": "Unknown order sent."
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.cancel_order("BTCUSDT", 7).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_market_data_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/premiumIndex"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "symbol": "BTCUSDT",
                "markPrice": "60000.5",
                "indexPrice": "60001.0",
                "lastFundingRate": "0.00010000",
                "nextFundingTime": 1700006400000i64
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/fundingRate"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "BTCUSDT", "fundingRate": "0.00025", "fundingTime": 1700000000000i64, "markPrice": "60000"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/ticker/bookTicker"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "symbol": "BTCUSDT",
                "bidPrice": "59999.9",
                "bidQty": "3.2",
                "askPrice": "60000.1",
                "askQty": "1.5",
                "time": 1700000000000i64
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(client.get_mark_price("BTCUSDT").await.unwrap(), dec!(60000.5));
        assert_eq!(client.get_funding_rate("BTCUSDT").await.unwrap(), dec!(0.00025));

        let book = assert_ok!(client.get_book_ticker("BTCUSDT").await);
        assert_eq!(book.mid(), dec!(60000.0));
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let client = BinanceClient::with_base_url(&test_config(), "http://localhost").unwrap();
        let signature = client.sign("symbol=BTCUSDT&timestamp=1").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
