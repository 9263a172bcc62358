//! Bybit v5 REST implementation of `GridExchange` (USDT linear perpetuals)

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::errors::{GridError, GridResult};
use super::executor::GridExchange;
use super::types::{
    BookLevel, ExchangePosition, OrderAck, OrderBook, OrderRecord, OrderRequest, OrderSide,
    OrderType, PositionSide, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

pub const MAINNET_URL: &str = "https://api.bybit.com";
pub const TESTNET_URL: &str = "https://api-testnet.bybit.com";

const CATEGORY: &str = "linear";

/// set-leverage called with the leverage already in effect
const LEVERAGE_NOT_MODIFIED: i64 = 110043;
/// orderLinkId already used, i.e. an earlier attempt of this order landed
const DUPLICATE_ORDER_LINK_ID: i64 = 110072;

/// API key pair
#[derive(Clone)]
pub struct BybitCredentials {
    api_key: String,
    api_secret: String,
}

impl BybitCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Read `BYBIT_API_KEY` and `BYBIT_API_SECRET`
    pub fn from_env() -> GridResult<Self> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| GridError::Configuration(format!("{} is not set", name)))
        };
        Ok(Self::new(read("BYBIT_API_KEY")?, read("BYBIT_API_SECRET")?))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for BybitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Connection and retry settings for the Bybit client
#[derive(Debug, Clone)]
pub struct BybitConfig {
    pub base_url: String,
    pub recv_window_ms: u64,
    pub request_timeout_ms: u64,
    /// Attempts per request, including the first
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_requests_per_second: usize,
    /// Decimal places sent for order quantities
    pub qty_precision: usize,
    /// Decimal places sent for prices
    pub price_precision: usize,
    /// Account runs in hedge mode, so longs and shorts are separate positions
    /// (`positionIdx` 1 and 2). One-way mode nets them into one.
    pub hedge_mode: bool,
}

impl BybitConfig {
    pub fn new(testnet: bool) -> Self {
        Self {
            base_url: if testnet { TESTNET_URL } else { MAINNET_URL }.to_string(),
            recv_window_ms: 5_000,
            request_timeout_ms: 10_000,
            max_retries: 3,
            retry_base_delay_ms: 100,
            max_requests_per_second: 10,
            qty_precision: 3,
            price_precision: 2,
            hedge_mode: true,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_hedge_mode(mut self, hedge_mode: bool) -> Self {
        self.hedge_mode = hedge_mode;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay_ms: u64) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_base_delay_ms = base_delay_ms;
        self
    }
}

/// HMAC-SHA256 signature over `timestamp + api_key + recv_window + payload`,
/// where payload is the query string for GET and the JSON body for POST.
pub fn sign_request(
    secret: &str,
    timestamp: i64,
    api_key: &str,
    recv_window_ms: u64,
    payload: &str,
) -> GridResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GridError::Configuration(format!("invalid API secret: {}", e)))?;
    mac.update(format!("{}{}{}{}", timestamp, api_key, recv_window_ms, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerInfo {
    last_price: String,
    #[serde(default)]
    price24h_pcnt: String,
    #[serde(default)]
    volume24h: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionInfo {
    side: String,
    size: String,
    avg_price: String,
    #[serde(default)]
    unrealised_pnl: String,
    #[serde(default)]
    stop_loss: String,
    #[serde(default)]
    take_profit: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedOrder {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderInfo {
    order_id: String,
    side: String,
    qty: String,
    #[serde(default)]
    avg_price: String,
    order_status: String,
    created_time: String,
}

#[derive(Debug, Deserialize)]
struct BookSnapshot {
    #[serde(default)]
    b: Vec<[String; 2]>,
    #[serde(default)]
    a: Vec<[String; 2]>,
}

/// Unwrap `{retCode, retMsg, result}`; a non-zero code is a rejection
fn parse_envelope<T: DeserializeOwned>(body: &str) -> GridResult<T> {
    let envelope: Envelope = serde_json::from_str(body)?;
    if envelope.ret_code != 0 {
        return Err(GridError::OrderRejected {
            code: envelope.ret_code,
            message: envelope.ret_msg,
        });
    }
    Ok(serde_json::from_value(envelope.result)?)
}

/// Bybit sends numbers as strings; empty means zero
fn num(field: &str, value: &str) -> GridResult<f64> {
    if value.is_empty() {
        return Ok(0.0);
    }
    value
        .parse()
        .map_err(|_| GridError::JsonParse(format!("{} is not a number: {:?}", field, value)))
}

/// Optional price where "" and "0" both mean unset
fn opt_price(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| *v > 0.0)
}

fn ticker_from(info: TickerInfo) -> GridResult<Ticker> {
    Ok(Ticker {
        price: num("lastPrice", &info.last_price)?,
        change_24h_pct: num("price24hPcnt", &info.price24h_pcnt)? * 100.0,
        volume_24h: num("volume24h", &info.volume24h)?,
    })
}

/// Flat entries (empty side or zero size) are dropped
fn positions_from(list: Vec<PositionInfo>) -> GridResult<Vec<ExchangePosition>> {
    let mut positions = Vec::new();
    for info in list {
        let size = num("size", &info.size)?;
        if size <= 0.0 || info.side.is_empty() || info.side == "None" {
            continue;
        }
        positions.push(ExchangePosition {
            side: PositionSide::from(OrderSide::from(info.side.as_str())),
            size,
            entry_price: num("avgPrice", &info.avg_price)?,
            unrealized_pnl: num("unrealisedPnl", &info.unrealised_pnl)?,
            stop_loss: opt_price(&info.stop_loss),
            take_profit: opt_price(&info.take_profit),
        });
    }
    Ok(positions)
}

fn orders_from(list: Vec<OrderInfo>) -> GridResult<Vec<OrderRecord>> {
    list.into_iter()
        .map(|info| {
            let millis: i64 = info
                .created_time
                .parse()
                .map_err(|_| GridError::JsonParse(format!("bad createdTime {:?}", info.created_time)))?;
            let created_at = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| GridError::JsonParse(format!("createdTime out of range: {}", millis)))?;
            Ok(OrderRecord {
                order_id: info.order_id,
                side: OrderSide::from(info.side.as_str()),
                qty: num("qty", &info.qty)?,
                avg_price: num("avgPrice", &info.avg_price)?,
                status: info.order_status,
                created_at,
            })
        })
        .collect()
}

fn book_from(snapshot: BookSnapshot) -> GridResult<OrderBook> {
    let side = |rows: Vec<[String; 2]>| -> GridResult<Vec<BookLevel>> {
        rows.into_iter()
            .map(|[price, size]| {
                Ok(BookLevel {
                    price: num("price", &price)?,
                    size: num("size", &size)?,
                })
            })
            .collect()
    };
    Ok(OrderBook {
        bids: side(snapshot.b)?,
        asks: side(snapshot.a)?,
    })
}

// ============================================================================
// Client
// ============================================================================

/// Bybit v5 exchange client
pub struct BybitExchange {
    config: BybitConfig,
    credentials: BybitCredentials,
    client: reqwest::Client,
    request_times: Mutex<VecDeque<Instant>>,
}

impl BybitExchange {
    pub fn new(config: BybitConfig, credentials: BybitCredentials) -> GridResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| GridError::Configuration(format!("HTTP client: {}", e)))?;

        info!("Bybit client initialized ({})", config.base_url);

        Ok(Self {
            config,
            credentials,
            client,
            request_times: Mutex::new(VecDeque::new()),
        })
    }

    /// 0 in one-way mode; 1 (long) or 2 (short) in hedge mode
    fn position_idx(&self, order: &OrderRequest) -> u8 {
        if !self.config.hedge_mode {
            return 0;
        }
        match order.position_side() {
            PositionSide::Long => 1,
            PositionSide::Short => 2,
        }
    }

    /// Order payload for `/v5/order/create`
    fn order_body(&self, order: &OrderRequest, order_link_id: &str) -> Value {
        let qty_dp = self.config.qty_precision;
        let px_dp = self.config.price_precision;

        let mut body = json!({
            "category": CATEGORY,
            "symbol": order.symbol,
            "side": order.side.as_str(),
            "orderType": order.order_type.as_str(),
            "qty": format!("{:.*}", qty_dp, order.qty),
            "orderLinkId": order_link_id,
            "reduceOnly": order.reduce_only,
            "positionIdx": self.position_idx(order),
        });

        if let (OrderType::Limit, Some(price)) = (order.order_type, order.price) {
            body["price"] = json!(format!("{:.*}", px_dp, price));
            body["timeInForce"] = json!("GTC");
        }
        if let Some(sl) = order.stop_loss {
            body["stopLoss"] = json!(format!("{:.*}", px_dp, sl));
        }
        if let Some(tp) = order.take_profit {
            body["takeProfit"] = json!(format!("{:.*}", px_dp, tp));
        }
        body
    }

    /// Sliding one-second window over outgoing requests
    async fn throttle(&self) {
        let window = Duration::from_secs(1);
        let mut times = self.request_times.lock().await;
        let now = Instant::now();

        while times.front().is_some_and(|t| now.duration_since(*t) >= window) {
            times.pop_front();
        }

        if times.len() >= self.config.max_requests_per_second {
            if let Some(oldest) = times.pop_front() {
                let wait = window.saturating_sub(now.duration_since(oldest));
                debug!("Rate limit reached, waiting {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }
        times.push_back(Instant::now());
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &str,
        body: Option<&str>,
        signed: bool,
    ) -> GridResult<T> {
        self.throttle().await;

        let url = if query.is_empty() {
            format!("{}{}", self.config.base_url, path)
        } else {
            format!("{}{}?{}", self.config.base_url, path, query)
        };

        let mut request = self.client.request(method, &url);

        if signed {
            let timestamp = Utc::now().timestamp_millis();
            let payload = body.unwrap_or(query);
            let signature = sign_request(
                &self.credentials.api_secret,
                timestamp,
                &self.credentials.api_key,
                self.config.recv_window_ms,
                payload,
            )?;
            request = request
                .header("X-BAPI-API-KEY", &self.credentials.api_key)
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-RECV-WINDOW", self.config.recv_window_ms.to_string())
                .header("X-BAPI-SIGN", signature);
        }

        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GridError::Network(format!("HTTP {} from {}", status, path)));
        }
        if !status.is_success() {
            return Err(GridError::OrderRejected {
                code: i64::from(status.as_u16()),
                message: text,
            });
        }

        parse_envelope(&text)
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str, query: &str) -> GridResult<T> {
        self.with_retry(|| self.send(Method::GET, path, query, None, false))
            .await
    }

    async fn get_signed<T: DeserializeOwned>(&self, path: &str, query: &str) -> GridResult<T> {
        self.with_retry(|| self.send(Method::GET, path, query, None, true))
            .await
    }

    async fn post_signed<T: DeserializeOwned>(&self, path: &str, body: &Value) -> GridResult<T> {
        let body = body.to_string();
        self.with_retry(|| self.send(Method::POST, path, "", Some(&body), true))
            .await
    }

    /// Execute with exponential backoff retry. Only transport failures are
    /// retried; an exchange rejection is returned immediately.
    async fn with_retry<T, F, Fut>(&self, operation: F) -> GridResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = GridResult<T>>,
    {
        let mut attempts = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempts += 1;
                    if !e.is_retryable() || attempts >= self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.config.retry_base_delay_ms * 2u64.pow(attempts - 1);
                    warn!(
                        "Request failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, self.config.max_retries, delay, e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }
}

#[async_trait]
impl GridExchange for BybitExchange {
    async fn get_ticker(&self, symbol: &str) -> GridResult<Ticker> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol);
        let result: ListResult<TickerInfo> = self.get_public("/v5/market/tickers", &query).await?;
        let info = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| GridError::JsonParse(format!("no ticker for {}", symbol)))?;
        ticker_from(info)
    }

    async fn get_positions(&self, symbol: &str) -> GridResult<Vec<ExchangePosition>> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol);
        let result: ListResult<PositionInfo> = self.get_signed("/v5/position/list", &query).await?;
        positions_from(result.list)
    }

    async fn place_order(&self, order: &OrderRequest) -> GridResult<OrderAck> {
        // one link id for every attempt so a retried submission cannot double-fill
        let order_link_id = Uuid::new_v4().to_string();
        let body = self.order_body(order, &order_link_id);

        debug!(
            "Placing {} {} {} qty {} reduce_only={} (link {})",
            order.order_type.as_str(),
            order.side.as_str(),
            order.symbol,
            order.qty,
            order.reduce_only,
            order_link_id
        );

        match self.post_signed::<CreatedOrder>("/v5/order/create", &body).await {
            Ok(created) => Ok(OrderAck {
                order_id: created.order_id,
            }),
            Err(GridError::OrderRejected { code, .. }) if code == DUPLICATE_ORDER_LINK_ID => {
                warn!("Order {} already accepted on an earlier attempt", order_link_id);
                Ok(OrderAck {
                    order_id: order_link_id,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GridResult<()> {
        let body = json!({ "category": CATEGORY, "symbol": symbol });
        let _: Value = self.post_signed("/v5/order/cancel-all", &body).await?;
        info!("Cancelled all open orders for {}", symbol);
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GridResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });

        match self.post_signed::<Value>("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            Err(GridError::OrderRejected { code, .. }) if code == LEVERAGE_NOT_MODIFIED => {
                debug!("Leverage for {} already {}x", symbol, leverage);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order_history(&self, symbol: &str, limit: usize) -> GridResult<Vec<OrderRecord>> {
        let query = format!("category={}&symbol={}&limit={}", CATEGORY, symbol, limit.clamp(1, 50));
        let result: ListResult<OrderInfo> = self.get_signed("/v5/order/history", &query).await?;
        orders_from(result.list)
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> GridResult<OrderBook> {
        let query = format!("category={}&symbol={}&limit={}", CATEGORY, symbol, depth.clamp(1, 200));
        let snapshot: BookSnapshot = self.get_public("/v5/market/orderbook", &query).await?;
        book_from(snapshot)
    }
}
