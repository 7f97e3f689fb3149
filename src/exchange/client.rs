// =============================================================================
// Venue REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry the API key as a header and a recvWindow of 5 000 ms to tolerate minor
// clock drift between the engine and the venue.
// =============================================================================

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::exchange::error::ExchangeError;
use crate::exchange::rate_limit::RateLimitTracker;
use crate::market_data::{Candle, Timeframe};
use crate::types::{Credentials, ExchangeOrder, OrderState, Side};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// REST client with HMAC-SHA256 request signing and header-driven rate-limit
/// tracking.
pub struct RestClient {
    credentials: Credentials,
    base_url: String,
    http: reqwest::Client,
    limits: RateLimitTracker,
}

impl RestClient {
    pub fn new(credentials: Credentials) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&credentials.api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            credentials,
            base_url: "https://api.binance.com".to_string(),
            http,
            limits: RateLimitTracker::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64
    }

    /// Full query string for a signed request (timestamp + recvWindow +
    /// signature appended).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Send one request, sync the rate-limit tracker, classify failures.
    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
        weight: u32,
    ) -> Result<serde_json::Value, ExchangeError> {
        if !self.limits.can_send_request(weight) {
            return Err(ExchangeError::RateLimited {
                retry_after_ms: None,
            });
        }

        let query = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self.http.request(method, &url).send().await?;

        self.limits.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(format!("failed to parse response: {e}")))?;

        if !status.is_success() {
            let code = body["code"].as_i64().unwrap_or(0);
            let msg = body["msg"].as_str().unwrap_or("unknown venue error");
            return Err(ExchangeError::classify(status.as_u16(), code, msg));
        }

        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /api/v3/order (signed) — submit a limit GTC order.
    pub async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        quantity: f64,
    ) -> Result<ExchangeOrder, ExchangeError> {
        if !self.limits.can_place_order() {
            return Err(ExchangeError::RateLimited {
                retry_after_ms: None,
            });
        }

        let client_order_id = Uuid::new_v4().simple().to_string();
        let params = format!(
            "symbol={symbol}&side={}&type=LIMIT&timeInForce=GTC&quantity={quantity}&price={price}&newClientOrderId={client_order_id}",
            side.as_str()
        );

        debug!(symbol, side = %side, price, quantity, "placing limit order");
        let body = self.send(Method::POST, "/api/v3/order", &params, true, 1).await?;
        self.limits.record_order_sent();

        parse_order(&body).ok_or_else(|| {
            ExchangeError::Transport(format!("unparseable order response: {body}"))
        })
    }

    /// POST /api/v3/order (signed) — submit a market sell.
    pub async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<ExchangeOrder, ExchangeError> {
        if !self.limits.can_place_order() {
            return Err(ExchangeError::RateLimited {
                retry_after_ms: None,
            });
        }

        let params = format!("symbol={symbol}&side=SELL&type=MARKET&quantity={quantity}");

        debug!(symbol, quantity, "placing market sell");
        let body = self.send(Method::POST, "/api/v3/order", &params, true, 1).await?;
        self.limits.record_order_sent();

        parse_order(&body).ok_or_else(|| {
            ExchangeError::Transport(format!("unparseable order response: {body}"))
        })
    }

    /// DELETE /api/v3/order (signed).
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        debug!(symbol, order_id, "cancelling order");
        self.send(Method::DELETE, "/api/v3/order", &params, true, 1)
            .await?;
        Ok(())
    }

    /// GET /api/v3/openOrders (signed).
    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let params = format!("symbol={symbol}");
        let body = self
            .send(Method::GET, "/api/v3/openOrders", &params, true, 6)
            .await?;

        let orders = body
            .as_array()
            .map(|arr| arr.iter().filter_map(parse_order).collect::<Vec<_>>())
            .unwrap_or_default();

        debug!(symbol, count = orders.len(), "open orders retrieved");
        Ok(orders)
    }

    /// GET /api/v3/allOrders (signed) — orders updated since `since_ms`.
    pub async fn orders_since(
        &self,
        symbol: &str,
        since_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let params = format!("symbol={symbol}&startTime={since_ms}");
        let body = self
            .send(Method::GET, "/api/v3/allOrders", &params, true, 20)
            .await?;

        let orders = body
            .as_array()
            .map(|arr| arr.iter().filter_map(parse_order).collect::<Vec<_>>())
            .unwrap_or_default();

        debug!(symbol, since_ms, count = orders.len(), "historical orders retrieved");
        Ok(orders)
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// GET /api/v3/account (signed) — free balance for a single asset.
    pub async fn balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let body = self.send(Method::GET, "/api/v3/account", "", true, 20).await?;

        let balances = body["balances"].as_array().ok_or_else(|| {
            ExchangeError::Transport("account response missing 'balances' array".into())
        })?;

        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                let free = parse_str_f64(&b["free"]).unwrap_or(0.0);
                debug!(asset, free, "balance retrieved");
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in balances — returning 0.0");
        Ok(0.0)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines (public). Returns only closed candles: the final
    /// row is the in-progress candle whenever its close time is still in the
    /// future, and is dropped.
    pub async fn klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let params = format!("symbol={symbol}&interval={}&limit={limit}", timeframe.as_str());
        let body = self.send(Method::GET, "/api/v3/klines", &params, false, 2).await?;

        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Transport("klines response is not an array".into()))?;

        let now_ms = Self::timestamp_ms();
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_kline_row(row) {
                Some(candle) if candle.close_time <= now_ms => candles.push(candle),
                Some(_) => {} // in-progress candle
                None => warn!(symbol, "skipping malformed kline row"),
            }
        }

        debug!(symbol, timeframe = %timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("credentials", &self.credentials)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -------------------------------------------------------------------------
// Parsing helpers
// -------------------------------------------------------------------------

/// Parse one venue order object into an [`ExchangeOrder`].
pub(crate) fn parse_order(v: &serde_json::Value) -> Option<ExchangeOrder> {
    let id = v["orderId"].as_u64()?.to_string();
    let symbol = v["symbol"].as_str()?.to_string();
    let side = Side::from(v["side"].as_str()?);
    let price = parse_str_f64(&v["price"])?;
    let quantity = parse_str_f64(&v["origQty"])?;
    let state = v["status"]
        .as_str()
        .map(OrderState::from_venue)
        .unwrap_or(OrderState::Unknown);
    let update_time_ms = v["updateTime"]
        .as_i64()
        .or_else(|| v["transactTime"].as_i64())
        .or_else(|| v["time"].as_i64())
        .unwrap_or(0);

    Some(ExchangeOrder {
        id,
        symbol,
        side,
        price,
        quantity,
        state,
        update_time_ms,
    })
}

/// Parse one kline array row:
/// `[0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///  [6] closeTime, ...`
fn parse_kline_row(row: &serde_json::Value) -> Option<Candle> {
    let arr = row.as_array()?;
    if arr.len() < 7 {
        return None;
    }
    Some(Candle::new(
        arr[0].as_i64()?,
        parse_str_f64(&arr[1])?,
        parse_str_f64(&arr[2])?,
        parse_str_f64(&arr[3])?,
        parse_str_f64(&arr[4])?,
        parse_str_f64(&arr[5])?,
        arr[6].as_i64()?,
    ))
}

/// The venue sends numeric values as JSON strings; accept both forms.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
