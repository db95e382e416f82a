// =============================================================================
// Binance USDⓈ-M Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::binance::rate_limit::{RateLimitSnapshot, RateLimitTracker};
use crate::config::Credentials;
use crate::gateway::{ExchangeError, ExchangeGateway, ExchangeResult};
use crate::types::{AccountSnapshot, OrderAck, OrderRequest, PriceSpec};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Per-request HTTP timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// REST and WebSocket base URLs.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub rest: String,
    pub ws: String,
}

impl Endpoints {
    pub fn mainnet() -> Self {
        Self {
            rest: "https://fapi.binance.com".to_string(),
            ws: "wss://fstream.binance.com".to_string(),
        }
    }

    pub fn testnet() -> Self {
        Self {
            rest: "https://testnet.binancefuture.com".to_string(),
            ws: "wss://stream.binancefuture.com".to_string(),
        }
    }
}

/// Binance futures REST client with HMAC-SHA256 request signing.
pub struct FuturesClient {
    secret: String,
    endpoints: Endpoints,
    client: reqwest::Client,
    rate_limits: Arc<RateLimitTracker>,
}

impl FuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client. The API key travels as a default header and is
    /// never placed in query strings.
    pub fn new(credentials: &Credentials, endpoints: Endpoints) -> anyhow::Result<Self> {
        let mut default_headers = HeaderMap::new();
        let key = HeaderValue::from_str(&credentials.api_key)
            .context("API key contains characters not allowed in a header")?;
        default_headers.insert("X-MBX-APIKEY", key);

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %endpoints.rest, "FuturesClient initialised");

        Ok(Self {
            secret: credentials.api_secret.clone(),
            endpoints,
            client,
            rate_limits: Arc::new(RateLimitTracker::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Append timestamp, recvWindow and signature to `params`.
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

    /// Send a signed request and return the decoded JSON body.
    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> ExchangeResult<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.endpoints.rest, path, qs);
        self.send(method, path, url).await
    }

    /// Send a request that only needs the API key header (listen-key
    /// endpoints).
    async fn send_keyed(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> ExchangeResult<serde_json::Value> {
        let url = if params.is_empty() {
            format!("{}{}", self.endpoints.rest, path)
        } else {
            format!("{}{}?{}", self.endpoints.rest, path, params)
        };
        self.send(method, path, url).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        url: String,
    ) -> ExchangeResult<serde_json::Value> {
        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(format!("{method} {path} request failed: {e}")))?;

        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(format!("{method} {path} body read failed: {e}")))?;

        let body = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return Err(ExchangeError::Decode(format!("{method} {path}: {e}")));
            }
            Err(_) => serde_json::Value::String(text),
        };

        if !status.is_success() {
            return Err(classify_error(status, &body));
        }

        Ok(body)
    }
}

// -----------------------------------------------------------------------------
// Exchange contract
// -----------------------------------------------------------------------------

#[async_trait]
impl ExchangeGateway for FuturesClient {
    /// POST /fapi/v1/order (signed).
    #[instrument(skip(self), name = "binance::place_order")]
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let params = order_params(request);
        let body = self.send_signed(Method::POST, "/fapi/v1/order", &params).await?;
        decode(body, "order response")
    }

    /// DELETE /fapi/v1/order (signed).
    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: u64) -> ExchangeResult<OrderAck> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self.send_signed(Method::DELETE, "/fapi/v1/order", &params).await?;
        decode(body, "cancel response")
    }

    /// GET /fapi/v1/openOrders (signed).
    #[instrument(skip(self), name = "binance::open_orders")]
    async fn open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderAck>> {
        let params = format!("symbol={symbol}");
        let body = self.send_signed(Method::GET, "/fapi/v1/openOrders", &params).await?;
        let orders: Vec<OrderAck> = decode(body, "openOrders response")?;
        debug!(count = orders.len(), "open orders retrieved");
        Ok(orders)
    }

    /// GET /fapi/v2/account (signed).
    #[instrument(skip(self), name = "binance::account_snapshot")]
    async fn account_snapshot(&self, symbol: &str) -> ExchangeResult<AccountSnapshot> {
        let body = self.send_signed(Method::GET, "/fapi/v2/account", "").await?;
        parse_account(&body, symbol)
    }

    /// POST /fapi/v1/listenKey.
    async fn create_listen_key(&self) -> ExchangeResult<String> {
        let body = self.send_keyed(Method::POST, "/fapi/v1/listenKey", "").await?;
        body["listenKey"]
            .as_str()
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::Decode("listenKey missing from response".into()))
    }

    /// PUT /fapi/v1/listenKey.
    async fn keepalive_listen_key(&self, listen_key: &str) -> ExchangeResult<()> {
        let params = format!("listenKey={listen_key}");
        self.send_keyed(Method::PUT, "/fapi/v1/listenKey", &params)
            .await
            .map(|_| ())
    }

    /// DELETE /fapi/v1/listenKey.
    async fn close_listen_key(&self, listen_key: &str) -> ExchangeResult<()> {
        let params = format!("listenKey={listen_key}");
        self.send_keyed(Method::DELETE, "/fapi/v1/listenKey", &params)
            .await
            .map(|_| ())
    }

    fn stream_url(&self, listen_key: &str) -> String {
        format!("{}/ws/{}", self.endpoints.ws, listen_key)
    }

    fn rate_limit_usage(&self) -> Option<RateLimitSnapshot> {
        Some(self.rate_limits.snapshot())
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Internal helpers
// -----------------------------------------------------------------------------

/// Query parameters for a new LIMIT order in one-way position mode.
fn order_params(request: &OrderRequest) -> String {
    let mut params = format!(
        "symbol={}&side={}&positionSide=BOTH&type=LIMIT&quantity={}",
        request.symbol, request.side, request.quantity
    );

    match request.price {
        PriceSpec::Fixed(p) => params.push_str(&format!("&price={p}")),
        PriceSpec::Queue => params.push_str("&priceMatch=QUEUE"),
    }
    params.push_str(&format!("&timeInForce={}", request.time_in_force.as_str()));
    if request.reduce_only {
        params.push_str("&reduceOnly=true");
    }
    if let Some(coid) = &request.client_order_id {
        params.push_str(&format!("&newClientOrderId={coid}"));
    }
    params
}

/// Map an HTTP failure onto the error class the core acts on.
fn classify_error(status: StatusCode, body: &serde_json::Value) -> ExchangeError {
    let code = body["code"].as_i64().unwrap_or(0);
    let msg = body["msg"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());

    // -1021 timestamp outside recvWindow, -1001 internal disconnect,
    // -1003 too many requests: all worth retrying.
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 418
        || matches!(code, -1001 | -1003 | -1021)
    {
        return ExchangeError::Transport(format!("HTTP {status} (code {code}): {msg}"));
    }

    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || matches!(code, -1022 | -2014 | -2015)
    {
        return ExchangeError::Auth(format!("HTTP {status} (code {code}): {msg}"));
    }

    ExchangeError::Rejected { code, msg }
}

fn decode<T: serde::de::DeserializeOwned>(body: serde_json::Value, what: &str) -> ExchangeResult<T> {
    serde_json::from_value(body).map_err(|e| ExchangeError::Decode(format!("{what}: {e}")))
}

/// Pull wallet totals and the position for `symbol` out of /fapi/v2/account.
fn parse_account(body: &serde_json::Value, symbol: &str) -> ExchangeResult<AccountSnapshot> {
    let total_wallet_balance = parse_str_f64(&body["totalWalletBalance"])?;
    let total_unrealized_profit = parse_str_f64(&body["totalUnrealizedProfit"])?;

    let position = body["positions"]
        .as_array()
        .and_then(|positions| positions.iter().find(|p| p["symbol"].as_str() == Some(symbol)));

    let (position_amt, entry_price) = match position {
        Some(p) => (
            parse_str_f64(&p["positionAmt"])?,
            parse_str_f64(&p["entryPrice"])?,
        ),
        None => (0.0, 0.0),
    };

    Ok(AccountSnapshot {
        total_wallet_balance,
        total_unrealized_profit,
        position_amt,
        entry_price,
    })
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> ExchangeResult<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| ExchangeError::Decode(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(ExchangeError::Decode(format!("expected string or number, got: {val}")))
    }
}
