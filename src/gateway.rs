// =============================================================================
// Exchange Gateway — The exchange contract the trading core depends on
// =============================================================================
//
// The control loop, the listener and the keep-alive task only ever talk to
// the exchange through `ExchangeGateway`, so the REST client can be swapped
// for a scripted gateway in tests.
// =============================================================================

use async_trait::async_trait;
use thiserror::Error;

use crate::binance::rate_limit::RateLimitSnapshot;
use crate::types::{AccountSnapshot, OrderAck, OrderRequest};

/// Convenience alias for gateway results.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Failure classes the core reacts to differently.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network failures, timeouts, 5xx and rate-limit responses.
    #[error("transport error: {0}")]
    Transport(String),
    /// Business rejection (e.g. post-only would cross, unknown order).
    #[error("exchange rejected request (code {code}): {msg}")]
    Rejected { code: i64, msg: String },
    /// Invalid or missing API credentials.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The exchange answered with a payload we could not understand.
    #[error("failed to decode exchange response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Whether repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Request/response surface of the exchange.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Submit a new order.
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck>;

    /// Cancel an order by exchange id.
    async fn cancel_order(&self, symbol: &str, order_id: u64) -> ExchangeResult<OrderAck>;

    /// All open orders for `symbol`.
    async fn open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderAck>>;

    /// Wallet balance and the position held in `symbol`.
    async fn account_snapshot(&self, symbol: &str) -> ExchangeResult<AccountSnapshot>;

    /// Start a user data stream and return its listen key.
    async fn create_listen_key(&self) -> ExchangeResult<String>;

    /// Extend the validity of `listen_key`.
    async fn keepalive_listen_key(&self, listen_key: &str) -> ExchangeResult<()>;

    /// Close the user data stream behind `listen_key`.
    async fn close_listen_key(&self, listen_key: &str) -> ExchangeResult<()>;

    /// WebSocket URL of the user data stream for `listen_key`.
    fn stream_url(&self, listen_key: &str) -> String;

    /// Latest request-weight usage reported by the exchange, if tracked.
    fn rate_limit_usage(&self) -> Option<RateLimitSnapshot> {
        None
    }
}
