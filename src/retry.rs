// =============================================================================
// Resilient Gateway — retry policy, close-order fallback and listen-key cache
// =============================================================================
//
// Read-style calls (open-order queries, account snapshot, listen-key calls)
// are retried on transient failures with LINEAR backoff: the n-th retry waits
// `base_delay × n`. Business rejections are returned immediately.
//
// Cancels are retried the same way. Placements are never retried; close
// orders instead use a two-tier placement: a post-only order at the target
// price first, and on rejection a queue-priced order that is guaranteed to
// rest in the book.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::binance::rate_limit::RateLimitSnapshot;
use crate::gateway::{ExchangeError, ExchangeGateway, ExchangeResult};
use crate::types::{AccountSnapshot, OrderAck, OrderRequest, PriceSpec, Side, TimeInForce};

/// Close prices are sent with this many decimals.
const PRICE_DECIMALS: i32 = 3;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded retry with linear backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> ExchangeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        op = what,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Which tier of the close placement produced the resting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTier {
    PostOnly,
    Queue,
}

/// Result of cancelling the open order at the end of its wait window.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The exchange cancelled the order; `executed_qty` may be non-zero.
    Cancelled(OrderAck),
    /// The cancel was refused because the order had already filled.
    AlreadyFilled,
}

/// Result of a listen-key refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRefresh {
    Renewed,
    Reacquired,
}

// ---------------------------------------------------------------------------
// Resilient gateway
// ---------------------------------------------------------------------------

/// Policy layer in front of an [`ExchangeGateway`].
pub struct ResilientGateway<G> {
    inner: G,
    policy: RetryPolicy,
    listen_key: Mutex<Option<String>>,
    key_updates: watch::Sender<Option<String>>,
}

impl<G: ExchangeGateway> ResilientGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        let (key_updates, _) = watch::channel(None);
        Self {
            inner,
            policy,
            listen_key: Mutex::new(None),
            key_updates,
        }
    }

    #[cfg(test)]
    pub fn inner(&self) -> &G {
        &self.inner
    }

    // -------------------------------------------------------------------------
    // Reads (retried)
    // -------------------------------------------------------------------------

    /// Ids of resting orders on `close_side`, in exchange order.
    pub async fn active_close_orders(
        &self,
        symbol: &str,
        close_side: Side,
    ) -> ExchangeResult<Vec<u64>> {
        let orders = self
            .policy
            .run("open_orders", || self.inner.open_orders(symbol))
            .await?;
        Ok(orders
            .into_iter()
            .filter(|o| o.side == close_side)
            .map(|o| o.order_id)
            .collect())
    }

    pub async fn account_snapshot(&self, symbol: &str) -> ExchangeResult<AccountSnapshot> {
        self.policy
            .run("account_snapshot", || self.inner.account_snapshot(symbol))
            .await
    }

    // -------------------------------------------------------------------------
    // Writes (never retried)
    // -------------------------------------------------------------------------

    /// Queue-priced GTC open order tagged with `client_order_id`.
    pub async fn place_open_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        client_order_id: &str,
    ) -> ExchangeResult<OrderAck> {
        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            quantity,
            price: PriceSpec::Queue,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            client_order_id: Some(client_order_id.to_string()),
        };
        self.inner.place_order(&request).await
    }

    /// Reduce-only close order. Tries post-only at `target_price` first and
    /// falls back to a queue-priced order when the exchange rejects it. With
    /// no usable target price the queue tier is used directly.
    pub async fn place_close_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        target_price: Option<f64>,
    ) -> ExchangeResult<(OrderAck, CloseTier)> {
        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            quantity,
            price: PriceSpec::Queue,
            time_in_force: TimeInForce::Gtc,
            reduce_only: true,
            client_order_id: None,
        };

        if let Some(price) = target_price.filter(|p| p.is_finite() && *p > 0.0) {
            let post_only = OrderRequest {
                price: PriceSpec::Fixed(round_price(price)),
                time_in_force: TimeInForce::Gtx,
                ..request.clone()
            };
            match self.inner.place_order(&post_only).await {
                Ok(ack) => return Ok((ack, CloseTier::PostOnly)),
                Err(ExchangeError::Rejected { code, msg }) => {
                    info!(code, msg = %msg, price, "post-only close rejected, falling back to queue order");
                }
                Err(e) => return Err(e),
            }
        }

        let ack = self.inner.place_order(&request).await?;
        Ok((ack, CloseTier::Queue))
    }

    /// Cancel the open order. A refusal means the order is no longer
    /// cancellable because it filled in the meantime; that refusal is the
    /// authoritative outcome.
    ///
    /// Transport failures mean the cancel was not applied and the order is
    /// still live, so the request is retried. Once attempts run out the
    /// error is returned; a fill is never assumed.
    pub async fn cancel_open_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> ExchangeResult<CancelOutcome> {
        let cancelled = self
            .policy
            .run("cancel_order", || self.inner.cancel_order(symbol, order_id))
            .await;
        match cancelled {
            Ok(ack) => Ok(CancelOutcome::Cancelled(ack)),
            Err(ExchangeError::Rejected { code, msg }) => {
                debug!(order_id, code, msg = %msg, "cancel refused, order already filled");
                Ok(CancelOutcome::AlreadyFilled)
            }
            Err(e) => {
                warn!(order_id, error = %e, "cancel failed, order state unknown");
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Listen key
    // -------------------------------------------------------------------------

    /// Cached listen key, acquiring a fresh one when none is held.
    pub async fn listen_key(&self) -> ExchangeResult<String> {
        if let Some(key) = self.listen_key.lock().clone() {
            return Ok(key);
        }
        self.acquire_listen_key().await
    }

    /// Renew the cached key; on failure drop it and acquire a new one.
    pub async fn refresh_listen_key(&self) -> ExchangeResult<KeyRefresh> {
        let current = self.listen_key.lock().clone();
        if let Some(key) = current {
            let renewed = self
                .policy
                .run("keepalive_listen_key", || self.inner.keepalive_listen_key(&key))
                .await;
            match renewed {
                Ok(()) => return Ok(KeyRefresh::Renewed),
                Err(e) => {
                    warn!(error = %e, "listen key renewal failed, re-acquiring");
                    self.forget_listen_key();
                }
            }
        }
        self.acquire_listen_key().await?;
        Ok(KeyRefresh::Reacquired)
    }

    /// Drop the cached key so the next use acquires a fresh one.
    pub fn forget_listen_key(&self) {
        *self.listen_key.lock() = None;
    }

    /// Notifies listeners whenever a new key is acquired.
    pub fn subscribe_listen_key(&self) -> watch::Receiver<Option<String>> {
        self.key_updates.subscribe()
    }

    /// Best-effort close of the cached stream at shutdown.
    pub async fn close_listen_key(&self) {
        let current = self.listen_key.lock().take();
        if let Some(key) = current {
            if let Err(e) = self.inner.close_listen_key(&key).await {
                warn!(error = %e, "failed to close listen key");
            }
        }
    }

    pub fn stream_url(&self, listen_key: &str) -> String {
        self.inner.stream_url(listen_key)
    }

    pub fn rate_limit_usage(&self) -> Option<RateLimitSnapshot> {
        self.inner.rate_limit_usage()
    }

    async fn acquire_listen_key(&self) -> ExchangeResult<String> {
        let key = self
            .policy
            .run("create_listen_key", || self.inner.create_listen_key())
            .await?;
        *self.listen_key.lock() = Some(key.clone());
        self.key_updates.send_replace(Some(key.clone()));
        info!("listen key acquired");
        Ok(key)
    }
}

/// Round to the price precision sent on close orders.
pub fn round_price(price: f64) -> f64 {
    let factor = 10f64.powi(PRICE_DECIMALS);
    (price * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{ack, Call, MockGateway};
    use crate::types::OrderStatus;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(3));
    }

    #[test]
    fn rounds_close_price() {
        assert_eq!(round_price(2001.0), 2001.0);
        assert_eq!(round_price(2001.23456), 2001.235);
    }

    #[tokio::test]
    async fn read_retries_transient_failures_then_succeeds() {
        let mock = MockGateway::new();
        mock.push_open_orders(Err(ExchangeError::Transport("timeout".into())));
        mock.push_open_orders(Err(ExchangeError::Transport("502".into())));
        mock.push_open_orders(Ok(vec![
            ack(1, Side::Sell, OrderStatus::New, 2001.0, 0.01, 0.0),
            ack(2, Side::Buy, OrderStatus::New, 1999.0, 0.01, 0.0),
            ack(3, Side::Sell, OrderStatus::New, 2002.0, 0.01, 0.0),
        ]));
        let gw = ResilientGateway::new(mock, fast_policy());

        let ids = gw.active_close_orders("ETHUSDC", Side::Sell).await.unwrap();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(gw.inner().count(|c| matches!(c, Call::OpenOrders)), 3);
    }

    #[tokio::test]
    async fn read_gives_up_after_max_attempts() {
        let mock = MockGateway::new();
        for _ in 0..5 {
            mock.push_open_orders(Err(ExchangeError::Transport("down".into())));
        }
        let gw = ResilientGateway::new(mock, fast_policy());

        let err = gw.active_close_orders("ETHUSDC", Side::Sell).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(gw.inner().count(|c| matches!(c, Call::OpenOrders)), 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let mock = MockGateway::new();
        mock.push_open_orders(Err(ExchangeError::Rejected {
            code: -1121,
            msg: "Invalid symbol.".into(),
        }));
        let gw = ResilientGateway::new(mock, fast_policy());

        assert!(gw.active_close_orders("NOPE", Side::Sell).await.is_err());
        assert_eq!(gw.inner().count(|c| matches!(c, Call::OpenOrders)), 1);
    }

    #[tokio::test]
    async fn close_order_prefers_post_only() {
        let mock = MockGateway::new();
        mock.push_place(Ok(ack(50, Side::Sell, OrderStatus::New, 2001.0, 0.01, 0.0)));
        let gw = ResilientGateway::new(mock, fast_policy());

        let (placed, tier) = gw
            .place_close_order("ETHUSDC", Side::Sell, 0.01, Some(2001.0))
            .await
            .unwrap();
        assert_eq!(placed.order_id, 50);
        assert_eq!(tier, CloseTier::PostOnly);

        let placed = gw.inner().placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].price, PriceSpec::Fixed(2001.0));
        assert_eq!(placed[0].time_in_force, TimeInForce::Gtx);
        assert!(placed[0].reduce_only);
    }

    #[tokio::test]
    async fn close_order_falls_back_to_queue_on_rejection() {
        let mock = MockGateway::new();
        mock.push_place(Err(ExchangeError::Rejected {
            code: -5022,
            msg: "Post Only order will be rejected".into(),
        }));
        mock.push_place(Ok(ack(51, Side::Sell, OrderStatus::New, 2000.5, 0.01, 0.0)));
        let gw = ResilientGateway::new(mock, fast_policy());

        let (placed, tier) = gw
            .place_close_order("ETHUSDC", Side::Sell, 0.01, Some(2001.0))
            .await
            .unwrap();
        assert_eq!(placed.order_id, 51);
        assert_eq!(tier, CloseTier::Queue);

        let placed = gw.inner().placed();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[1].price, PriceSpec::Queue);
        assert_eq!(placed[1].time_in_force, TimeInForce::Gtc);
        assert!(placed[1].reduce_only);
    }

    #[tokio::test]
    async fn close_order_does_not_fall_back_on_transport_error() {
        let mock = MockGateway::new();
        mock.push_place(Err(ExchangeError::Transport("reset".into())));
        let gw = ResilientGateway::new(mock, fast_policy());

        let err = gw
            .place_close_order("ETHUSDC", Side::Sell, 0.01, Some(2001.0))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(gw.inner().placed().len(), 1);
    }

    #[tokio::test]
    async fn cancel_refusal_means_filled() {
        let mock = MockGateway::new();
        mock.push_cancel(Err(ExchangeError::Rejected {
            code: -2011,
            msg: "Unknown order sent.".into(),
        }));
        let gw = ResilientGateway::new(mock, fast_policy());
        assert_eq!(
            gw.cancel_open_order("ETHUSDC", 9).await.unwrap(),
            CancelOutcome::AlreadyFilled
        );
    }

    #[tokio::test]
    async fn transient_cancel_failure_is_retried() {
        let mock = MockGateway::new();
        mock.push_cancel(Err(ExchangeError::Transport(
            "HTTP 429 Too Many Requests (code -1003)".into(),
        )));
        mock.push_cancel(Ok(ack(9, Side::Buy, OrderStatus::Canceled, 2000.0, 0.01, 0.0)));
        let gw = ResilientGateway::new(mock, fast_policy());

        match gw.cancel_open_order("ETHUSDC", 9).await.unwrap() {
            CancelOutcome::Cancelled(ack) => assert_eq!(ack.executed_qty, 0.0),
            other => panic!("expected a cancellation, got {other:?}"),
        }
        assert_eq!(gw.inner().count(|c| matches!(c, Call::Cancel(9))), 2);
    }

    #[tokio::test]
    async fn exhausted_cancel_retries_are_not_a_fill() {
        let mock = MockGateway::new();
        for _ in 0..3 {
            mock.push_cancel(Err(ExchangeError::Transport("HTTP 503".into())));
        }
        let gw = ResilientGateway::new(mock, fast_policy());

        let err = gw.cancel_open_order("ETHUSDC", 9).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(gw.inner().count(|c| matches!(c, Call::Cancel(9))), 3);
    }

    #[tokio::test]
    async fn renewal_failure_reacquires_key() {
        let mock = MockGateway::new();
        mock.push_listen_key(Ok("key-1".into()));
        mock.push_listen_key(Ok("key-2".into()));
        for _ in 0..3 {
            mock.push_keepalive(Err(ExchangeError::Transport("timeout".into())));
        }
        let gw = ResilientGateway::new(mock, fast_policy());
        let mut updates = gw.subscribe_listen_key();

        assert_eq!(gw.listen_key().await.unwrap(), "key-1");
        assert_eq!(gw.listen_key().await.unwrap(), "key-1");
        assert_eq!(gw.refresh_listen_key().await.unwrap(), KeyRefresh::Reacquired);
        assert_eq!(gw.listen_key().await.unwrap(), "key-2");
        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().as_deref(), Some("key-2"));
    }

    #[tokio::test]
    async fn renewal_success_keeps_key() {
        let mock = MockGateway::new();
        mock.push_listen_key(Ok("key-1".into()));
        let gw = ResilientGateway::new(mock, fast_policy());

        gw.listen_key().await.unwrap();
        assert_eq!(gw.refresh_listen_key().await.unwrap(), KeyRefresh::Renewed);
        assert_eq!(
            gw.inner().count(|c| matches!(c, Call::KeepAlive(k) if k == "key-1")),
            1
        );
    }
}
