// =============================================================================
// Test Kit — Scripted in-memory exchange for unit tests
// =============================================================================
//
// Responses are queued per endpoint and consumed in order; every request is
// recorded so tests can assert on what the bot sent.
// =============================================================================

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::gateway::{ExchangeError, ExchangeGateway, ExchangeResult};
use crate::types::{AccountSnapshot, OrderAck, OrderRequest, OrderStatus, Side};

/// A request the bot made.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Place(OrderRequest),
    Cancel(u64),
    OpenOrders,
    Account,
    CreateKey,
    KeepAlive(String),
    CloseKey(String),
}

#[derive(Default)]
pub struct MockGateway {
    calls: Mutex<Vec<Call>>,
    place: Mutex<VecDeque<ExchangeResult<OrderAck>>>,
    cancel: Mutex<VecDeque<ExchangeResult<OrderAck>>>,
    open_orders: Mutex<VecDeque<ExchangeResult<Vec<OrderAck>>>>,
    /// Served once the open-orders queue is empty.
    resting: Mutex<Vec<OrderAck>>,
    listen_keys: Mutex<VecDeque<ExchangeResult<String>>>,
    keepalive: Mutex<VecDeque<ExchangeResult<()>>>,
    /// `ws://host:port` the stream URL points at.
    stream_base: Mutex<Option<String>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_place(&self, result: ExchangeResult<OrderAck>) {
        self.place.lock().push_back(result);
    }

    pub fn push_cancel(&self, result: ExchangeResult<OrderAck>) {
        self.cancel.lock().push_back(result);
    }

    pub fn push_open_orders(&self, result: ExchangeResult<Vec<OrderAck>>) {
        self.open_orders.lock().push_back(result);
    }

    pub fn set_resting(&self, orders: Vec<OrderAck>) {
        *self.resting.lock() = orders;
    }

    pub fn push_listen_key(&self, result: ExchangeResult<String>) {
        self.listen_keys.lock().push_back(result);
    }

    pub fn push_keepalive(&self, result: ExchangeResult<()>) {
        self.keepalive.lock().push_back(result);
    }

    pub fn set_stream_base(&self, base: impl Into<String>) {
        *self.stream_base.lock() = Some(base.into());
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Every order request, in submission order.
    pub fn placed(&self) -> Vec<OrderRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Place(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

fn unscripted<T>(what: &str) -> ExchangeResult<T> {
    Err(ExchangeError::Decode(format!("no scripted {what} response")))
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        self.record(Call::Place(request.clone()));
        self.place
            .lock()
            .pop_front()
            .unwrap_or_else(|| unscripted("place"))
    }

    async fn cancel_order(&self, _symbol: &str, order_id: u64) -> ExchangeResult<OrderAck> {
        self.record(Call::Cancel(order_id));
        self.cancel
            .lock()
            .pop_front()
            .unwrap_or_else(|| unscripted("cancel"))
    }

    async fn open_orders(&self, _symbol: &str) -> ExchangeResult<Vec<OrderAck>> {
        self.record(Call::OpenOrders);
        let scripted = self.open_orders.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(self.resting.lock().clone()))
    }

    async fn account_snapshot(&self, _symbol: &str) -> ExchangeResult<AccountSnapshot> {
        self.record(Call::Account);
        Ok(AccountSnapshot::default())
    }

    async fn create_listen_key(&self) -> ExchangeResult<String> {
        self.record(Call::CreateKey);
        self.listen_keys
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok("listen-key".to_string()))
    }

    async fn keepalive_listen_key(&self, listen_key: &str) -> ExchangeResult<()> {
        self.record(Call::KeepAlive(listen_key.to_string()));
        self.keepalive.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn close_listen_key(&self, listen_key: &str) -> ExchangeResult<()> {
        self.record(Call::CloseKey(listen_key.to_string()));
        Ok(())
    }

    fn stream_url(&self, listen_key: &str) -> String {
        let base = self.stream_base.lock().clone();
        let base = base.unwrap_or_else(|| "ws://127.0.0.1:9".to_string());
        format!("{base}/ws/{listen_key}")
    }
}

/// Order payload with the fields the bot reads.
pub fn ack(
    order_id: u64,
    side: Side,
    status: OrderStatus,
    price: f64,
    orig_qty: f64,
    executed_qty: f64,
) -> OrderAck {
    OrderAck {
        order_id,
        client_order_id: String::new(),
        symbol: "ETHUSDC".to_string(),
        side,
        status,
        price,
        avg_price: 0.0,
        orig_qty,
        executed_qty,
        reduce_only: false,
    }
}
