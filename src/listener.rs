// =============================================================================
// Event Listener — user data stream consumer
// =============================================================================
//
// Consumes ORDER_TRADE_UPDATE events for the configured symbol:
//   - updates for the tracked open order go to the Order Monitor;
//   - FILLED updates on the close side book the close leg (PnL + ledger).
//
// The connection is supervised here. Whenever a session ends, including a
// key rotated by the keep-alive task, the listener reconnects with a fresh
// stream handle. A malformed message is logged and skipped.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::gateway::ExchangeGateway;
use crate::ledger::{Leg, TransactionLog, TransactionRecord};
use crate::monitor::{MonitorUpdate, OrderMonitor};
use crate::retry::ResilientGateway;
use crate::state::CloseBook;
use crate::types::{de_f64, OrderStatus, Side};

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// User data stream event, discriminated by `e`.
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
pub enum UserEvent {
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate {
        #[serde(rename = "o")]
        order: OrderUpdate,
    },
    #[serde(rename = "listenKeyExpired")]
    ListenKeyExpired,
    #[serde(other)]
    Other,
}

/// The `o` object of an ORDER_TRADE_UPDATE event.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c", default)]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: Side,
    #[serde(rename = "X")]
    pub status: OrderStatus,
    #[serde(rename = "i")]
    pub order_id: u64,
    /// Average fill price.
    #[serde(rename = "ap", default, deserialize_with = "de_f64")]
    pub avg_price: f64,
    /// Cumulative filled quantity.
    #[serde(rename = "z", default, deserialize_with = "de_f64")]
    pub filled_qty: f64,
    /// Quantity filled by this event.
    #[serde(rename = "l", default, deserialize_with = "de_f64")]
    pub last_filled_qty: f64,
    #[serde(rename = "q", default, deserialize_with = "de_f64")]
    pub orig_qty: f64,
}

/// What the connection loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Reconnect,
}

/// Why a stream session ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    KeyExpired,
    KeyRotated,
    Closed,
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub struct EventListener {
    symbol: String,
    close_side: Side,
    offset: f64,
    monitor: Arc<OrderMonitor>,
    book: Arc<CloseBook>,
    ledger: Arc<TransactionLog>,
}

impl EventListener {
    pub fn new(
        symbol: impl Into<String>,
        close_side: Side,
        offset: f64,
        monitor: Arc<OrderMonitor>,
        book: Arc<CloseBook>,
        ledger: Arc<TransactionLog>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            close_side,
            offset,
            monitor,
            book,
            ledger,
        }
    }

    /// Process one text frame from the user stream.
    pub fn handle_message(&self, text: &str) -> StreamControl {
        let event: UserEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, payload = %truncate(text, 256), "malformed user stream message");
                return StreamControl::Continue;
            }
        };

        match event {
            UserEvent::OrderTradeUpdate { order } => {
                self.handle_order_update(&order);
                StreamControl::Continue
            }
            UserEvent::ListenKeyExpired => {
                warn!("listen key expired");
                StreamControl::Reconnect
            }
            UserEvent::Other => StreamControl::Continue,
        }
    }

    fn handle_order_update(&self, update: &OrderUpdate) {
        if update.symbol != self.symbol {
            return;
        }
        debug!(
            order_id = update.order_id,
            side = %update.side,
            status = %update.status,
            filled_qty = update.filled_qty,
            last_filled_qty = update.last_filled_qty,
            avg_price = update.avg_price,
            "order update"
        );

        let applied = self.monitor.record_update(
            update.order_id,
            &update.client_order_id,
            update.status,
            update.filled_qty,
            update.avg_price,
        );
        if applied != MonitorUpdate::NotTracked {
            return;
        }

        if update.side == self.close_side && update.status == OrderStatus::Filled {
            self.book_close_fill(update);
        }
    }

    fn book_close_fill(&self, update: &OrderUpdate) {
        let total_pnl = self
            .book
            .record_close_fill(update.order_id, update.filled_qty, self.offset);

        self.ledger.append(&TransactionRecord {
            timestamp: Utc::now(),
            symbol: self.symbol.clone(),
            order_id: update.order_id,
            leg: Leg::Close,
            counter_order_id: None,
            price: update.avg_price,
            quantity: update.filled_qty,
            status: OrderStatus::Filled.to_string(),
        });

        info!(
            order_id = update.order_id,
            price = update.avg_price,
            quantity = update.filled_qty,
            pnl = self.offset * update.filled_qty,
            total_pnl,
            "close order filled"
        );
    }

    // -------------------------------------------------------------------------
    // Connection supervision
    // -------------------------------------------------------------------------

    /// Consume the user stream until the task is aborted, reconnecting on
    /// every failure.
    pub async fn run<G: ExchangeGateway>(
        &self,
        gateway: Arc<ResilientGateway<G>>,
        reconnect_delay: Duration,
    ) {
        let mut key_updates = gateway.subscribe_listen_key();
        loop {
            match self.stream_session(&gateway, &mut key_updates).await {
                Ok(SessionEnd::KeyExpired) => {
                    gateway.forget_listen_key();
                }
                Ok(SessionEnd::KeyRotated) => {}
                Ok(SessionEnd::Closed) => {
                    warn!(delay_s = reconnect_delay.as_secs(), "user stream closed, reconnecting");
                    tokio::time::sleep(reconnect_delay).await;
                }
                Err(e) => {
                    error!(
                        error = ?e,
                        delay_s = reconnect_delay.as_secs(),
                        "user stream failed, reconnecting"
                    );
                    // The cached key may be the reason the stream was refused.
                    gateway.forget_listen_key();
                    tokio::time::sleep(reconnect_delay).await;
                }
            }
        }
    }

    async fn stream_session<G: ExchangeGateway>(
        &self,
        gateway: &ResilientGateway<G>,
        key_updates: &mut watch::Receiver<Option<String>>,
    ) -> Result<SessionEnd> {
        // Mark the current key as seen before fetching, so a rotation that
        // lands after the fetch still shows up as a change.
        key_updates.borrow_and_update();
        let key = gateway
            .listen_key()
            .await
            .context("failed to obtain listen key")?;

        let url = gateway.stream_url(&key);
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .context("failed to connect to user stream")?;
        info!(symbol = %self.symbol, "user stream connected");

        let (mut write, mut read) = ws_stream.split();
        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_message(&text) == StreamControl::Reconnect {
                            return Ok(SessionEnd::KeyExpired);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write
                            .send(Message::Pong(payload))
                            .await
                            .context("failed to answer ping")?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "user stream closed by server");
                        return Ok(SessionEnd::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("user stream read error"),
                    None => return Ok(SessionEnd::Closed),
                },
                changed = key_updates.changed() => {
                    if changed.is_err() {
                        return Ok(SessionEnd::Closed);
                    }
                    let fresh = key_updates.borrow_and_update().clone();
                    if fresh.as_deref().is_some_and(|k| k != key) {
                        info!("listen key rotated, reconnecting user stream");
                        return Ok(SessionEnd::KeyRotated);
                    }
                }
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
