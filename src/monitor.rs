// =============================================================================
// Order Monitor — fill state of the single in-flight open order
// =============================================================================
//
// Written by the user-stream listener, read by the control loop. All fields
// live behind one mutex so a reader never sees the fill flag without the
// matching price and quantity.
//
// Each attempt gets a fresh one-shot channel from `arm`, which makes a stale
// wake-up from a previous attempt impossible. The sender is consumed on the
// first FILLED update, so the signal fires at most once per attempt.
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::types::OrderStatus;

/// Fill state of the current attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillState {
    pub order_id: Option<u64>,
    pub client_order_id: Option<String>,
    pub filled: bool,
    pub filled_price: Option<f64>,
    pub filled_qty: f64,
}

impl FillState {
    fn tracks(&self, order_id: u64, client_order_id: &str) -> bool {
        self.order_id == Some(order_id)
            || (!client_order_id.is_empty()
                && self.client_order_id.as_deref() == Some(client_order_id))
    }
}

/// Result of feeding an order update into the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorUpdate {
    /// The update belongs to some other order.
    NotTracked,
    /// The update was for the tracked order.
    Applied { signalled: bool },
}

/// Why the control loop stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Signalled,
    TimedOut,
    /// The attempt was reset before it could fill.
    Dropped,
}

/// Single-slot wake-up for one attempt.
#[derive(Debug)]
pub struct FillSignal(oneshot::Receiver<()>);

impl FillSignal {
    /// Wait for the fill signal, at most `timeout`.
    pub async fn wait(self, timeout: Duration) -> WakeReason {
        match tokio::time::timeout(timeout, self.0).await {
            Ok(Ok(())) => WakeReason::Signalled,
            Ok(Err(_)) => WakeReason::Dropped,
            Err(_) => WakeReason::TimedOut,
        }
    }
}

#[derive(Default)]
struct Inner {
    state: FillState,
    wake: Option<oneshot::Sender<()>>,
}

/// Shared monitor; exactly one per bot.
#[derive(Default)]
pub struct OrderMonitor {
    inner: Mutex<Inner>,
}

impl OrderMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all fields and drop any pending wake-up.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = FillState::default();
        inner.wake = None;
    }

    /// Start tracking a new attempt identified by `client_order_id` and hand
    /// back its wake-up signal.
    pub fn arm(&self, client_order_id: &str) -> FillSignal {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        inner.state = FillState {
            client_order_id: Some(client_order_id.to_string()),
            ..FillState::default()
        };
        inner.wake = Some(tx);
        FillSignal(rx)
    }

    /// Attach the exchange order id once the placement is acknowledged.
    pub fn bind_order_id(&self, order_id: u64) {
        self.inner.lock().state.order_id = Some(order_id);
    }

    /// Apply an order update if it belongs to the tracked attempt.
    ///
    /// FILLED sets the fill flag and fires the wake-up; PARTIALLY_FILLED only
    /// refreshes quantity and price. Other statuses leave the state alone.
    pub fn record_update(
        &self,
        order_id: u64,
        client_order_id: &str,
        status: OrderStatus,
        filled_qty: f64,
        avg_price: f64,
    ) -> MonitorUpdate {
        let mut inner = self.inner.lock();
        if !inner.state.tracks(order_id, client_order_id) {
            return MonitorUpdate::NotTracked;
        }

        let signalled = match status {
            OrderStatus::Filled => {
                inner.state.filled = true;
                inner.state.filled_qty = filled_qty;
                inner.state.filled_price = Some(avg_price);
                match inner.wake.take() {
                    // A dropped receiver means the loop already gave up; the
                    // flag is still re-checked after the wait.
                    Some(tx) => tx.send(()).is_ok(),
                    None => false,
                }
            }
            OrderStatus::PartiallyFilled => {
                inner.state.filled_qty = filled_qty;
                inner.state.filled_price = Some(avg_price);
                false
            }
            _ => false,
        };

        debug!(order_id, %status, filled_qty, avg_price, signalled, "monitor updated");
        MonitorUpdate::Applied { signalled }
    }

    pub fn snapshot(&self) -> FillState {
        self.inner.lock().state.clone()
    }
}

impl std::fmt::Debug for OrderMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderMonitor")
            .field("state", &self.snapshot())
            .finish()
    }
}
