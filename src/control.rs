// =============================================================================
// Trading Control Loop — open → wait → reconcile → close → pace
// =============================================================================
//
// Per iteration:
//   1. admission: below max close orders, and either the pacing window has
//      elapsed or skip-wait is set (burst mode zeroes the window);
//   2. open cycle: queue-priced open order, bounded wait on the fill signal,
//      cancel if unfilled, reduce-only close for whatever filled;
//   3. reconcile the close book against the exchange and update skip-wait;
//   4. compute the pacing delay.
//
// At most one open attempt is in flight; the loop is the only writer of
// exchange orders.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{LoopTimings, TradingConfig};
use crate::gateway::{ExchangeError, ExchangeGateway};
use crate::ledger::{Leg, TransactionLog, TransactionRecord};
use crate::monitor::OrderMonitor;
use crate::retry::{CancelOutcome, ResilientGateway};
use crate::state::CloseBook;

// ---------------------------------------------------------------------------
// Outcomes and errors
// ---------------------------------------------------------------------------

/// Terminal state of one open attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Filled,
    PartiallyFilled,
    Cancelled,
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled => write!(f, "FILLED"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Summary of a completed open attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub open_order_id: u64,
    pub outcome: CycleOutcome,
    pub price: f64,
    pub quantity: f64,
    pub close_order_id: Option<u64>,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// A position was opened but no close order could be placed for it.
    #[error("filled position has no close order: {0}")]
    Unprotected(ExchangeError),
}

impl CycleError {
    /// Critical errors stop the bot; everything else is retried next
    /// iteration.
    pub fn is_critical(&self) -> bool {
        match self {
            Self::Exchange(ExchangeError::Auth(_) | ExchangeError::Decode(_)) => true,
            Self::Exchange(_) => false,
            Self::Unprotected(_) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Pacing rules
// ---------------------------------------------------------------------------

/// Minimum spacing between open attempts. Zero while the close book is at or
/// below a third of its capacity, so inventory is rebuilt in a burst.
pub fn admission_wait(active: usize, max_orders: usize, wait: Duration) -> Duration {
    if active.saturating_mul(3) <= max_orders {
        Duration::ZERO
    } else {
        wait
    }
}

/// Skip the pacing window when the last close order has filled or the last
/// open attempt was cancelled.
fn should_skip_wait(
    last_close_order: Option<u64>,
    last_outcome: Option<CycleOutcome>,
    active: &[u64],
) -> bool {
    match last_close_order {
        Some(id) if !active.contains(&id) => true,
        _ => last_outcome == Some(CycleOutcome::Cancelled),
    }
}

/// `tpc-` plus a simple uuid: 36 chars, Binance's limit.
fn new_client_order_id() -> String {
    format!("tpc-{}", Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub struct TradingLoop<G> {
    config: Arc<TradingConfig>,
    timings: LoopTimings,
    gateway: Arc<ResilientGateway<G>>,
    monitor: Arc<OrderMonitor>,
    book: Arc<CloseBook>,
    ledger: Arc<TransactionLog>,

    last_open_at: Option<Instant>,
    skip_wait: bool,
    last_close_order: Option<u64>,
    last_outcome: Option<CycleOutcome>,
    last_status_at: Instant,
}

impl<G: ExchangeGateway> TradingLoop<G> {
    pub fn new(
        config: Arc<TradingConfig>,
        timings: LoopTimings,
        gateway: Arc<ResilientGateway<G>>,
        monitor: Arc<OrderMonitor>,
        book: Arc<CloseBook>,
        ledger: Arc<TransactionLog>,
    ) -> Self {
        Self {
            config,
            timings,
            gateway,
            monitor,
            book,
            ledger,
            last_open_at: None,
            skip_wait: false,
            last_close_order: None,
            last_outcome: None,
            last_status_at: Instant::now(),
        }
    }

    /// Run until `shutdown` flips to true or a critical error occurs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let cfg = Arc::clone(&self.config);
        let initial = self
            .gateway
            .active_close_orders(&cfg.symbol, cfg.close_side())
            .await
            .context("initial close-order query failed")?;
        info!(count = initial.len(), ids = ?initial, "resting close orders at startup");
        self.book.replace(initial);

        info!(
            symbol = %cfg.symbol,
            direction = %cfg.direction,
            quantity = cfg.quantity,
            offset = cfg.offset,
            max_orders = cfg.max_orders,
            wait_s = cfg.wait_time.as_secs(),
            "trading loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_iteration().await {
                Ok(delay) => delay,
                Err(e) if e.is_critical() => {
                    error!(error = %e, "critical failure, stopping trading loop");
                    return Err(e).context("trading loop aborted");
                }
                Err(e) => {
                    warn!(error = %e, "iteration failed");
                    self.timings.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(total_pnl = self.book.cumulative_pnl(), "trading loop stopped");
        Ok(())
    }

    /// One pass of the state machine. Returns how long to sleep before the
    /// next pass.
    async fn run_iteration(&mut self) -> Result<Duration, CycleError> {
        let cfg = Arc::clone(&self.config);
        let active = self.book.len();
        let wait = admission_wait(active, cfg.max_orders, cfg.wait_time);
        let window_elapsed = self.last_open_at.map_or(true, |t| t.elapsed() >= wait);

        let mut open_failed = false;
        if active < cfg.max_orders && (window_elapsed || self.skip_wait) {
            if wait.is_zero() {
                debug!(active, max_orders = cfg.max_orders, "burst mode, pacing disabled");
            }
            let span = info_span!("cycle", id = %Uuid::new_v4());
            match self.open_cycle().instrument(span).await {
                Ok(report) => {
                    info!(
                        order_id = report.open_order_id,
                        outcome = %report.outcome,
                        price = report.price,
                        quantity = report.quantity,
                        close_order_id = ?report.close_order_id,
                        "cycle complete"
                    );
                    self.last_outcome = Some(report.outcome);
                    self.last_close_order = report.close_order_id;
                }
                Err(e) if e.is_critical() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "open attempt failed");
                    open_failed = true;
                }
            }
        }

        let fresh = self
            .gateway
            .active_close_orders(&cfg.symbol, cfg.close_side())
            .await?;
        self.skip_wait = should_skip_wait(self.last_close_order, self.last_outcome, &fresh);
        if self.skip_wait {
            debug!(
                last_close_order = ?self.last_close_order,
                last_outcome = ?self.last_outcome,
                "skipping pacing window"
            );
        }
        self.book.replace(fresh);
        self.log_status_if_due();

        let delay = self.pacing_delay(wait);
        Ok(if open_failed {
            delay.max(self.timings.error_backoff)
        } else {
            delay
        })
    }

    fn pacing_delay(&self, wait: Duration) -> Duration {
        if self.book.len() >= self.config.max_orders {
            return self.timings.saturated_sleep;
        }
        if self.skip_wait {
            return Duration::ZERO;
        }
        match self.last_open_at {
            Some(at) => wait
                .saturating_sub(at.elapsed())
                .min(self.timings.pacing_cap),
            None => Duration::ZERO,
        }
    }

    /// Place one open order and see it through to a protected position.
    async fn open_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let cfg = Arc::clone(&self.config);
        let client_order_id = new_client_order_id();
        let signal = self.monitor.arm(&client_order_id);

        let order = match self
            .gateway
            .place_open_order(&cfg.symbol, cfg.open_side(), cfg.quantity, &client_order_id)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.monitor.reset();
                return Err(e.into());
            }
        };
        self.monitor.bind_order_id(order.order_id);
        self.last_open_at = Some(Instant::now());
        info!(
            order_id = order.order_id,
            client_order_id = %client_order_id,
            side = %cfg.open_side(),
            quantity = cfg.quantity,
            price = order.price,
            "open order placed"
        );

        let wake = signal.wait(self.timings.fill_timeout).await;
        // The wake reason alone is not trusted: a fill can land right at the
        // timeout.
        let state = self.monitor.snapshot();
        debug!(?wake, filled = state.filled, filled_qty = state.filled_qty, "fill wait finished");

        let (outcome, price, quantity) = if state.filled {
            let quantity = if order.orig_qty > 0.0 {
                order.orig_qty
            } else {
                cfg.quantity
            };
            let price = state
                .filled_price
                .filter(|p| *p > 0.0)
                .unwrap_or(order.price);
            (CycleOutcome::Filled, price, quantity)
        } else {
            match self
                .gateway
                .cancel_open_order(&cfg.symbol, order.order_id)
                .await?
            {
                CancelOutcome::Cancelled(ack) if ack.executed_qty > 0.0 => {
                    let price = state
                        .filled_price
                        .filter(|p| *p > 0.0)
                        .or(Some(ack.avg_price).filter(|p| *p > 0.0))
                        .unwrap_or(order.price);
                    info!(order_id = order.order_id, executed_qty = ack.executed_qty, "open order partially filled and cancelled");
                    (CycleOutcome::PartiallyFilled, price, ack.executed_qty)
                }
                CancelOutcome::Cancelled(_) => {
                    info!(order_id = order.order_id, "open order not filled, cancelled");
                    (CycleOutcome::Cancelled, order.price, 0.0)
                }
                CancelOutcome::AlreadyFilled => {
                    info!(order_id = order.order_id, "cancel refused, order already filled");
                    (CycleOutcome::Filled, order.price, cfg.quantity)
                }
            }
        };

        let mut close_order_id = None;
        let mut close_failure = None;
        if outcome != CycleOutcome::Cancelled {
            let target = (price > 0.0).then(|| cfg.direction.close_price(price, cfg.offset));
            match self
                .gateway
                .place_close_order(&cfg.symbol, cfg.close_side(), quantity, target)
                .await
            {
                Ok((ack, tier)) => {
                    info!(
                        order_id = ack.order_id,
                        side = %cfg.close_side(),
                        quantity,
                        target = ?target,
                        tier = ?tier,
                        "close order placed"
                    );
                    close_order_id = Some(ack.order_id);
                }
                Err(e) => {
                    error!(
                        open_order_id = order.order_id,
                        quantity,
                        error = %e,
                        "failed to place close order"
                    );
                    close_failure = Some(e);
                }
            }
        }

        self.ledger.append(&TransactionRecord {
            timestamp: Utc::now(),
            symbol: cfg.symbol.clone(),
            order_id: order.order_id,
            leg: Leg::Open,
            counter_order_id: close_order_id,
            price,
            quantity,
            status: outcome.to_string(),
        });

        if let Some(e) = close_failure {
            return Err(CycleError::Unprotected(e));
        }

        Ok(CycleReport {
            open_order_id: order.order_id,
            outcome,
            price,
            quantity,
            close_order_id,
        })
    }

    fn log_status_if_due(&mut self) {
        if self.last_status_at.elapsed() < self.timings.status_interval {
            return;
        }
        self.last_status_at = Instant::now();

        let ids = self.book.ids();
        info!(
            active = ids.len(),
            max_orders = self.config.max_orders,
            ids = ?ids,
            total_pnl = self.book.cumulative_pnl(),
            rate_limits = ?self.gateway.rate_limit_usage(),
            "status"
        );
    }
}
