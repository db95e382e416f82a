// =============================================================================
// TP Cycle Bot — Main Entry Point
// =============================================================================
//
// Three long-lived tasks share one exchange connection:
//   - the trading loop (open → close cycles, the only order writer);
//   - the user-stream listener (fills, close-leg bookkeeping);
//   - the listen-key keep-alive.
//
// Ctrl-C lets the current cycle finish so a filled position is never left
// without its close order, then tears the background tasks down.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod config;
mod control;
mod gateway;
mod keepalive;
mod ledger;
mod listener;
mod logging;
mod monitor;
mod retry;
mod state;
mod types;

#[cfg(test)]
mod testkit;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::binance::FuturesClient;
use crate::config::{Cli, LoopTimings};
use crate::control::TradingLoop;
use crate::ledger::TransactionLog;
use crate::listener::EventListener;
use crate::monitor::OrderMonitor;
use crate::retry::{ResilientGateway, RetryPolicy};
use crate::state::CloseBook;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();
    let cli = Cli::parse();
    let config = Arc::new(cli.trading_config()?);
    let _log_guard = logging::init_tracing(&cli.log_dir, &config.symbol, cli.log_to_console)?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        TP Cycle Bot — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(
        symbol = %config.symbol,
        direction = %config.direction,
        quantity = config.quantity,
        offset = config.offset,
        max_orders = config.max_orders,
        wait_s = config.wait_time.as_secs(),
        testnet = cli.testnet,
        "configuration loaded"
    );

    let credentials = match cli.credentials() {
        Ok(credentials) => credentials,
        Err(e) => {
            error!(error = %e, "cannot start without API credentials");
            return Err(e);
        }
    };

    // ── 2. Exchange connection ───────────────────────────────────────────
    let client = FuturesClient::new(&credentials, cli.endpoints())?;
    let gateway = Arc::new(ResilientGateway::new(client, RetryPolicy::default()));

    match gateway.account_snapshot(&config.symbol).await {
        Ok(account) => info!(
            wallet_balance = account.total_wallet_balance,
            unrealized_pnl = account.total_unrealized_profit,
            position_amt = account.position_amt,
            entry_price = account.entry_price,
            "account snapshot"
        ),
        Err(e) => warn!(error = %e, "account snapshot unavailable"),
    }

    // ── 3. Shared state ──────────────────────────────────────────────────
    let timings = LoopTimings::default();
    let monitor = Arc::new(OrderMonitor::new());
    let book = Arc::new(CloseBook::new());
    let ledger = Arc::new(TransactionLog::new(&cli.log_dir, &config.symbol));
    info!(path = %ledger.path().display(), "transaction log");

    // ── 4. Background tasks ──────────────────────────────────────────────
    let listener = EventListener::new(
        config.symbol.clone(),
        config.close_side(),
        config.offset,
        monitor.clone(),
        book.clone(),
        ledger.clone(),
    );
    let listener_task = {
        let gateway = gateway.clone();
        let delay = timings.reconnect_delay;
        tokio::spawn(async move { listener.run(gateway, delay).await })
    };
    let keepalive_task = tokio::spawn(keepalive::run_keepalive(
        gateway.clone(),
        timings.keepalive_interval,
    ));

    // ── 5. Trading loop ──────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trading = TradingLoop::new(
        config.clone(),
        timings,
        gateway.clone(),
        monitor,
        book.clone(),
        ledger,
    );
    let mut loop_task = tokio::spawn(trading.run(shutdown_rx));

    let outcome = tokio::select! {
        res = &mut loop_task => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested, finishing current cycle");
            let _ = shutdown_tx.send(true);
            (&mut loop_task).await
        }
    };

    // ── 6. Teardown ──────────────────────────────────────────────────────
    listener_task.abort();
    keepalive_task.abort();
    let _ = listener_task.await;
    let _ = keepalive_task.await;
    gateway.close_listen_key().await;
    info!(total_pnl = book.cumulative_pnl(), "bot stopped");

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = ?e, "trading loop terminated");
            Err(e)
        }
        Err(e) => Err(anyhow::Error::new(e).context("trading loop task failed")),
    }
}
