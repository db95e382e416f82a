// =============================================================================
// Keep-Alive Task — periodic listen-key renewal
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::gateway::ExchangeGateway;
use crate::retry::{KeyRefresh, ResilientGateway};

/// Renew the listen key every `every` until the task is aborted. A failed
/// renewal re-acquires a fresh key; if that fails too, the next tick tries
/// again.
pub async fn run_keepalive<G: ExchangeGateway>(gateway: Arc<ResilientGateway<G>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; the key is fresh at that point.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match gateway.refresh_listen_key().await {
            Ok(KeyRefresh::Renewed) => info!("listen key renewed"),
            Ok(KeyRefresh::Reacquired) => warn!("listen key replaced with a fresh one"),
            Err(e) => error!(error = %e, "listen key refresh failed, retrying next interval"),
        }
    }
}
