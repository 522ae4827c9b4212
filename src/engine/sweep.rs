use std::sync::Arc;

use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info};

use crate::engine::lifecycle::OrderEngine;

/// Drives the auto-assign sweep on a fixed interval. Each tick is independent; no
/// fairness state carries over between sweeps.
pub async fn run_auto_assign_loop(engine: Arc<OrderEngine>, every: Duration) {
    info!(interval_secs = every.as_secs(), "auto-assign loop started");

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so a restart does not sweep at once.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(err) = engine.auto_assign_sweep().await {
            error!(error = %err, "auto-assign sweep failed");
        }
    }
}
