//! # Idle Monitor
//!
//! Periodic background sweep that reaps tunnels that have gone quiet,
//! independent of (and as a backstop to) the per-connection grace timers
//! in [`crate::registry`].

use crate::state::AppState;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await; // discard the immediate first tick
        loop {
            ticker.tick().await;
            debug!("running idle sweep");
            state
                .registry
                .sweep_idle(state.config.idle_timeout, &state.pending);
        }
    })
}
