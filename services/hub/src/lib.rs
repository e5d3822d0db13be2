pub mod admin;
pub mod auth;
pub mod config;
pub mod db;
pub mod event_log;
pub mod ingest;
pub mod queries;
pub mod registry;
pub mod repo;
pub mod state;
pub mod ws;

pub use config::HubConfig;
pub use state::AppState;

use tracing::{debug, warn};

/// Periodic expiry sweep over the in-memory ring, the durable mirror and
/// idle fan-out channels.
pub async fn run_sweeper(state: AppState, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(state.config.events.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            _ = ticker.tick() => {
                {
                    let mut log = state.log.lock().expect("event log lock poisoned");
                    log.purge_expired(chrono::Utc::now());
                }
                let pruned = state.registry.prune_idle();
                if pruned > 0 {
                    debug!(pruned, "pruned idle fan-out channels");
                }
                match repo::delete_expired(&state.pool, state.config.events.ttl).await {
                    Ok(removed) if removed > 0 => debug!(removed, "swept expired mirror rows"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "mirror sweep failed"),
                }
            }
        }
    }
}
