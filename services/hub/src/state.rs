//! Shared application state for the hub's three HTTP surfaces.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sqlx::PgPool;

use crate::config::HubConfig;
use crate::event_log::EventLog;
use crate::registry::FanoutRegistry;

#[derive(Debug, Default)]
pub struct Metrics {
    pub events_ingested: AtomicU64,
    pub events_deduplicated: AtomicU64,
    pub events_rejected: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub connections_current: AtomicI64,
    pub connections_rejected: AtomicU64,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<HubConfig>,
    /// Guards append + broadcast together: per-key FIFO by construction.
    pub log: Arc<Mutex<EventLog>>,
    pub registry: Arc<FanoutRegistry>,
    pub connections_per_ip: Arc<Mutex<HashMap<IpAddr, usize>>>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(pool: PgPool, config: HubConfig) -> Self {
        let log = EventLog::new(
            config.events.ring_capacity,
            config.events.ttl,
            config.events.dedup_window,
        );
        let registry = FanoutRegistry::new(config.limits.queue_capacity);
        AppState {
            pool,
            config: Arc::new(config),
            log: Arc::new(Mutex::new(log)),
            registry: Arc::new(registry),
            connections_per_ip: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Try to claim a connection slot for `ip`.  Release with
    /// [`AppState::release_connection`].
    pub fn try_claim_connection(&self, ip: IpAddr) -> bool {
        let mut per_ip = self.connections_per_ip.lock().expect("conn lock poisoned");
        let count = per_ip.entry(ip).or_insert(0);
        if *count >= self.config.limits.max_connections_per_ip {
            self.metrics.connections_rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        *count += 1;
        self.metrics.connections_current.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn release_connection(&self, ip: IpAddr) {
        let mut per_ip = self.connections_per_ip.lock().expect("conn lock poisoned");
        if let Some(count) = per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
        self.metrics.connections_current.fetch_add(-1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    fn test_state(max_per_ip: usize) -> AppState {
        let mut config = load_config_from_str(
            r#"
            [database]
            url = "postgres://fleet@localhost/fleet"
            [auth]
            signing_secret = "0123456789abcdef0123456789abcdef"
            "#,
        )
        .unwrap();
        config.limits.max_connections_per_ip = max_per_ip;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://postgres@127.0.0.1:5432/postgres")
            .expect("lazy pool");
        AppState::new(pool, config)
    }

    #[tokio::test]
    async fn per_ip_cap_is_enforced_and_released() {
        let state = test_state(2);
        let ip: IpAddr = "192.0.2.7".parse().unwrap();

        assert!(state.try_claim_connection(ip));
        assert!(state.try_claim_connection(ip));
        assert!(!state.try_claim_connection(ip), "third connection must be refused");

        state.release_connection(ip);
        assert!(state.try_claim_connection(ip), "slot freed after release");

        let other: IpAddr = "192.0.2.8".parse().unwrap();
        assert!(state.try_claim_connection(other), "caps are per remote address");
    }
}
