// poller: Tiered fleet poller for A/V encoder appliances.

use std::sync::Arc;

use af_device::DeviceClient;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "poller starting");

    let cfg = match std::env::args().nth(1) {
        Some(path) => poller::config::load_config_from_path(std::path::Path::new(&path)),
        None => poller::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(
                fast_secs = cfg.intervals.fast.as_secs(),
                medium_secs = cfg.intervals.medium.as_secs(),
                slow_secs = cfg.intervals.slow.as_secs(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let pool = match poller::db::create_lazy_pool(&cfg.database_url) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("FATAL: invalid database URL: {e}");
            std::process::exit(1);
        }
    };

    let client = match DeviceClient::new(&cfg.transport()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("FATAL: failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };

    let sink = match poller::ingest::EventSink::new(cfg.hub_ingest_url.clone(), cfg.http.timeout) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("FATAL: failed to build event sink: {e}");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(poller::Registry::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let admin = tokio::spawn(poller::status_http::serve(
        cfg.admin_bind.clone(),
        poller::status_http::AdminState {
            registry: registry.clone(),
            client: client.clone(),
            started_at: chrono::Utc::now(),
        },
        shutdown_rx.clone(),
    ));

    let scheduler = poller::scheduler::Scheduler {
        client,
        pool,
        sink,
        registry,
        config: cfg,
    };
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }
    let _ = shutdown_tx.send(true);

    let _ = scheduler_task.await;
    admin.abort();
    info!("poller stopped");
}
