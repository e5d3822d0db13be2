// preview: Subscription-counted still-frame service for the fleet.

use std::sync::Arc;

use af_device::{DeviceClient, TransportConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "preview service starting");

    let cfg = match std::env::args().nth(1) {
        Some(path) => preview::config::load_config_from_path(std::path::Path::new(&path)),
        None => preview::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let pool = match sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect_lazy(&cfg.database_url)
    {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("FATAL: invalid database URL: {e}");
            std::process::exit(1);
        }
    };

    let client = match DeviceClient::new(&TransportConfig {
        request_timeout: cfg.fetch.http_timeout,
        ..TransportConfig::default()
    }) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("FATAL: failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };

    let bind = cfg.bind.clone();
    let cache_dir = cfg.cache.dir.clone();
    let max_age = cfg.cache.max_age;
    let sweep_interval = cfg.cache.sweep_interval;
    let roster_refresh = cfg.roster_refresh;

    let service = Arc::new(preview::PreviewService::new(client, cfg));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Seed the roster before serving so early subscriptions resolve.
    match preview::roster::load_targets(&pool).await {
        Ok(targets) => {
            info!(devices = targets.len(), "roster loaded");
            service.set_roster(targets);
        }
        Err(e) => error!(error = %e, "initial roster load failed; will retry on refresh"),
    }

    let sweeper = tokio::spawn(preview::cleanup::run_sweeper(
        cache_dir,
        max_age,
        sweep_interval,
        shutdown_rx.clone(),
    ));
    let roster = tokio::spawn(preview::roster::run_roster_refresh(
        pool,
        service.clone(),
        roster_refresh,
        shutdown_rx.clone(),
    ));

    let router = preview::http::build_router(service);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {bind}: {e}");
            std::process::exit(1);
        }
    };
    info!(bind = %bind, "preview HTTP listening");

    let mut serve_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = serve_shutdown.wait_for(|&stop| stop).await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "server error");
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }
    let _ = shutdown_tx.send(true);
    for task in [server, sweeper, roster] {
        let _ = task.await;
    }
    info!("preview service stopped");
}
