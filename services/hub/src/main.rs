// hub: Event store and real-time bus for the fleet.

use std::net::SocketAddr;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "hub starting");

    let cfg = match std::env::args().nth(1) {
        Some(path) => hub::config::load_config_from_path(std::path::Path::new(&path)),
        None => hub::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let pool = match hub::db::create_pool(&cfg.database_url).await {
        Ok(pool) => {
            if let Err(e) = hub::db::run_migrations(&pool).await {
                eprintln!("FATAL: migrations failed: {e}");
                std::process::exit(1);
            }
            pool
        }
        Err(e) => {
            // The live path works without the mirror; degrade to lazy.
            warn!(error = %e, "database unreachable at startup; mirror writes will retry");
            match hub::db::create_lazy_pool(&cfg.database_url) {
                Ok(pool) => pool,
                Err(e) => {
                    eprintln!("FATAL: invalid database URL: {e}");
                    std::process::exit(1);
                }
            }
        }
    };

    let state = hub::AppState::new(pool, cfg);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let public = spawn_server(
        state.config.public_bind.clone(),
        hub::ws::build_router(state.clone()),
        shutdown_rx.clone(),
        "public",
    );
    let internal = spawn_server(
        state.config.internal_bind.clone(),
        hub::ingest::build_router(state.clone()),
        shutdown_rx.clone(),
        "internal",
    );
    let admin = spawn_server(
        state.config.admin_bind.clone(),
        hub::admin::build_router(state.clone()),
        shutdown_rx.clone(),
        "admin",
    );
    let sweeper = tokio::spawn(hub::run_sweeper(state, shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }
    let _ = shutdown_tx.send(true);

    for task in [public, internal, admin, sweeper] {
        let _ = task.await;
    }
    info!("hub stopped");
}

fn spawn_server(
    bind: String,
    router: axum::Router,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    name: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(bind = %bind, error = %e, "failed to bind {name} listener");
                return;
            }
        };
        info!(bind = %bind, "{name} listening");
        let serve = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|&stop| stop).await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "{name} server error");
        }
    })
}
