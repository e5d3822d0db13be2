//! Device roster reads for preview targets.

use std::collections::HashMap;

use af_device::DeviceTarget;
use sqlx::PgPool;

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    device_id: i64,
    address: String,
    username: String,
    secret: String,
}

pub async fn load_targets(pool: &PgPool) -> Result<HashMap<i64, DeviceTarget>, sqlx::Error> {
    let rows = sqlx::query_as::<_, DeviceRow>(
        "SELECT device_id, address, username, secret FROM devices",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            (
                row.device_id,
                DeviceTarget {
                    address: row.address,
                    username: row.username,
                    secret: row.secret,
                },
            )
        })
        .collect())
}

/// Periodic roster reload into the service's target cache.
pub async fn run_roster_refresh(
    pool: PgPool,
    service: std::sync::Arc<crate::service::PreviewService>,
    interval: std::time::Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            _ = ticker.tick() => {
                match load_targets(&pool).await {
                    Ok(targets) => service.set_roster(targets),
                    Err(e) => tracing::warn!(error = %e, "roster reload failed; keeping cached targets"),
                }
            }
        }
    }
}
