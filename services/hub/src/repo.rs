//! Durable mirror of the event log.
//!
//! `realtime_events_cache` exists for ops queries and post-incident
//! inspection; the in-memory ring is authoritative for catch-up.  Writes
//! are best-effort and never sit on the live path.

use af_protocol::Event;
use sqlx::PgPool;

pub async fn insert_event(pool: &PgPool, event: &Event) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO realtime_events_cache
             (event_id, type, device, channel, publisher, data, change_hash, event_timestamp, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (event_id) DO NOTHING",
    )
    .bind(event.event_id)
    .bind(event.event_type.as_str())
    .bind(&event.device)
    .bind(event.channel.map(i64::from))
    .bind(&event.publisher)
    .bind(&event.data)
    .bind(&event.change_hash)
    .bind(event.event_timestamp)
    .bind(event.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete mirror rows older than the TTL; returns rows removed.
pub async fn delete_expired(pool: &PgPool, ttl: std::time::Duration) -> Result<u64, sqlx::Error> {
    let cutoff = chrono::Utc::now()
        - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
    let result = sqlx::query("DELETE FROM realtime_events_cache WHERE created_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
