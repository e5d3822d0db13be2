//! Canonical state-store writes.
//!
//! Every write is an upsert on the row's natural key so concurrent tiers
//! touching the same device never contend on ordering.  Fast-tier writes
//! update status columns only and medium-tier writes update the name
//! column only; the two merge independently in `publisher_states`.
//!
//! Failures are logged and counted, never propagated: the event fan-out has
//! already been handed its copy of the truth, and the next tick retries.

use sqlx::PgPool;
use tracing::warn;

use crate::plan::StateWrite;

/// Apply writes one by one; returns `(applied, failed)` counts.
pub async fn apply_writes(pool: &PgPool, writes: &[StateWrite]) -> (u64, u64) {
    let mut applied = 0u64;
    let mut failed = 0u64;
    for write in writes {
        match apply_one(pool, write).await {
            Ok(()) => applied += 1,
            Err(e) => {
                failed += 1;
                warn!(error = %e, write = ?write_label(write), "state write failed");
            }
        }
    }
    (applied, failed)
}

fn write_label(write: &StateWrite) -> &'static str {
    match write {
        StateWrite::DeviceHealth { .. } => "device_states",
        StateWrite::ChannelsBlob { .. } => "device_states.channels",
        StateWrite::PublisherStatus { .. } => "publisher_states",
        StateWrite::PublisherName { .. } => "publisher_states.name",
        StateWrite::Recorder { .. } => "recorder_states",
        StateWrite::Identity { .. } => "device_identity",
        StateWrite::SystemStatus { .. } => "system_status",
    }
}

async fn apply_one(pool: &PgPool, write: &StateWrite) -> Result<(), sqlx::Error> {
    match write {
        StateWrite::DeviceHealth {
            device_id,
            status,
            error_count,
            error,
            last_seen,
        } => {
            sqlx::query(
                "INSERT INTO device_states (device_id, status, error_count, last_error, last_seen, updated_at)
                 VALUES ($1, $2, $3, $4, $5, now())
                 ON CONFLICT (device_id) DO UPDATE
                 SET status = EXCLUDED.status,
                     error_count = EXCLUDED.error_count,
                     last_error = EXCLUDED.last_error,
                     last_seen = EXCLUDED.last_seen,
                     updated_at = now()",
            )
            .bind(device_id)
            .bind(status)
            .bind(error_count)
            .bind(error)
            .bind(last_seen)
            .execute(pool)
            .await?;
        }
        StateWrite::ChannelsBlob { device_id, channels } => {
            sqlx::query(
                "INSERT INTO device_states (device_id, status, channels_data, updated_at)
                 VALUES ($1, 'online', $2, now())
                 ON CONFLICT (device_id) DO UPDATE
                 SET channels_data = EXCLUDED.channels_data,
                     updated_at = now()",
            )
            .bind(device_id)
            .bind(channels)
            .execute(pool)
            .await?;
        }
        StateWrite::PublisherStatus {
            device_id,
            channel_id,
            publisher_id,
            kind,
            state,
            started,
            is_configured,
        } => {
            sqlx::query(
                "INSERT INTO publisher_states
                     (device_id, channel_id, publisher_id, type, state, started, is_configured, last_updated)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, now())
                 ON CONFLICT (device_id, channel_id, publisher_id) DO UPDATE
                 SET type = EXCLUDED.type,
                     state = EXCLUDED.state,
                     started = EXCLUDED.started,
                     is_configured = EXCLUDED.is_configured,
                     last_updated = now()",
            )
            .bind(device_id)
            .bind(channel_id)
            .bind(publisher_id)
            .bind(kind)
            .bind(state)
            .bind(started)
            .bind(is_configured)
            .execute(pool)
            .await?;
        }
        StateWrite::PublisherName {
            device_id,
            channel_id,
            publisher_id,
            name,
        } => {
            // Name-only merge: status columns are untouched, and a name may
            // arrive before the fast tier has ever seen the publisher.
            sqlx::query(
                "INSERT INTO publisher_states (device_id, channel_id, publisher_id, name, last_updated)
                 VALUES ($1, $2, $3, $4, now())
                 ON CONFLICT (device_id, channel_id, publisher_id) DO UPDATE
                 SET name = EXCLUDED.name,
                     last_updated = now()",
            )
            .bind(device_id)
            .bind(channel_id)
            .bind(publisher_id)
            .bind(name)
            .execute(pool)
            .await?;
        }
        StateWrite::Recorder {
            device_id,
            recorder_id,
            name,
            state,
            description,
            duration,
            active,
            total,
            multisource,
        } => {
            sqlx::query(
                "INSERT INTO recorder_states
                     (device_id, recorder_id, name, state, description, duration, active, total, multisource, last_updated)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
                 ON CONFLICT (device_id, recorder_id) DO UPDATE
                 SET name = EXCLUDED.name,
                     state = EXCLUDED.state,
                     description = EXCLUDED.description,
                     duration = EXCLUDED.duration,
                     active = EXCLUDED.active,
                     total = EXCLUDED.total,
                     multisource = EXCLUDED.multisource,
                     last_updated = now()",
            )
            .bind(device_id)
            .bind(recorder_id)
            .bind(name)
            .bind(state)
            .bind(description)
            .bind(duration)
            .bind(active)
            .bind(total)
            .bind(multisource)
            .execute(pool)
            .await?;
        }
        StateWrite::Identity {
            device_id,
            name,
            location,
            description,
        } => {
            sqlx::query(
                "INSERT INTO device_identity (device_id, name, location, description, last_updated)
                 VALUES ($1, $2, $3, $4, now())
                 ON CONFLICT (device_id) DO UPDATE
                 SET name = EXCLUDED.name,
                     location = EXCLUDED.location,
                     description = EXCLUDED.description,
                     last_updated = now()",
            )
            .bind(device_id)
            .bind(name)
            .bind(location)
            .bind(description)
            .execute(pool)
            .await?;
        }
        StateWrite::SystemStatus {
            device_id,
            uptime,
            cpuload,
            cpuload_high,
            cputemp,
            cputemp_threshold,
        } => {
            sqlx::query(
                "INSERT INTO system_status
                     (device_id, uptime, cpuload, cpuload_high, cputemp, cputemp_threshold, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, now())",
            )
            .bind(device_id)
            .bind(uptime)
            .bind(cpuload)
            .bind(cpuload_high)
            .bind(cputemp)
            .bind(cputemp_threshold)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}
