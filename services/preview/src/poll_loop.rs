//! The per-target polling loop.
//!
//! Fetch a frame, normalize it, atomically replace the cached file.  On
//! failure the loop backs off exponentially per target (base = refresh
//! rate) and classifies the error so operators can tell a powered-off
//! encoder from stale credentials.  A success resets the backoff.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use af_device::{BackoffState, DeviceClient, DeviceError, DeviceTarget};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::PreviewConfig;
use crate::images::optimize_jpeg;
use crate::service::LoopCounters;

pub struct LoopCtx {
    pub client: DeviceClient,
    pub target: DeviceTarget,
    pub device_id: i64,
    pub channel: u32,
    pub config: Arc<PreviewConfig>,
    pub cache_path: PathBuf,
    pub counters: Arc<LoopCounters>,
}

pub async fn run_target_loop(ctx: LoopCtx, mut shutdown: watch::Receiver<bool>) {
    ctx.counters.started.fetch_add(1, Ordering::AcqRel);
    ctx.counters.live.fetch_add(1, Ordering::AcqRel);

    let policy = ctx.config.backoff_policy();
    let params = ctx.config.preview_params();
    let mut backoff = BackoffState::new();

    loop {
        match tick(&ctx, &params).await {
            Ok(bytes_written) => {
                backoff.record_success();
                ctx.counters.fetches_ok.fetch_add(1, Ordering::Relaxed);
                debug!(
                    device_id = ctx.device_id,
                    channel = ctx.channel,
                    bytes = bytes_written,
                    "preview frame cached"
                );
            }
            Err(e) => {
                backoff.record_failure();
                ctx.counters.fetches_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    device_id = ctx.device_id,
                    channel = ctx.channel,
                    kind = e.kind(),
                    failures = backoff.failures(),
                    error = %e,
                    "preview fetch failed"
                );
            }
        }

        // Backoff suppresses the loop entirely; otherwise the normal cadence.
        let delay = backoff
            .current_delay(&policy)
            .unwrap_or(ctx.config.fetch.refresh);
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            () = tokio::time::sleep(delay) => {}
        }
    }

    ctx.counters.live.fetch_add(-1, Ordering::AcqRel);
    debug!(device_id = ctx.device_id, channel = ctx.channel, "preview loop exited");
}

async fn tick(ctx: &LoopCtx, params: &af_device::PreviewParams) -> Result<usize, DeviceError> {
    let frame = ctx
        .client
        .get_preview(&ctx.target, ctx.channel, params)
        .await?;
    let optimized = optimize_jpeg(&frame, ctx.config.fetch.jpeg_quality)
        .map_err(|e| DeviceError::Parse(format!("undecodable preview frame: {e}")))?;
    let written = optimized.len();

    // tmp + rename so readers never observe a torn frame.
    if let Some(parent) = ctx.cache_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DeviceError::Other(format!("cache dir: {e}")))?;
    }
    let tmp = ctx.cache_path.with_extension("jpg.tmp");
    tokio::fs::write(&tmp, &optimized)
        .await
        .map_err(|e| DeviceError::Other(format!("cache write: {e}")))?;
    tokio::fs::rename(&tmp, &ctx.cache_path)
        .await
        .map_err(|e| DeviceError::Other(format!("cache rename: {e}")))?;
    Ok(written)
}
