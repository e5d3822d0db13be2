//! The three per-device tick loops.
//!
//! Each device owns three independent tasks sharing only the HTTP client,
//! the database pool and the event sink.  A tick runs inline in its loop,
//! so a new tick for the same tier never starts while the previous one is
//! in flight; overruns skip missed ticks instead of queueing them
//! (`MissedTickBehavior::Skip`).
//!
//! The fast tier drives the consecutive-error machine: past the threshold
//! its cadence degrades to exponential backoff until a tick succeeds.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use af_device::{BackoffState, DeviceClient, DeviceTarget};
use chrono::Utc;
use futures_util::future::join_all;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::detector::SnapshotStore;
use crate::ingest::EventSink;
use crate::plan::{
    plan_device_error, plan_fast_tick, plan_medium_tick, plan_slow_tick, FastFetch, MediumFetch,
    SlowFetch, TickPlan,
};
use crate::registry::{DeviceRuntime, Registry};
use crate::store::apply_writes;

/// Everything one tier loop needs; cheap to clone per spawned loop.
#[derive(Clone)]
pub struct TierCtx {
    pub client: DeviceClient,
    pub runtime: Arc<DeviceRuntime>,
    pub pool: PgPool,
    pub sink: EventSink,
    pub registry: Arc<Registry>,
    pub backoff_policy: af_device::BackoffPolicy,
    pub intervals: crate::config::IntervalConfig,
}

impl TierCtx {
    fn target(&self) -> DeviceTarget {
        self.runtime.record.target()
    }

    /// Apply a planned tick: events first conceptually, but both paths are
    /// independent; a write failure never suppresses fan-out.
    async fn apply(&self, plan: TickPlan) {
        for (shape, error) in &plan.failures {
            debug!(device = %self.runtime.record.address, shape = %shape, error = %error, "shape fetch failed");
        }

        let events = plan.events.len() as u64;
        let (submit, write) = tokio::join!(
            self.sink.submit(plan.events),
            apply_writes(&self.pool, &plan.writes)
        );
        let (applied, failed) = write;
        self.registry.writes_applied.fetch_add(applied, Ordering::Relaxed);
        self.registry.writes_failed.fetch_add(failed, Ordering::Relaxed);
        self.registry.events_submitted.fetch_add(submit, Ordering::Relaxed);
        if submit < events {
            debug!(
                device = %self.runtime.record.address,
                submitted = submit,
                planned = events,
                "some events were not accepted by the hub"
            );
        }
    }

    /// Drop tier-local snapshots when an operator forced a refresh since the
    /// last tick.  Returns the generation observed.
    fn maybe_refresh(&self, last_gen: u64, snapshots: &mut SnapshotStore) -> u64 {
        let generation = self.runtime.refresh_gen.load(Ordering::Acquire);
        if generation != last_gen {
            info!(device = %self.runtime.record.address, "forced refresh: clearing snapshots");
            snapshots.clear();
        }
        generation
    }
}

// ---------------------------------------------------------------------------
// Shape fetchers (all-settled semantics)
// ---------------------------------------------------------------------------

async fn fetch_fast(client: &DeviceClient, target: &DeviceTarget, channels: &[u32]) -> FastFetch {
    let publisher_futures = channels.iter().map(|&channel| {
        let client = client.clone();
        let target = target.clone();
        async move { (channel, client.get_publisher_status(&target, channel).await) }
    });
    let (publishers, recorders) = tokio::join!(
        join_all(publisher_futures),
        client.get_recorder_status(target)
    );
    FastFetch { publishers, recorders }
}

async fn fetch_medium(client: &DeviceClient, target: &DeviceTarget) -> MediumFetch {
    let channels = client.get_channels(target).await;

    let mut names = Vec::new();
    if let Ok(channels) = &channels {
        let per_channel = channels.iter().map(|channel| {
            let client = client.clone();
            let target = target.clone();
            let channel_id = channel.id;
            let publisher_ids: Vec<String> =
                channel.publishers.iter().map(|p| p.id.clone()).collect();
            async move {
                let fetched = join_all(publisher_ids.iter().map(|publisher| {
                    let client = client.clone();
                    let target = target.clone();
                    async move {
                        let name = client.get_publisher_name(&target, channel_id, publisher).await;
                        (publisher.clone(), name)
                    }
                }))
                .await;
                (channel_id, fetched.into_iter().collect::<BTreeMap<_, _>>())
            }
        });
        names = join_all(per_channel).await;
    }

    MediumFetch { channels, names }
}

async fn fetch_slow(client: &DeviceClient, target: &DeviceTarget) -> SlowFetch {
    let (identity, status) = tokio::join!(
        client.get_system_identity(target),
        client.get_system_status(target)
    );
    SlowFetch { identity, status }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

pub async fn run_fast_loop(ctx: TierCtx, mut shutdown: watch::Receiver<bool>) {
    let mut snapshots = SnapshotStore::new();
    let mut backoff = BackoffState::new();
    let mut last_gen = ctx.runtime.refresh_gen.load(Ordering::Acquire);
    let interval = ctx.intervals.fast;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            _ = ticker.tick() => {
                last_gen = ctx.maybe_refresh(last_gen, &mut snapshots);
                let started = tokio::time::Instant::now();
                run_fast_tick(&ctx, &mut snapshots, &mut backoff).await;
                if started.elapsed() > interval {
                    warn!(
                        device = %ctx.runtime.record.address,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "fast tick overran its interval; missed ticks are skipped"
                    );
                }

                // Past the error threshold the cadence degrades; the ticker
                // resumes its normal interval once a tick succeeds.
                if let Some(delay) = backoff.current_delay(&ctx.backoff_policy) {
                    ctx.runtime.in_backoff.store(true, Ordering::Release);
                    info!(
                        device = %ctx.runtime.record.address,
                        failures = backoff.failures(),
                        delay_secs = delay.as_secs_f64(),
                        "fast tier in backoff"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() { break; }
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    ticker.reset();
                } else {
                    ctx.runtime.in_backoff.store(false, Ordering::Release);
                }
            }
        }
    }
    debug!(device = %ctx.runtime.record.address, "fast loop stopped");
}

async fn run_fast_tick(ctx: &TierCtx, snapshots: &mut SnapshotStore, backoff: &mut BackoffState) {
    let target = ctx.target();
    let channels = ctx.runtime.active_channels();
    let fetch = fetch_fast(&ctx.client, &target, &channels).await;
    let now = Utc::now();

    ctx.registry.ticks_total.fetch_add(1, Ordering::Relaxed);
    let plan = plan_fast_tick(&ctx.runtime.record, fetch, snapshots, now);

    if plan.tick_failed {
        ctx.registry.ticks_failed.fetch_add(1, Ordering::Relaxed);
        backoff.record_failure();
        let count = ctx.runtime.record_error();
        let message = plan
            .failures
            .first()
            .map_or_else(|| "device unreachable".to_owned(), |(_, e)| e.clone());
        warn!(
            device = %ctx.runtime.record.address,
            error_count = count,
            error = %message,
            "fast tick failed"
        );
        let error_plan =
            plan_device_error(&ctx.runtime.record, &message, count, snapshots, now);
        ctx.apply(error_plan).await;
    } else {
        backoff.record_success();
        ctx.runtime.record_success(now);
        ctx.apply(plan).await;
    }
}

pub async fn run_medium_loop(ctx: TierCtx, mut shutdown: watch::Receiver<bool>) {
    let mut snapshots = SnapshotStore::new();
    let mut last_gen = ctx.runtime.refresh_gen.load(Ordering::Acquire);
    let mut ticker = tokio::time::interval(ctx.intervals.medium);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            _ = ticker.tick() => {
                last_gen = ctx.maybe_refresh(last_gen, &mut snapshots);
                let target = ctx.target();
                let fetch = fetch_medium(&ctx.client, &target).await;
                if let Ok(channels) = &fetch.channels {
                    ctx.runtime.set_active_channels(channels.iter().map(|c| c.id).collect());
                }

                ctx.registry.ticks_total.fetch_add(1, Ordering::Relaxed);
                let plan = plan_medium_tick(&ctx.runtime.record, fetch, &mut snapshots, Utc::now());
                if plan.tick_failed {
                    // Non-critical tier: count it, log it, keep the cadence.
                    ctx.registry.ticks_failed.fetch_add(1, Ordering::Relaxed);
                    let count = ctx.runtime.record_error();
                    warn!(
                        device = %ctx.runtime.record.address,
                        error_count = count,
                        failures = ?plan.failures,
                        "medium tick failed"
                    );
                } else {
                    ctx.apply(plan).await;
                }
            }
        }
    }
    debug!(device = %ctx.runtime.record.address, "medium loop stopped");
}

pub async fn run_slow_loop(ctx: TierCtx, mut shutdown: watch::Receiver<bool>) {
    let mut snapshots = SnapshotStore::new();
    let mut last_gen = ctx.runtime.refresh_gen.load(Ordering::Acquire);
    let mut ticker = tokio::time::interval(ctx.intervals.slow);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            _ = ticker.tick() => {
                last_gen = ctx.maybe_refresh(last_gen, &mut snapshots);
                let target = ctx.target();
                let fetch = fetch_slow(&ctx.client, &target).await;

                ctx.registry.ticks_total.fetch_add(1, Ordering::Relaxed);
                let plan = plan_slow_tick(&ctx.runtime.record, fetch, &mut snapshots, Utc::now());
                if plan.tick_failed {
                    ctx.registry.ticks_failed.fetch_add(1, Ordering::Relaxed);
                    let count = ctx.runtime.record_error();
                    warn!(
                        device = %ctx.runtime.record.address,
                        error_count = count,
                        failures = ?plan.failures,
                        "slow tick failed"
                    );
                } else {
                    ctx.apply(plan).await;
                }
            }
        }
    }
    debug!(device = %ctx.runtime.record.address, "slow loop stopped");
}

/// Spawn all three loops for one device.
pub fn spawn_device_loops(
    ctx: &TierCtx,
    shutdown: &watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(run_fast_loop(ctx.clone(), shutdown.clone())),
        tokio::spawn(run_medium_loop(ctx.clone(), shutdown.clone())),
        tokio::spawn(run_slow_loop(ctx.clone(), shutdown.clone())),
    ]
}

/// How long a device loop gets to wind down before its task is abandoned.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
