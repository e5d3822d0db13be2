//! Roster reconciliation.
//!
//! A single sweep task reloads the device roster on an interval and aligns
//! the set of live per-device contexts with it: new devices get their three
//! tier loops, removed devices get their loops cancelled and forgotten.  A
//! device whose address or credentials changed is treated as removed and
//! re-added so no loop ever runs with a stale target.

use std::collections::HashMap;
use std::sync::Arc;

use af_device::DeviceClient;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::PollerConfig;
use crate::ingest::EventSink;
use crate::registry::{DeviceRuntime, Registry};
use crate::roster::{load_devices, DeviceRecord};
use crate::tiers::{spawn_device_loops, TierCtx, SHUTDOWN_GRACE};

struct DeviceLoops {
    record: DeviceRecord,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

pub struct Scheduler {
    pub client: DeviceClient,
    pub pool: PgPool,
    pub sink: EventSink,
    pub registry: Arc<Registry>,
    pub config: PollerConfig,
}

impl Scheduler {
    /// Run the reconcile sweep until `shutdown` flips; winds down all device
    /// loops cooperatively on exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut running: HashMap<i64, DeviceLoops> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = ticker.tick() => {
                    self.reconcile(&mut running).await;
                }
            }
        }

        info!(devices = running.len(), "scheduler stopping; cancelling device loops");
        for (_, loops) in running.drain() {
            self.stop_device(loops).await;
        }
    }

    async fn reconcile(&self, running: &mut HashMap<i64, DeviceLoops>) {
        let devices = match load_devices(&self.pool).await {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "roster load failed; keeping current device set");
                return;
            }
        };

        let desired: HashMap<i64, DeviceRecord> =
            devices.into_iter().map(|d| (d.device_id, d)).collect();

        // Stop loops for removed (or materially changed) devices first so a
        // re-added device never briefly has two contexts.
        let stale: Vec<i64> = running
            .iter()
            .filter(|(id, loops)| desired.get(id) != Some(&loops.record))
            .map(|(&id, _)| id)
            .collect();
        for device_id in stale {
            if let Some(loops) = running.remove(&device_id) {
                info!(device_id, address = %loops.record.address, "stopping device loops");
                self.stop_device(loops).await;
            }
        }

        for (device_id, record) in desired {
            if running.contains_key(&device_id) {
                continue;
            }
            let runtime = Arc::new(DeviceRuntime::new(record.clone()));
            if !self.registry.insert(runtime.clone()) {
                warn!(device_id, "device context already registered; skipping spawn");
                continue;
            }
            info!(device_id, address = %record.address, "starting device loops");

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let ctx = TierCtx {
                client: self.client.clone(),
                runtime,
                pool: self.pool.clone(),
                sink: self.sink.clone(),
                registry: self.registry.clone(),
                backoff_policy: self.config.backoff_policy(),
                intervals: self.config.intervals.clone(),
            };
            let handles = spawn_device_loops(&ctx, &shutdown_rx);
            running.insert(
                device_id,
                DeviceLoops {
                    record,
                    shutdown_tx,
                    handles,
                },
            );
        }
    }

    /// Cancel a device's loops and clear its registry entry.  Snapshots die
    /// with the tier tasks that own them.
    async fn stop_device(&self, loops: DeviceLoops) {
        let device_id = loops.record.device_id;
        let _ = loops.shutdown_tx.send(true);
        for handle in loops.handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!(device_id, "device loop did not stop within grace; abandoning");
            }
        }
        self.registry.remove(device_id);
    }
}
