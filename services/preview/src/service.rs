//! Subscription-counted preview polling.
//!
//! Exactly one polling loop exists per `(device, channel)` with at least one
//! subscriber.  The first subscription spawns the loop; the last
//! unsubscription stops it, deletes the cached file and releases all
//! bookkeeping, under a single lock so the zero-crossing is atomic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use af_device::{DeviceClient, DeviceTarget};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PreviewConfig;
use crate::images::placeholder_jpeg;
use crate::poll_loop::{run_target_loop, LoopCtx};

pub type TargetKey = (i64, u32);

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("unknown device {0}")]
    UnknownDevice(i64),
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(Uuid),
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeReceipt {
    pub subscriber_id: Uuid,
    pub subscriber_count: usize,
    pub is_first: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribeReceipt {
    pub subscriber_count: usize,
    pub stopped: bool,
}

struct TargetEntry {
    subscriber_count: usize,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    live: HashMap<TargetKey, TargetEntry>,
    subscribers: HashMap<Uuid, TargetKey>,
}

/// Loop lifecycle counters, shared with the loops themselves.
#[derive(Debug, Default)]
pub struct LoopCounters {
    pub started: AtomicU64,
    pub live: AtomicI64,
    pub fetches_ok: AtomicU64,
    pub fetches_failed: AtomicU64,
}

pub struct PreviewService {
    client: DeviceClient,
    config: Arc<PreviewConfig>,
    targets: RwLock<HashMap<i64, DeviceTarget>>,
    inner: Mutex<Inner>,
    pub counters: Arc<LoopCounters>,
}

impl PreviewService {
    pub fn new(client: DeviceClient, config: PreviewConfig) -> Self {
        PreviewService {
            client,
            config: Arc::new(config),
            targets: RwLock::new(HashMap::new()),
            inner: Mutex::new(Inner::default()),
            counters: Arc::new(LoopCounters::default()),
        }
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.config
    }

    /// Replace the device roster cache (from the periodic DB reload).
    pub fn set_roster(&self, roster: HashMap<i64, DeviceTarget>) {
        *self.targets.write().expect("roster lock poisoned") = roster;
    }

    pub fn set_target(&self, device_id: i64, target: DeviceTarget) {
        self.targets
            .write()
            .expect("roster lock poisoned")
            .insert(device_id, target);
    }

    pub fn cache_path(&self, device_id: i64, channel: u32) -> PathBuf {
        self.config
            .cache
            .dir
            .join(device_id.to_string())
            .join(format!("channel_{channel}.jpg"))
    }

    pub fn subscribe(
        &self,
        device_id: i64,
        channel: u32,
        client_hint: Option<String>,
    ) -> Result<SubscribeReceipt, PreviewError> {
        let target = self
            .targets
            .read()
            .expect("roster lock poisoned")
            .get(&device_id)
            .cloned()
            .ok_or(PreviewError::UnknownDevice(device_id))?;

        let key = (device_id, channel);
        let subscriber_id = Uuid::new_v4();
        let mut inner = self.inner.lock().expect("service lock poisoned");

        let (subscriber_count, is_first) = match inner.live.get_mut(&key) {
            Some(entry) => {
                entry.subscriber_count += 1;
                (entry.subscriber_count, false)
            }
            None => {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let ctx = LoopCtx {
                    client: self.client.clone(),
                    target,
                    device_id,
                    channel,
                    config: self.config.clone(),
                    cache_path: self.cache_path(device_id, channel),
                    counters: self.counters.clone(),
                };
                tokio::spawn(run_target_loop(ctx, shutdown_rx));
                inner.live.insert(
                    key,
                    TargetEntry {
                        subscriber_count: 1,
                        shutdown: shutdown_tx,
                    },
                );
                info!(device_id, channel, "preview loop started");
                (1, true)
            }
        };
        inner.subscribers.insert(subscriber_id, key);
        if let Some(hint) = client_hint {
            debug!(device_id, channel, %subscriber_id, hint = %hint, "preview subscription");
        }

        Ok(SubscribeReceipt {
            subscriber_id,
            subscriber_count,
            is_first,
        })
    }

    pub fn unsubscribe(&self, subscriber_id: Uuid) -> Result<UnsubscribeReceipt, PreviewError> {
        let mut inner = self.inner.lock().expect("service lock poisoned");
        let key = inner
            .subscribers
            .remove(&subscriber_id)
            .ok_or(PreviewError::UnknownSubscriber(subscriber_id))?;

        let Some(entry) = inner.live.get_mut(&key) else {
            return Ok(UnsubscribeReceipt { subscriber_count: 0, stopped: false });
        };
        entry.subscriber_count -= 1;
        if entry.subscriber_count > 0 {
            return Ok(UnsubscribeReceipt {
                subscriber_count: entry.subscriber_count,
                stopped: false,
            });
        }

        // Last subscriber gone: stop the loop, drop the file, forget the
        // target.  All under the same lock as the decrement.
        let entry = inner.live.remove(&key).expect("entry checked above");
        let _ = entry.shutdown.send(true);
        let (device_id, channel) = key;
        let path = self.cache_path(device_id, channel);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(device_id, channel, "cached preview deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(device_id, channel, error = %e, "cached preview delete failed"),
        }
        info!(device_id, channel, "preview loop stopped (no subscribers)");
        Ok(UnsubscribeReceipt { subscriber_count: 0, stopped: true })
    }

    /// The freshest cached frame, or the synthetic placeholder.  Never fails.
    pub async fn get_image(&self, device_id: i64, channel: u32) -> (Vec<u8>, bool) {
        match tokio::fs::read(self.cache_path(device_id, channel)).await {
            Ok(bytes) => (bytes, false),
            Err(_) => (placeholder_jpeg(), true),
        }
    }

    pub fn subscriber_count(&self, device_id: i64, channel: u32) -> usize {
        self.inner
            .lock()
            .expect("service lock poisoned")
            .live
            .get(&(device_id, channel))
            .map_or(0, |entry| entry.subscriber_count)
    }

    pub fn live_targets(&self) -> Vec<(TargetKey, usize)> {
        let inner = self.inner.lock().expect("service lock poisoned");
        let mut targets: Vec<_> = inner
            .live
            .iter()
            .map(|(&key, entry)| (key, entry.subscriber_count))
            .collect();
        targets.sort_unstable();
        targets
    }

    pub fn live_loop_count(&self) -> i64 {
        self.counters.live.load(Ordering::Acquire)
    }
}
