//! Shared runtime bookkeeping.
//!
//! One `DeviceRuntime` per live device context; the registry maps device ids
//! to runtimes and carries the service-wide counters the admin surface
//! reports.  Tier tasks own their snapshots; the runtime only holds the
//! state that genuinely crosses tiers: the consecutive-error counter, the
//! active-channel list (medium writes, fast reads) and the force-refresh
//! generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use crate::roster::DeviceRecord;

#[derive(Debug)]
pub struct DeviceRuntime {
    pub record: DeviceRecord,
    /// Consecutive failed ticks across tiers; fast-tier success resets it.
    error_count: AtomicU32,
    /// Bumped by force-refresh; tier loops clear their snapshots when it moves.
    pub refresh_gen: AtomicU64,
    pub in_backoff: AtomicBool,
    active_channels: RwLock<Vec<u32>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl DeviceRuntime {
    pub fn new(record: DeviceRecord) -> Self {
        DeviceRuntime {
            record,
            error_count: AtomicU32::new(0),
            refresh_gen: AtomicU64::new(0),
            in_backoff: AtomicBool::new(false),
            active_channels: RwLock::new(Vec::new()),
            last_success: Mutex::new(None),
        }
    }

    pub fn record_error(&self) -> u32 {
        self.error_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_success(&self, now: DateTime<Utc>) {
        self.error_count.store(0, Ordering::Release);
        *self.last_success.lock().expect("last_success lock poisoned") = Some(now);
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock().expect("last_success lock poisoned")
    }

    pub fn active_channels(&self) -> Vec<u32> {
        self.active_channels
            .read()
            .expect("active_channels lock poisoned")
            .clone()
    }

    pub fn set_active_channels(&self, channels: Vec<u32>) {
        *self
            .active_channels
            .write()
            .expect("active_channels lock poisoned") = channels;
    }

    pub fn force_refresh(&self) {
        self.refresh_gen.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    devices: RwLock<HashMap<i64, Arc<DeviceRuntime>>>,
    pub ticks_total: AtomicU64,
    pub ticks_failed: AtomicU64,
    pub writes_applied: AtomicU64,
    pub writes_failed: AtomicU64,
    pub events_submitted: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a runtime; refuses a second live context for the same device.
    pub fn insert(&self, runtime: Arc<DeviceRuntime>) -> bool {
        let mut devices = self.devices.write().expect("registry lock poisoned");
        if devices.contains_key(&runtime.record.device_id) {
            return false;
        }
        devices.insert(runtime.record.device_id, runtime);
        true
    }

    pub fn remove(&self, device_id: i64) -> Option<Arc<DeviceRuntime>> {
        self.devices
            .write()
            .expect("registry lock poisoned")
            .remove(&device_id)
    }

    pub fn get(&self, device_id: i64) -> Option<Arc<DeviceRuntime>> {
        self.devices
            .read()
            .expect("registry lock poisoned")
            .get(&device_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<DeviceRuntime>> {
        let mut runtimes: Vec<_> = self
            .devices
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        runtimes.sort_by_key(|r| r.record.device_id);
        runtimes
    }

    /// Bump refresh generations.  `address` of `None` refreshes the fleet;
    /// returns how many devices matched.
    pub fn force_refresh(&self, address: Option<&str>) -> usize {
        let devices = self.devices.read().expect("registry lock poisoned");
        let mut refreshed = 0;
        for runtime in devices.values() {
            if address.is_none_or(|a| a == runtime.record.address) {
                runtime.force_refresh();
                refreshed += 1;
            }
        }
        refreshed
    }
}
