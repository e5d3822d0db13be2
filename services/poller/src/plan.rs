//! Tick planning.
//!
//! Each tier tick is planned as a pure function over the fetched shapes and
//! the tier's snapshot store, producing state-store writes and events to
//! submit.  The split enforces the core invariant of the poller: writes are
//! gated by the change detector, event emission is unconditional.  A failed
//! or skipped write can never suppress fan-out because the two lists are
//! built independently and applied by different code paths.

use std::collections::BTreeMap;

use af_device::{
    Channel, DeviceError, PublisherStatus, RecorderStatus, SystemIdentity, SystemStatus,
};
use af_protocol::{change_hash, EventType, IngestEvent};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::detector::{Shape, SnapshotStore};
use crate::roster::DeviceRecord;

pub const EVENT_SOURCE: &str = "poller";

// ---------------------------------------------------------------------------
// Fetched shapes
// ---------------------------------------------------------------------------

/// Fast tier: publisher status per active channel + recorder status.
/// Each shape fetch settles independently; one failure cancels nothing.
pub struct FastFetch {
    pub publishers: Vec<(u32, Result<Vec<PublisherStatus>, DeviceError>)>,
    pub recorders: Result<Vec<RecorderStatus>, DeviceError>,
}

/// Medium tier: the channel list plus per-channel publisher names.
/// Name fetches never fail (they degrade to synthetic names).
pub struct MediumFetch {
    pub channels: Result<Vec<Channel>, DeviceError>,
    pub names: Vec<(u32, BTreeMap<String, String>)>,
}

/// Slow tier: identity and system status.
pub struct SlowFetch {
    pub identity: Result<SystemIdentity, DeviceError>,
    pub status: Result<SystemStatus, DeviceError>,
}

// ---------------------------------------------------------------------------
// Planned writes
// ---------------------------------------------------------------------------

/// One canonical state-store write, keyed by the row's natural key.
#[derive(Debug, Clone, PartialEq)]
pub enum StateWrite {
    DeviceHealth {
        device_id: i64,
        status: String,
        error_count: i32,
        error: Option<String>,
        last_seen: DateTime<Utc>,
    },
    ChannelsBlob {
        device_id: i64,
        channels: Value,
    },
    PublisherStatus {
        device_id: i64,
        channel_id: i64,
        publisher_id: String,
        kind: String,
        state: String,
        started: bool,
        is_configured: bool,
    },
    PublisherName {
        device_id: i64,
        channel_id: i64,
        publisher_id: String,
        name: String,
    },
    Recorder {
        device_id: i64,
        recorder_id: String,
        name: String,
        state: String,
        description: Option<String>,
        duration: i64,
        active: i32,
        total: i32,
        multisource: bool,
    },
    Identity {
        device_id: i64,
        name: String,
        location: String,
        description: String,
    },
    SystemStatus {
        device_id: i64,
        uptime: i64,
        cpuload: f64,
        cpuload_high: bool,
        cputemp: f64,
        cputemp_threshold: f64,
    },
}

/// The outcome of planning one tick.
#[derive(Debug, Default)]
pub struct TickPlan {
    pub writes: Vec<StateWrite>,
    pub events: Vec<IngestEvent>,
    /// Shapes that failed, as `(shape label, error text)`, for logging.
    pub failures: Vec<(String, String)>,
    /// True when every shape in the tick failed: the device is unreachable
    /// and the tick counts against the consecutive-error counter.
    pub tick_failed: bool,
}

fn event(
    event_type: EventType,
    device: &str,
    channel: Option<u32>,
    publisher: Option<String>,
    data: Value,
    now: DateTime<Utc>,
) -> IngestEvent {
    let hash = change_hash(event_type, device, channel, publisher.as_deref(), &data);
    IngestEvent {
        event_type,
        device: device.to_owned(),
        channel,
        publisher,
        data,
        timestamp: now,
        source: EVENT_SOURCE.to_owned(),
        change_hash: Some(hash),
    }
}

// ---------------------------------------------------------------------------
// Fast tier
// ---------------------------------------------------------------------------

pub fn plan_fast_tick(
    device: &DeviceRecord,
    fetch: FastFetch,
    snapshots: &mut SnapshotStore,
    now: DateTime<Utc>,
) -> TickPlan {
    let mut plan = TickPlan::default();
    let mut any_ok = false;

    for (channel, result) in fetch.publishers {
        match result {
            Ok(publishers) => {
                any_ok = true;
                let snapshot = serde_json::to_value(&publishers).unwrap_or(Value::Null);
                let outcome = snapshots.observe(Shape::Publishers(channel), &snapshot);
                if outcome.needs_write() {
                    for p in &publishers {
                        plan.writes.push(StateWrite::PublisherStatus {
                            device_id: device.device_id,
                            channel_id: i64::from(channel),
                            publisher_id: p.id.clone(),
                            kind: p.kind.clone(),
                            state: p.state.as_str().to_owned(),
                            started: p.started,
                            is_configured: p.is_configured,
                        });
                    }
                }
                // One event per publisher: the finest-granularity key, so
                // publisher-, channel- and device-level subscribers all see it.
                for p in &publishers {
                    plan.events.push(event(
                        EventType::PublisherStatus,
                        &device.address,
                        Some(channel),
                        Some(p.id.clone()),
                        serde_json::to_value(p).unwrap_or(Value::Null),
                        now,
                    ));
                }
            }
            Err(err) => plan
                .failures
                .push((format!("publishers/{channel}"), err.to_string())),
        }
    }

    match fetch.recorders {
        Ok(recorders) => {
            any_ok = true;
            let snapshot = serde_json::to_value(&recorders).unwrap_or(Value::Null);
            let outcome = snapshots.observe(Shape::Recorders, &snapshot);
            if outcome.needs_write() {
                for r in &recorders {
                    plan.writes.push(StateWrite::Recorder {
                        device_id: device.device_id,
                        recorder_id: r.id.clone(),
                        name: r.name.clone(),
                        state: r.state.as_str().to_owned(),
                        description: r.description.clone(),
                        duration: i64::try_from(r.duration).unwrap_or(i64::MAX),
                        active: i32::try_from(r.active).unwrap_or(i32::MAX),
                        total: i32::try_from(r.total).unwrap_or(i32::MAX),
                        multisource: r.multisource,
                    });
                }
            }
            plan.events.push(event(
                EventType::RecorderStatus,
                &device.address,
                None,
                None,
                json!({ "recorders": recorders }),
                now,
            ));
        }
        Err(err) => plan.failures.push(("recorders".to_owned(), err.to_string())),
    }

    if any_ok {
        // Liveness: status-only diff gates the DB row, the event always goes out.
        let health = json!({ "status": "online" });
        if snapshots.observe(Shape::Health, &health).needs_write() {
            plan.writes.push(StateWrite::DeviceHealth {
                device_id: device.device_id,
                status: "online".to_owned(),
                error_count: 0,
                error: None,
                last_seen: now,
            });
        }
        plan.events.push(event(
            EventType::DeviceHealth,
            &device.address,
            None,
            None,
            json!({
                "device_id": device.device_id,
                "status": "online",
                "last_seen": now.to_rfc3339(),
            }),
            now,
        ));
    } else {
        plan.tick_failed = true;
    }

    plan
}

/// Plan for a fast tick that failed outright: persist and emit the error
/// pseudo-state so dashboards can show the device as unreachable.
pub fn plan_device_error(
    device: &DeviceRecord,
    error: &str,
    error_count: u32,
    snapshots: &mut SnapshotStore,
    now: DateTime<Utc>,
) -> TickPlan {
    let mut plan = TickPlan::default();
    plan.tick_failed = true;

    // The error row is written on every failed tick: the count and message
    // are the payload, so gating on "status changed" would lose them.
    snapshots.observe(Shape::Health, &json!({ "status": "error" }));
    plan.writes.push(StateWrite::DeviceHealth {
        device_id: device.device_id,
        status: "error".to_owned(),
        error_count: i32::try_from(error_count).unwrap_or(i32::MAX),
        error: Some(error.to_owned()),
        last_seen: now,
    });
    plan.events.push(event(
        EventType::DeviceHealth,
        &device.address,
        None,
        None,
        json!({
            "device_id": device.device_id,
            "status": "error",
            "last_seen": now.to_rfc3339(),
            "error": error,
            "error_count": error_count,
        }),
        now,
    ));
    plan
}

// ---------------------------------------------------------------------------
// Medium tier
// ---------------------------------------------------------------------------

pub fn plan_medium_tick(
    device: &DeviceRecord,
    fetch: MediumFetch,
    snapshots: &mut SnapshotStore,
    now: DateTime<Utc>,
) -> TickPlan {
    let mut plan = TickPlan::default();

    let channels = match fetch.channels {
        Ok(channels) => channels,
        Err(err) => {
            plan.failures.push(("channels".to_owned(), err.to_string()));
            plan.tick_failed = true;
            return plan;
        }
    };

    let channels_value = serde_json::to_value(&channels).unwrap_or(Value::Null);
    if snapshots.observe(Shape::Channels, &channels_value).needs_write() {
        plan.writes.push(StateWrite::ChannelsBlob {
            device_id: device.device_id,
            channels: channels_value.clone(),
        });
    }
    plan.events.push(event(
        EventType::DeviceChannels,
        &device.address,
        None,
        None,
        json!({
            "channels": channels_value,
            "channels_count": channels.len(),
        }),
        now,
    ));

    for (channel, names) in fetch.names {
        let names_value = json!({ "names": names });
        if snapshots.observe(Shape::Names(channel), &names_value).needs_write() {
            for (publisher_id, name) in &names {
                plan.writes.push(StateWrite::PublisherName {
                    device_id: device.device_id,
                    channel_id: i64::from(channel),
                    publisher_id: publisher_id.clone(),
                    name: name.clone(),
                });
            }
        }
        plan.events.push(event(
            EventType::PublisherNames,
            &device.address,
            Some(channel),
            None,
            names_value,
            now,
        ));
    }

    plan
}

// ---------------------------------------------------------------------------
// Slow tier
// ---------------------------------------------------------------------------

pub fn plan_slow_tick(
    device: &DeviceRecord,
    fetch: SlowFetch,
    snapshots: &mut SnapshotStore,
    now: DateTime<Utc>,
) -> TickPlan {
    let mut plan = TickPlan::default();
    let mut any_ok = false;

    match fetch.identity {
        Ok(identity) => {
            any_ok = true;
            let value = serde_json::to_value(&identity).unwrap_or(Value::Null);
            if snapshots.observe(Shape::Identity, &value).needs_write() {
                plan.writes.push(StateWrite::Identity {
                    device_id: device.device_id,
                    name: identity.name.clone(),
                    location: identity.location.clone(),
                    description: identity.description.clone(),
                });
            }
            plan.events.push(event(
                EventType::SystemIdentity,
                &device.address,
                None,
                None,
                value,
                now,
            ));
        }
        Err(err) => plan.failures.push(("system/ident".to_owned(), err.to_string())),
    }

    match fetch.status {
        Ok(status) => {
            any_ok = true;
            let value = serde_json::to_value(&status).unwrap_or(Value::Null);
            // The history table is append-only and unconditional; only the
            // diff (and thus nothing) is gated here.  `observe` still runs so
            // force-refresh semantics stay uniform across shapes.
            snapshots.observe(Shape::Status, &value);
            plan.writes.push(StateWrite::SystemStatus {
                device_id: device.device_id,
                uptime: i64::try_from(status.uptime).unwrap_or(i64::MAX),
                cpuload: status.cpuload,
                cpuload_high: status.cpuload_high,
                cputemp: status.cputemp,
                cputemp_threshold: status.cputemp_threshold,
            });
            plan.events.push(event(
                EventType::SystemStatus,
                &device.address,
                None,
                None,
                value,
                now,
            ));
        }
        Err(err) => plan.failures.push(("system/status".to_owned(), err.to_string())),
    }

    plan.tick_failed = !any_ok;
    plan
}
