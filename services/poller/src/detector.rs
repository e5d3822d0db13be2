//! Change detection over polled snapshots.
//!
//! Deep structural equality on JSON values, not string comparison: key
//! order never produces a spurious change.  `system_status` carries the
//! device wall clock in `date`, which is stripped before comparison so a
//! ticking clock does not count as change.
//!
//! Snapshots are owned by the tier task that polls the shape; there is no
//! cross-task snapshot sharing.

use std::collections::HashMap;

use serde_json::Value;

/// Verdict for one `(device, tier, shape)` comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    FirstSeen,
    Changed,
    Unchanged,
}

impl ChangeOutcome {
    /// State-store writes happen on first sight and on change.
    pub fn needs_write(self) -> bool {
        matches!(self, ChangeOutcome::FirstSeen | ChangeOutcome::Changed)
    }
}

/// One polled shape within a tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    /// Fast tier: publisher status for one channel.
    Publishers(u32),
    /// Fast tier: device-wide recorder status.
    Recorders,
    /// Fast tier: liveness status (`online`/`error`), nothing more.
    Health,
    /// Medium tier: the channel list.
    Channels,
    /// Medium tier: publisher names for one channel.
    Names(u32),
    /// Slow tier: system identity.
    Identity,
    /// Slow tier: system status (date-stripped for comparison).
    Status,
}

/// Last-known snapshots for the shapes one tier polls.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: HashMap<Shape, Value>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        SnapshotStore::default()
    }

    /// Compare `next` to the stored snapshot and replace it.
    pub fn observe(&mut self, shape: Shape, next: &Value) -> ChangeOutcome {
        let comparable = strip_volatile(&shape, next);
        let outcome = match self.snapshots.get(&shape) {
            None => ChangeOutcome::FirstSeen,
            Some(prior) if *prior == comparable => ChangeOutcome::Unchanged,
            Some(_) => ChangeOutcome::Changed,
        };
        self.snapshots.insert(shape, comparable);
        outcome
    }

    /// Forget everything; the next observation of every shape is first-seen,
    /// which forces a full re-write and re-emit.
    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

/// Remove fields that change on every poll without carrying information.
fn strip_volatile(shape: &Shape, value: &Value) -> Value {
    match shape {
        Shape::Status => {
            let mut v = value.clone();
            if let Value::Object(map) = &mut v {
                map.remove("date");
            }
            v
        }
        _ => value.clone(),
    }
}
