//! The source-side event log.
//!
//! A bounded ring per subscription key with TTL expiry, serving catch-up for
//! reconnecting clients, plus the producer-side dedup window.  This is the
//! only stateful piece of the bus; the fan-out path past it is cache-free.
//!
//! One mutex guards the whole log.  Critical sections are short (append,
//! prune, clone-out) and the ingest path holds the lock across append +
//! broadcast so per-key ordering is a structural property, not a protocol.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use af_protocol::Event;
use chrono::{DateTime, Utc};

/// Outcome of offering an event to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Same `(key, change_hash)` seen within the dedup window; discarded.
    Duplicate,
}

pub struct EventLog {
    ring_capacity: usize,
    ttl: Duration,
    dedup_window: Duration,
    rings: HashMap<String, VecDeque<Arc<Event>>>,
    /// `(exact key, change_hash)` -> last time seen.
    recent_hashes: HashMap<(String, String), Instant>,
}

impl EventLog {
    pub fn new(ring_capacity: usize, ttl: Duration, dedup_window: Duration) -> Self {
        EventLog {
            ring_capacity: ring_capacity.max(1),
            ttl,
            dedup_window,
            rings: HashMap::new(),
            recent_hashes: HashMap::new(),
        }
    }

    /// Offer an event under its exact key.  Duplicates within the window are
    /// discarded at this producer-side gate and nowhere else.
    pub fn offer(&mut self, key: &str, event: Arc<Event>) -> InsertOutcome {
        let now = Instant::now();
        let dedup_key = (key.to_owned(), event.change_hash.clone());
        if let Some(&seen_at) = self.recent_hashes.get(&dedup_key) {
            if now.duration_since(seen_at) < self.dedup_window {
                return InsertOutcome::Duplicate;
            }
        }
        self.recent_hashes.insert(dedup_key, now);
        // The hash window stays small by construction; prune opportunistically.
        if self.recent_hashes.len() > 4096 {
            let window = self.dedup_window;
            self.recent_hashes.retain(|_, &mut t| now.duration_since(t) < window);
        }

        let ring = self.rings.entry(key.to_owned()).or_default();
        if ring.len() == self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(event);
        self.prune_ring(key, Utc::now());
        InsertOutcome::Inserted
    }

    /// All unexpired events for a key, oldest first.
    pub fn latest_for_key(&mut self, key: &str, now: DateTime<Utc>) -> Vec<Arc<Event>> {
        self.prune_ring(key, now);
        self.rings
            .get(key)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest unexpired event per key for a device, across all types.
    pub fn latest_per_device(&mut self, device: &str, now: DateTime<Utc>) -> Vec<Arc<Event>> {
        self.latest_matching(now, |event| event.device == device)
    }

    /// Latest unexpired event per key for one `(device, channel)`.
    pub fn latest_for_channel(
        &mut self,
        device: &str,
        channel: u32,
        now: DateTime<Utc>,
    ) -> Vec<Arc<Event>> {
        self.latest_matching(now, |event| {
            event.device == device && event.channel == Some(channel)
        })
    }

    fn latest_matching(
        &mut self,
        now: DateTime<Utc>,
        predicate: impl Fn(&Event) -> bool,
    ) -> Vec<Arc<Event>> {
        self.purge_expired(now);
        let mut latest: Vec<Arc<Event>> = self
            .rings
            .values()
            .filter_map(|ring| ring.iter().rev().find(|e| predicate(e)).cloned())
            .collect();
        latest.sort_by_key(|e| e.created_at);
        latest
    }

    /// Drop every expired event; called on a timer and before reads.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(30));
        let cutoff = now - ttl;
        self.rings.retain(|_, ring| {
            while ring.front().is_some_and(|e| e.created_at < cutoff) {
                ring.pop_front();
            }
            !ring.is_empty()
        });
    }

    fn prune_ring(&mut self, key: &str, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(30));
        let cutoff = now - ttl;
        if let Some(ring) = self.rings.get_mut(key) {
            while ring.front().is_some_and(|e| e.created_at < cutoff) {
                ring.pop_front();
            }
            if ring.is_empty() {
                self.rings.remove(key);
            }
        }
    }

    pub fn key_count(&self) -> usize {
        self.rings.len()
    }

    pub fn event_count(&self) -> usize {
        self.rings.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_protocol::EventType;
    use serde_json::json;
    use uuid::Uuid;

    fn event(hash: &str, created_at: DateTime<Utc>) -> Arc<Event> {
        Arc::new(Event {
            event_id: Uuid::new_v4(),
            event_type: EventType::PublisherStatus,
            device: "10.0.0.2".to_owned(),
            channel: Some(1),
            publisher: Some("rtmp1".to_owned()),
            data: json!({"state": "started"}),
            change_hash: hash.to_owned(),
            event_timestamp: created_at,
            created_at,
        })
    }

    fn log() -> EventLog {
        EventLog::new(100, Duration::from_secs(30), Duration::from_millis(500))
    }

    const KEY: &str = "publisher_status:10.0.0.2:1:rtmp1";

    #[test]
    fn duplicate_hash_within_window_is_discarded() {
        let mut log = log();
        let now = Utc::now();
        assert_eq!(log.offer(KEY, event("h1", now)), InsertOutcome::Inserted);
        assert_eq!(log.offer(KEY, event("h1", now)), InsertOutcome::Duplicate);
        assert_eq!(log.event_count(), 1);
    }

    #[test]
    fn same_hash_on_a_different_key_is_not_a_duplicate() {
        let mut log = log();
        let now = Utc::now();
        assert_eq!(log.offer(KEY, event("h1", now)), InsertOutcome::Inserted);
        assert_eq!(
            log.offer("publisher_status:10.0.0.3:1:rtmp1", event("h1", now)),
            InsertOutcome::Inserted
        );
    }

    #[test]
    fn different_hash_is_inserted() {
        let mut log = log();
        let now = Utc::now();
        log.offer(KEY, event("h1", now));
        assert_eq!(log.offer(KEY, event("h2", now)), InsertOutcome::Inserted);
        assert_eq!(log.event_count(), 2);
    }

    #[test]
    fn ring_is_bounded_dropping_oldest() {
        let mut log = EventLog::new(3, Duration::from_secs(30), Duration::from_millis(1));
        let now = Utc::now();
        for i in 0..5 {
            log.offer(KEY, event(&format!("h{i}"), now));
            // Step past the dedup window between offers.
            std::thread::sleep(Duration::from_millis(2));
        }
        let events = log.latest_for_key(KEY, now);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].change_hash, "h2");
        assert_eq!(events[2].change_hash, "h4");
    }

    #[test]
    fn expired_events_vanish_from_catch_up() {
        let mut log = log();
        let now = Utc::now();
        log.offer(KEY, event("old", now - chrono::Duration::seconds(31)));
        log.offer(KEY, event("fresh", now));
        let events = log.latest_for_key(KEY, now);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_hash, "fresh");
    }

    #[test]
    fn recent_event_survives_for_reconnect_within_ttl() {
        let mut log = log();
        let emitted = Utc::now();
        log.offer(KEY, event("h1", emitted));
        // Client reconnects 5 seconds later (TTL 30s).
        let events = log.latest_for_key(KEY, emitted + chrono::Duration::seconds(5));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn latest_per_device_takes_newest_of_each_key() {
        let mut log = log();
        let now = Utc::now();
        log.offer(KEY, event("h1", now - chrono::Duration::seconds(2)));
        log.offer(KEY, event("h2", now - chrono::Duration::seconds(1)));
        let mut other = (*event("h3", now)).clone();
        other.channel = Some(2);
        log.offer("publisher_status:10.0.0.2:2", Arc::new(other));

        let latest = log.latest_per_device("10.0.0.2", now);
        assert_eq!(latest.len(), 2);
        assert!(latest.iter().any(|e| e.change_hash == "h2"));
        assert!(latest.iter().any(|e| e.change_hash == "h3"));
        assert!(!latest.iter().any(|e| e.change_hash == "h1"));
    }

    #[test]
    fn latest_for_channel_filters_on_channel() {
        let mut log = log();
        let now = Utc::now();
        log.offer(KEY, event("h1", now));
        let latest = log.latest_for_channel("10.0.0.2", 1, now);
        assert_eq!(latest.len(), 1);
        assert!(log.latest_for_channel("10.0.0.2", 9, now).is_empty());
    }
}
