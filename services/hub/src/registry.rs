//! Subscriber fan-out registry.
//!
//! One bounded `tokio::sync::broadcast` channel per subscription key.  A
//! lagging subscriber loses the oldest entries in its own queue and nothing
//! else; publishing never blocks.  An event is published to its exact key
//! and every ancestor prefix so coarser subscriptions observe finer truth.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use af_protocol::{Event, SubscriptionKey};
use tokio::sync::broadcast;

pub type EventSender = broadcast::Sender<Arc<Event>>;

pub struct FanoutRegistry {
    queue_capacity: usize,
    channels: RwLock<HashMap<String, EventSender>>,
}

impl FanoutRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        FanoutRegistry {
            queue_capacity: queue_capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Get or lazily create the channel for a key (double-checked so the
    /// common path is a read lock).
    pub fn get_or_create(&self, key: &str) -> EventSender {
        {
            let channels = self.channels.read().expect("registry lock poisoned");
            if let Some(tx) = channels.get(key) {
                return tx.clone();
            }
        }
        let mut channels = self.channels.write().expect("registry lock poisoned");
        if let Some(tx) = channels.get(key) {
            return tx.clone();
        }
        let (tx, _rx) = broadcast::channel(self.queue_capacity);
        channels.insert(key.to_owned(), tx.clone());
        tx
    }

    /// Deliver to the event's exact key and each ancestor prefix.  Returns
    /// the number of subscriber queues reached.
    pub fn publish(&self, key: &SubscriptionKey, event: &Arc<Event>) -> usize {
        let channels = self.channels.read().expect("registry lock poisoned");
        let mut reached = 0;
        for candidate in key.self_and_ancestors() {
            if let Some(tx) = channels.get(&candidate.to_string()) {
                reached += tx.send(event.clone()).unwrap_or(0);
            }
        }
        reached
    }

    /// Drop channels nobody listens to; called from the sweep timer.
    pub fn prune_idle(&self) -> usize {
        let mut channels = self.channels.write().expect("registry lock poisoned");
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().expect("registry lock poisoned").len()
    }

    /// Total live receivers across keys (a client counts once per key).
    pub fn subscription_count(&self) -> usize {
        self.channels
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(broadcast::Sender::receiver_count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_protocol::EventType;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_event() -> Arc<Event> {
        Arc::new(Event {
            event_id: Uuid::new_v4(),
            event_type: EventType::PublisherStatus,
            device: "10.0.0.2".to_owned(),
            channel: Some(1),
            publisher: Some("rtmp1".to_owned()),
            data: json!({"state": "started"}),
            change_hash: "00000000000000000000000000000000".to_owned(),
            event_timestamp: Utc::now(),
            created_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn exact_and_prefix_subscribers_both_receive() {
        let registry = FanoutRegistry::new(16);
        let mut exact = registry
            .get_or_create("publisher_status:10.0.0.2:1:rtmp1")
            .subscribe();
        let mut channel_level = registry.get_or_create("publisher_status:10.0.0.2:1").subscribe();
        let mut device_level = registry.get_or_create("publisher_status:10.0.0.2").subscribe();
        let mut unrelated = registry.get_or_create("publisher_status:10.0.0.3").subscribe();

        let event = sample_event();
        let key = event.key().unwrap();
        let reached = registry.publish(&key, &event);
        assert_eq!(reached, 3);

        assert_eq!(exact.recv().await.unwrap().change_hash, event.change_hash);
        assert!(channel_level.recv().await.is_ok());
        assert!(device_level.recv().await.is_ok());
        assert!(unrelated.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_for_the_laggard_only() {
        let registry = FanoutRegistry::new(2);
        let tx = registry.get_or_create("k");
        let mut rx = tx.subscribe();

        let sender = registry.get_or_create("k");
        for _ in 0..5 {
            let _ = sender.send(sample_event());
        }
        // Two newest survive; the lag is reported, then delivery resumes.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected Lagged, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn prune_drops_only_idle_channels() {
        let registry = FanoutRegistry::new(4);
        let _live = registry.get_or_create("live").subscribe();
        registry.get_or_create("idle");

        assert_eq!(registry.channel_count(), 2);
        assert_eq!(registry.prune_idle(), 1);
        assert_eq!(registry.channel_count(), 1);
        assert_eq!(registry.subscription_count(), 1);
    }
}
