//! Event submission to the hub.
//!
//! Fire-and-forget with bounded parallelism.  A failed submission is logged
//! and dropped: the next tick re-emits the same current truth, so retrying
//! here would only reorder the stream.

use af_protocol::IngestEvent;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

/// At most this many in-flight POSTs per tick.
const SUBMIT_CONCURRENCY: usize = 8;

#[derive(Clone)]
pub struct EventSink {
    http: reqwest::Client,
    ingest_url: String,
}

impl EventSink {
    pub fn new(ingest_url: String, timeout: std::time::Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(EventSink { http, ingest_url })
    }

    /// Submit a tick's events; returns how many were accepted.
    pub async fn submit(&self, events: Vec<IngestEvent>) -> u64 {
        let accepted = stream::iter(events)
            .map(|event| {
                let http = self.http.clone();
                let url = self.ingest_url.clone();
                async move {
                    match http.post(&url).json(&event).send().await {
                        Ok(response) if response.status().is_success() => true,
                        Ok(response) => {
                            warn!(
                                status = response.status().as_u16(),
                                event_type = %event.event_type,
                                device = %event.device,
                                "hub rejected event"
                            );
                            false
                        }
                        Err(e) => {
                            debug!(error = %e, event_type = %event.event_type,
                                   device = %event.device, "event submission failed");
                            false
                        }
                    }
                }
            })
            .buffer_unordered(SUBMIT_CONCURRENCY)
            .filter(|ok| std::future::ready(*ok))
            .count()
            .await;
        accepted as u64
    }
}
