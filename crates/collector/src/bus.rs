//! Topic based progress bus.
//!
//! One `tokio::sync::broadcast` channel per topic, created on first use.
//! Delivery is fire-and-forget: subscribers only see events published after
//! they subscribed, and a topic's events arrive in publish order.

use crate::events::{BusEvent, ProgressEvent};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Topic carrying requests for the pipeline engine.
pub const PIPELINE_TOPIC: &str = "pipeline";

/// Topic on which the engine answers the job queue.
pub const QUEUE_TOPIC: &str = "queue";

/// Default buffer capacity per topic.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Topic observers subscribe to for one title.
pub fn title_topic(title_id: &str) -> String {
    format!("title:{}", title_id)
}

/// Fan-out bus keyed by topic name.
#[derive(Debug)]
pub struct ProgressBus {
    topics: DashMap<String, broadcast::Sender<BusEvent>>,
    capacity: usize,
}

impl ProgressBus {
    /// When a topic's buffer is full the oldest events are dropped and slow
    /// receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Deliver `event` to every current subscriber of `topic`.
    ///
    /// Returns the number of receivers reached; zero is not an error.
    pub fn publish(&self, topic: &str, event: BusEvent) -> usize {
        let sender = match self.topics.get(topic) {
            Some(sender) => sender.clone(),
            None => {
                trace!(topic, "publish to topic without subscribers");
                return 0;
            }
        };
        match sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                // Every receiver is gone; forget the topic unless someone
                // subscribed again in the meantime.
                self.topics
                    .remove_if(topic, |_, sender| sender.receiver_count() == 0);
                0
            }
        }
    }

    /// Shorthand for publishing a [`ProgressEvent`] on a title topic.
    pub fn publish_progress(&self, title_id: &str, event: ProgressEvent) -> usize {
        self.publish(&title_topic(title_id), BusEvent::Progress(event))
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
