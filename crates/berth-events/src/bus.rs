//! Topic-partitioned broadcast bus
//!
//! Each topic owns one bounded broadcast channel. A subscriber that falls
//! behind loses the oldest unread events on that topic; the loss is counted
//! rather than blocking the publisher.

use berth_types::{BerthEvent, EventEnvelope, EventSource, Topic};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default per-subscriber queue capacity
pub const DEFAULT_CAPACITY: usize = 1024;

/// Bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events buffered per subscriber and topic before the oldest is dropped
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Default)]
struct BusStats {
    published: AtomicU64,
    backpressure: AtomicU64,
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMetrics {
    pub published: u64,
    pub backpressure: u64,
}

/// In-process publish/subscribe bus
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<HashMap<Topic, broadcast::Sender<EventEnvelope>>>,
    stats: Arc<BusStats>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let capacity = config.capacity.max(1);
        let channels = Topic::ALL
            .iter()
            .map(|topic| (*topic, broadcast::channel(capacity).0))
            .collect();
        Self {
            channels: Arc::new(channels),
            stats: Arc::new(BusStats::default()),
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<EventEnvelope> {
        // Every topic gets a channel in `new`.
        &self.channels[&topic]
    }

    /// Publish an event on its topic.
    ///
    /// Never blocks. Returns the number of subscribers that will see it.
    pub fn publish(&self, event: BerthEvent, source: EventSource) -> usize {
        let envelope = EventEnvelope::new(event, source);
        let topic = envelope.topic();
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        match self.sender(topic).send(envelope) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(%topic, "Published event with no subscribers");
                0
            }
        }
    }

    /// Subscribe to a single topic.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic,
            rx: self.sender(topic).subscribe(),
            stats: self.stats.clone(),
            dropped: 0,
        }
    }

    /// Merge several topics into one stream.
    ///
    /// Ordering holds within a topic but not across topics.
    pub fn subscribe_many(&self, topics: &[Topic]) -> BoxStream<'static, EventEnvelope> {
        let streams: Vec<_> = topics
            .iter()
            .map(|topic| self.subscribe(*topic).into_stream())
            .collect();
        stream::select_all(streams).boxed()
    }

    /// Drop a subscription.
    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!(
            topic = %subscription.topic,
            dropped = subscription.dropped,
            "Unsubscribed"
        );
        drop(subscription);
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.sender(topic).receiver_count()
    }

    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            published: self.stats.published.load(Ordering::Relaxed),
            backpressure: self.stats.backpressure.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Handle for one subscriber on one topic
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<EventEnvelope>,
    stats: Arc<BusStats>,
    dropped: u64,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Events this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn record_lag(&mut self, n: u64) {
        self.dropped += n;
        self.stats.backpressure.fetch_add(n, Ordering::Relaxed);
        warn!(topic = %self.topic, lagged = n, "Subscriber fell behind, oldest events dropped");
    }

    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => self.record_lag(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(_) => return None,
            }
        }
    }

    /// Turn the subscription into a lazy stream of events.
    pub fn into_stream(self) -> BoxStream<'static, EventEnvelope> {
        stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_types::InstanceId;

    fn removed(name: &str) -> BerthEvent {
        BerthEvent::SpecRemoved {
            service: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(Topic::SpecRemoved);
        assert_eq!(bus.publish(removed("web"), EventSource::Reconciler), 1);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event, removed("web"));
        assert_eq!(bus.metrics().published, 1);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::default();
        let mut health = bus.subscribe(Topic::HealthChanged);
        bus.publish(removed("web"), EventSource::Reconciler);
        assert!(health.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_counts() {
        let bus = EventBus::new(BusConfig { capacity: 4 });
        let mut slow = bus.subscribe(Topic::SpecRemoved);
        for i in 0..10 {
            bus.publish(removed(&format!("svc-{i}")), EventSource::Reconciler);
        }

        let first = slow.recv().await.unwrap();
        assert_eq!(first.event.service(), "svc-6");
        assert_eq!(slow.dropped(), 6);
        assert_eq!(bus.metrics().backpressure, 6);

        let rest: Vec<_> = std::iter::from_fn(|| slow.try_recv())
            .map(|e| e.event.service().to_string())
            .collect();
        assert_eq!(rest, vec!["svc-7", "svc-8", "svc-9"]);
    }

    #[tokio::test]
    async fn test_publisher_never_blocks_without_subscribers() {
        let bus = EventBus::new(BusConfig { capacity: 1 });
        for _ in 0..100 {
            assert_eq!(bus.publish(removed("web"), EventSource::Reconciler), 0);
        }
        assert_eq!(bus.metrics().published, 100);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_receiver() {
        let bus = EventBus::default();
        let sub = bus.subscribe(Topic::HealthChanged);
        assert_eq!(bus.subscriber_count(Topic::HealthChanged), 1);
        bus.unsubscribe(sub);
        assert_eq!(bus.subscriber_count(Topic::HealthChanged), 0);
    }

    #[tokio::test]
    async fn test_merged_stream_preserves_per_topic_order() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe_many(&[Topic::SpecRemoved, Topic::SpecApplied]);
        let id = InstanceId::generate();
        for generation in 1..=3 {
            bus.publish(
                BerthEvent::SpecApplied {
                    service: "web".into(),
                    instance_id: id.clone(),
                    generation,
                },
                EventSource::Reconciler,
            );
        }
        bus.publish(removed("web"), EventSource::Reconciler);

        let mut generations = Vec::new();
        let mut saw_removed = false;
        for _ in 0..4 {
            match stream.next().await.unwrap().event {
                BerthEvent::SpecApplied { generation, .. } => generations.push(generation),
                BerthEvent::SpecRemoved { .. } => saw_removed = true,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(generations, vec![1, 2, 3]);
        assert!(saw_removed);
    }
}
