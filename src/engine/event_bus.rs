//! Engine-level event subscriptions (spec §4.10 "subscribe(topicPattern,
//! callback)"), reusing the bounded drop-oldest fan-out idiom shared by
//! [`crate::store::fact_store::FactStore`] and [`crate::audit::TraceBus`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::model::Event;
use crate::pattern;

const EVENT_QUEUE_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    topic_pattern: String,
    tx: mpsc::Sender<Event>,
    dropped: AtomicU64,
}

pub struct EventSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self { subscribers: RwLock::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    pub fn subscribe(&self, topic_pattern: impl Into<String>) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        self.subscribers.write().unwrap().push(Subscriber {
            id,
            topic_pattern: topic_pattern.into(),
            tx,
            dropped: AtomicU64::new(0),
        });
        EventSubscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().unwrap().retain(|s| s.id != id);
    }

    pub fn publish(&self, event: &Event) {
        let subscribers = self.subscribers.read().unwrap();
        for sub in subscribers.iter().filter(|s| pattern::matches(&s.topic_pattern, &event.topic)) {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(subscriber_id = sub.id, "event bus subscriber queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn event(topic: &str) -> Event {
        Event {
            id: "e1".to_string(),
            topic: topic.to_string(),
            data: Map::new(),
            timestamp: 0,
            source: "test".to_string(),
            correlation_id: None,
            causation_id: None,
        }
    }

    #[tokio::test]
    async fn subscriber_only_sees_matching_topics() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("user.*");
        bus.publish(&event("order.created"));
        bus.publish(&event("user.created"));
        let received = sub.rx.recv().await.unwrap();
        assert_eq!(received.topic, "user.created");
    }
}
