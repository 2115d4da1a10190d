//! Bounded fan-out of [`AuditEntry`] trace events to subscribers, mirroring
//! the drop-oldest backpressure policy used by [`crate::store::fact_store::FactStore`]'s
//! subscriber queues (spec §4.9 "slow subscribers must not block producers").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::model::AuditEntry;

const TRACE_QUEUE_CAPACITY: usize = 512;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<AuditEntry>,
    dropped: AtomicU64,
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<AuditEntry>,
}

#[derive(Default)]
pub struct TraceBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl TraceBus {
    pub fn new() -> Self {
        Self { subscribers: RwLock::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(TRACE_QUEUE_CAPACITY);
        self.subscribers.write().unwrap().push(Subscriber { id, tx, dropped: AtomicU64::new(0) });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().unwrap().retain(|s| s.id != id);
    }

    pub fn publish(&self, entry: &AuditEntry) {
        let subscribers = self.subscribers.read().unwrap();
        for sub in subscribers.iter() {
            match sub.tx.try_send(entry.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(subscriber_id = sub.id, "trace bus subscriber queue full, dropping entry");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}
