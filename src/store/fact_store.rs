//! Versioned key/value fact store with pattern-based query and a
//! bounded-queue subscriber fan-out (spec §4.1).
//!
//! Indexing follows a bucket-by-segment-arity design: every stored key is
//! also recorded under `(segment_count, key)` so a wildcard query of arity
//! `n` only scans the `n`-bucket instead of the whole store.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{EngineError, EngineResult};
use crate::model::{Fact, FactChangeKind};
use crate::pattern;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<(Fact, FactChangeKind)>,
    dropped: std::sync::atomic::AtomicU64,
}

struct Inner {
    facts: HashMap<String, Fact>,
    /// arity → set of keys with that many `:`-separated segments.
    arity_index: HashMap<usize, HashSet<String>>,
}

pub struct FactStore {
    inner: RwLock<Inner>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscriber_id: std::sync::atomic::AtomicU64,
    now_fn: fn() -> i64,
}

/// A live subscription handle; dropping it does not unsubscribe — callers
/// must call [`FactStore::unsubscribe`] with the id, mirroring the spec's
/// explicit `subscribe(callback) → unsubscribe` contract.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<(Fact, FactChangeKind)>,
}

impl FactStore {
    pub fn new(now_fn: fn() -> i64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                facts: HashMap::new(),
                arity_index: HashMap::new(),
            }),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: std::sync::atomic::AtomicU64::new(1),
            now_fn,
        }
    }

    fn now(&self) -> i64 {
        (self.now_fn)()
    }

    pub fn set(&self, key: &str, value: Value, source: &str) -> EngineResult<Fact> {
        if key.is_empty() {
            return Err(EngineError::invalid_argument("fact key must not be empty"));
        }
        let now = self.now();
        let (fact, kind) = {
            let mut inner = self.inner.write().unwrap();
            let fact = match inner.facts.get(key) {
                Some(existing) => Fact {
                    key: key.to_string(),
                    value,
                    timestamp: now.max(existing.timestamp),
                    source: source.to_string(),
                    version: existing.version + 1,
                },
                None => Fact::new(key, value, source, now),
            };
            inner
                .arity_index
                .entry(pattern::segment_count(key))
                .or_default()
                .insert(key.to_string());
            inner.facts.insert(key.to_string(), fact.clone());
            (fact, FactChangeKind::Set)
        };
        self.notify(fact.clone(), kind);
        Ok(fact)
    }

    pub fn get(&self, key: &str) -> Option<Fact> {
        self.inner.read().unwrap().facts.get(key).cloned()
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().unwrap();
            let removed = inner.facts.remove(key);
            if removed.is_some() {
                let arity = pattern::segment_count(key);
                if let Some(bucket) = inner.arity_index.get_mut(&arity) {
                    bucket.remove(key);
                }
            }
            removed
        };
        match removed {
            Some(fact) => {
                self.notify(fact, FactChangeKind::Delete);
                true
            }
            None => false,
        }
    }

    /// Query by pattern: exact patterns bypass the arity scan entirely;
    /// wildcard patterns scan only the bucket matching their segment count.
    pub fn query(&self, pattern: &str) -> Vec<Fact> {
        let inner = self.inner.read().unwrap();
        if pattern::is_exact(pattern) {
            return inner.facts.get(pattern).cloned().into_iter().collect();
        }
        let arity = pattern::segment_count(pattern);
        let Some(bucket) = inner.arity_index.get(&arity) else {
            return Vec::new();
        };
        bucket
            .iter()
            .filter(|key| pattern::matches_fixed_arity(pattern, key))
            .filter_map(|key| inner.facts.get(key).cloned())
            .collect()
    }

    pub fn filter(&self, predicate: impl Fn(&Fact) -> bool) -> Vec<Fact> {
        self.inner
            .read()
            .unwrap()
            .facts
            .values()
            .filter(|f| predicate(f))
            .cloned()
            .collect()
    }

    pub fn get_all(&self) -> Vec<Fact> {
        self.inner.read().unwrap().facts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to fact changes. The returned receiver's queue is bounded
    /// and drops the oldest pending notification if a subscriber falls
    /// behind, so a slow subscriber never stalls `set`/`delete`.
    pub fn subscribe(&self) -> Subscription {
        let id = self
            .next_subscriber_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers.write().unwrap().push(Subscriber {
            id,
            tx,
            dropped: std::sync::atomic::AtomicU64::new(0),
        });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().unwrap().retain(|s| s.id != id);
    }

    fn notify(&self, fact: Fact, kind: FactChangeKind) {
        let subscribers = self.subscribers.read().unwrap();
        for sub in subscribers.iter() {
            match sub.tx.try_send((fact.clone(), kind)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tracing::warn!(subscriber_id = sub.id, "fact store subscriber queue full, dropping notification");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixed_now() -> i64 {
        1_000
    }

    #[test]
    fn set_increments_version_and_get_reflects_latest_value() {
        let store = FactStore::new(fixed_now);
        let fact = store.set("user:last", json!("U1"), "test").unwrap();
        assert_eq!(fact.version, 1);
        let fact2 = store.set("user:last", json!("U2"), "test").unwrap();
        assert_eq!(fact2.version, 2);
        assert_eq!(store.get("user:last").unwrap().value, json!("U2"));
    }

    #[test]
    fn empty_key_is_rejected() {
        let store = FactStore::new(fixed_now);
        assert!(store.set("", json!(1), "test").is_err());
    }

    #[test]
    fn delete_removes_key_and_index() {
        let store = FactStore::new(fixed_now);
        store.set("k", json!(1), "test").unwrap();
        assert!(store.delete("k"));
        assert!(store.get("k").is_none());
        assert!(!store.delete("k"));
    }

    #[test]
    fn wildcard_query_scans_only_matching_arity() {
        let store = FactStore::new(fixed_now);
        store.set("user:1:name", json!("a"), "t").unwrap();
        store.set("user:2:name", json!("b"), "t").unwrap();
        store.set("user:1", json!("c"), "t").unwrap();

        let results = store.query("user:*:name");
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn exact_pattern_bypasses_scan() {
        let store = FactStore::new(fixed_now);
        store.set("user:1", json!("a"), "t").unwrap();
        let results = store.query("user:1");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value, json!("a"));
    }

    #[tokio::test]
    async fn subscribers_receive_set_and_delete() {
        let store = FactStore::new(fixed_now);
        let mut sub = store.subscribe();
        store.set("k", json!(1), "t").unwrap();
        store.delete("k");

        let (fact, kind) = sub.rx.recv().await.unwrap();
        assert_eq!(fact.key, "k");
        assert_eq!(kind, FactChangeKind::Set);

        let (_, kind) = sub.rx.recv().await.unwrap();
        assert_eq!(kind, FactChangeKind::Delete);
    }

    #[test]
    fn unsubscribe_stops_further_notifications() {
        let store = FactStore::new(fixed_now);
        let sub = store.subscribe();
        store.unsubscribe(sub.id);
        store.set("k", json!(1), "t").unwrap();
        assert_eq!(store.subscribers.read().unwrap().len(), 0);
    }
}
