//! Bounded recent-event log keyed by id, topic, and correlation (spec §4.2).

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::model::Event;
use crate::pattern;

#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    pub max_events: usize,
    pub max_age_ms: i64,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            max_age_ms: 24 * 3_600_000,
        }
    }
}

struct Inner {
    by_id: HashMap<String, Event>,
    /// Insertion order, source of truth for pruning and per-topic ordering.
    order: VecDeque<String>,
    by_topic: HashMap<String, Vec<String>>,
    by_correlation: HashMap<String, Vec<String>>,
}

pub struct EventStore {
    inner: RwLock<Inner>,
    config: EventStoreConfig,
    now_fn: fn() -> i64,
}

impl EventStore {
    pub fn new(config: EventStoreConfig, now_fn: fn() -> i64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                order: VecDeque::new(),
                by_topic: HashMap::new(),
                by_correlation: HashMap::new(),
            }),
            config,
            now_fn,
        }
    }

    pub fn store(&self, event: Event) {
        let mut inner = self.inner.write().unwrap();
        inner.order.push_back(event.id.clone());
        inner
            .by_topic
            .entry(event.topic.clone())
            .or_default()
            .push(event.id.clone());
        if let Some(corr) = &event.correlation_id {
            inner.by_correlation.entry(corr.clone()).or_default().push(event.id.clone());
        }
        inner.by_id.insert(event.id.clone(), event);

        if inner.by_id.len() > self.config.max_events {
            let evict = (self.config.max_events / 10).max(1);
            Self::evict_oldest(&mut inner, evict);
        }
    }

    fn evict_oldest(inner: &mut Inner, count: usize) {
        for _ in 0..count {
            let Some(id) = inner.order.pop_front() else { break };
            Self::remove_id(inner, &id);
        }
    }

    fn remove_id(inner: &mut Inner, id: &str) {
        if let Some(event) = inner.by_id.remove(id) {
            if let Some(topic_list) = inner.by_topic.get_mut(&event.topic) {
                topic_list.retain(|x| x != id);
            }
            if let Some(corr) = &event.correlation_id {
                if let Some(corr_list) = inner.by_correlation.get_mut(corr) {
                    corr_list.retain(|x| x != id);
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Event> {
        self.inner.read().unwrap().by_id.get(id).cloned()
    }

    pub fn get_by_topic(&self, topic: &str) -> Vec<Event> {
        let inner = self.inner.read().unwrap();
        inner
            .by_topic
            .get(topic)
            .map(|ids| ids.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn get_by_topic_pattern(&self, glob: &str) -> Vec<Event> {
        let inner = self.inner.read().unwrap();
        // Insertion order across the whole store, filtered by topic match.
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|e| pattern::matches(glob, &e.topic))
            .cloned()
            .collect()
    }

    pub fn get_by_correlation(&self, correlation_id: &str) -> Vec<Event> {
        let inner = self.inner.read().unwrap();
        inner
            .by_correlation
            .get(correlation_id)
            .map(|ids| ids.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn get_in_time_range(&self, topic: &str, from: i64, to: i64) -> Vec<Event> {
        self.get_by_topic(topic)
            .into_iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .collect()
    }

    pub fn count_in_window(&self, topic: &str, window_ms: i64) -> usize {
        let now = (self.now_fn)();
        self.get_in_time_range(topic, now - window_ms, now).len()
    }

    /// Remove every event older than `max_age_ms`. Returns the number pruned.
    pub fn prune(&self, max_age_ms: i64) -> usize {
        let now = (self.now_fn)();
        let cutoff = now - max_age_ms;
        let mut inner = self.inner.write().unwrap();
        let stale: Vec<String> = inner
            .order
            .iter()
            .filter(|id| inner.by_id.get(*id).map(|e| e.timestamp < cutoff).unwrap_or(false))
            .cloned()
            .collect();
        let n = stale.len();
        for id in &stale {
            Self::remove_id(&mut inner, id);
        }
        inner.order.retain(|id| !stale.contains(id));
        n
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.by_id.clear();
        inner.order.clear();
        inner.by_topic.clear();
        inner.by_correlation.clear();
    }

    pub fn size(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn fixed_now() -> i64 {
        10_000
    }

    fn event(id: &str, topic: &str, ts: i64, corr: Option<&str>) -> Event {
        Event {
            id: id.to_string(),
            topic: topic.to_string(),
            data: Map::new(),
            timestamp: ts,
            source: "test".to_string(),
            correlation_id: corr.map(|s| s.to_string()),
            causation_id: None,
        }
    }

    #[test]
    fn get_by_topic_preserves_insertion_order() {
        let store = EventStore::new(EventStoreConfig::default(), fixed_now);
        store.store(event("1", "a", 1, None));
        store.store(event("2", "a", 2, None));
        store.store(event("3", "a", 3, None));
        let ids: Vec<String> = store.get_by_topic("a").into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn correlation_index_groups_events() {
        let store = EventStore::new(EventStoreConfig::default(), fixed_now);
        store.store(event("1", "a", 1, Some("c1")));
        store.store(event("2", "b", 2, Some("c1")));
        store.store(event("3", "a", 3, Some("c2")));
        assert_eq!(store.get_by_correlation("c1").len(), 2);
        assert_eq!(store.get_by_correlation("c2").len(), 1);
    }

    #[test]
    fn topic_pattern_supports_wildcards() {
        let store = EventStore::new(EventStoreConfig::default(), fixed_now);
        store.store(event("1", "user:created", 1, None));
        store.store(event("2", "user:deleted", 2, None));
        store.store(event("3", "order:created", 3, None));
        assert_eq!(store.get_by_topic_pattern("user:*").len(), 2);
        assert_eq!(store.get_by_topic_pattern("**").len(), 3);
    }

    #[test]
    fn range_query_is_inclusive() {
        let store = EventStore::new(EventStoreConfig::default(), fixed_now);
        store.store(event("1", "a", 100, None));
        store.store(event("2", "a", 200, None));
        store.store(event("3", "a", 300, None));
        let results = store.get_in_time_range("a", 100, 200);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn exceeding_max_events_prunes_roughly_ten_percent() {
        let config = EventStoreConfig { max_events: 10, max_age_ms: i64::MAX };
        let store = EventStore::new(config, fixed_now);
        for i in 0..11 {
            store.store(event(&i.to_string(), "a", i, None));
        }
        assert!(store.size() as f64 <= 10.0 * 1.1);
        assert!(store.get("0").is_none(), "oldest event should have been evicted");
    }

    #[test]
    fn prune_removes_events_older_than_max_age() {
        let store = EventStore::new(EventStoreConfig::default(), fixed_now);
        store.store(event("1", "a", 100, None));
        store.store(event("2", "a", 9_999, None));
        let pruned = store.prune(100);
        assert_eq!(pruned, 1);
        assert!(store.get("1").is_none());
        assert!(store.get("2").is_some());
    }
}
