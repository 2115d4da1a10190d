//! Priority-queue-driven timer scheduling (spec §4.7).
//!
//! This component only tracks *when* timers are due; the caller (the
//! dispatcher's run loop) is the single fiber that sleeps until
//! [`TimerScheduler::next_deadline`] and then drains [`TimerScheduler::pop_expired`],
//! mirroring the teacher's `tokio::select!`-driven scheduler loops without
//! coupling this module to the engine that consumes its output.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::RwLock;

use crate::model::{RepeatSpec, Timer, TimerDraft};
use crate::storage::{StorageAdapter, StoredState};

struct Inner {
    timers: HashMap<String, Timer>,
    heap: BinaryHeap<Reverse<(i64, String)>>,
}

pub struct TimerScheduler {
    inner: RwLock<Inner>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner { timers: HashMap::new(), heap: BinaryHeap::new() }),
        }
    }

    /// Schedules `draft`, replacing any existing timer of the same name.
    pub fn set(&self, draft: TimerDraft, now: i64, correlation_id: Option<String>) -> Timer {
        let timer = Timer {
            name: draft.name.clone(),
            on_expire_topic: draft.on_expire_topic,
            on_expire_data: draft.on_expire_data,
            expires_at: now + draft.duration_ms,
            repeat: draft.repeat,
            correlation_id,
        };
        let mut inner = self.inner.write().unwrap();
        inner.heap.push(Reverse((timer.expires_at, timer.name.clone())));
        inner.timers.insert(timer.name.clone(), timer.clone());
        timer
    }

    /// Cancels a timer by name; no error if absent (spec §4.5).
    pub fn cancel(&self, name: &str) -> bool {
        self.inner.write().unwrap().timers.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Timer> {
        self.inner.read().unwrap().timers.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Timer> {
        self.inner.read().unwrap().timers.values().cloned().collect()
    }

    /// Earliest pending deadline still live in `timers`, skipping stale heap
    /// entries left behind by cancellation or replacement.
    pub fn next_deadline(&self) -> Option<i64> {
        let inner = self.inner.read().unwrap();
        inner
            .heap
            .iter()
            .filter(|Reverse((_, name))| inner.timers.contains_key(name))
            .map(|Reverse((at, _))| *at)
            .min()
    }

    /// Pops every timer whose deadline is `<= now`, rescheduling repeating
    /// ones in place. Returns the fired timer as it was *at the moment of
    /// expiry* (pre-reschedule), for the caller to emit `onExpire` from.
    pub fn pop_expired(&self, now: i64) -> Vec<Timer> {
        let mut inner = self.inner.write().unwrap();
        let mut fired = Vec::new();
        while let Some(Reverse((at, name))) = inner.heap.peek().cloned() {
            if at > now {
                break;
            }
            inner.heap.pop();
            let Some(mut timer) = inner.timers.remove(&name) else { continue };
            if timer.expires_at != at {
                // Stale entry superseded by a later `set`; the live one is
                // still in `timers` under a fresh heap entry, put it back.
                inner.timers.insert(name, timer);
                continue;
            }
            let snapshot = timer.clone();
            if let Some(repeat) = reschedule(&mut timer) {
                timer.expires_at = at + repeat.interval_ms;
                inner.heap.push(Reverse((timer.expires_at, timer.name.clone())));
                inner.timers.insert(timer.name.clone(), timer);
            }
            fired.push(snapshot);
        }
        fired
    }

    /// Replays persisted timers on startup; any whose deadline has already
    /// passed are handed back so the caller fires them immediately once
    /// (spec §4.7 "Persistence").
    pub async fn restore(&self, adapter: &dyn StorageAdapter, now: i64) -> crate::error::EngineResult<Vec<Timer>> {
        let mut overdue = Vec::new();
        for key in adapter.list_keys().await? {
            let Some(name) = key.strip_prefix("timer:") else { continue };
            let Some(stored) = adapter.load(&key).await? else { continue };
            let Ok(timer) = serde_json::from_value::<Timer>(stored.state) else { continue };
            let mut inner = self.inner.write().unwrap();
            inner.heap.push(Reverse((timer.expires_at, name.to_string())));
            inner.timers.insert(name.to_string(), timer.clone());
            drop(inner);
            if timer.expires_at <= now {
                overdue.push(timer);
            }
        }
        Ok(overdue)
    }

    pub async fn persist(&self, adapter: &dyn StorageAdapter, timer: &Timer) -> crate::error::EngineResult<()> {
        let state = serde_json::to_value(timer).expect("Timer always serializes");
        adapter.save(&format!("timer:{}", timer.name), StoredState { state, metadata: serde_json::Value::Null }).await
    }

    pub async fn forget(&self, adapter: &dyn StorageAdapter, name: &str) -> crate::error::EngineResult<()> {
        adapter.delete(&format!("timer:{name}")).await.map(|_| ())
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Advances `timer.repeat`'s count and returns it if it should fire again.
fn reschedule(timer: &mut Timer) -> Option<RepeatSpec> {
    let repeat = timer.repeat.as_mut()?;
    repeat.count += 1;
    if let Some(max) = repeat.max_count {
        if repeat.count >= max {
            return None;
        }
    }
    Some(repeat.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorageAdapter;
    use serde_json::Map;

    fn draft(name: &str, duration_ms: i64, repeat: Option<RepeatSpec>) -> TimerDraft {
        TimerDraft {
            name: name.to_string(),
            duration_ms,
            on_expire_topic: "tick".to_string(),
            on_expire_data: Map::new(),
            repeat,
        }
    }

    #[test]
    fn one_shot_timer_fires_once_and_is_removed() {
        let scheduler = TimerScheduler::new();
        scheduler.set(draft("t", 100, None), 0, None);
        assert_eq!(scheduler.next_deadline(), Some(100));
        let fired = scheduler.pop_expired(150);
        assert_eq!(fired.len(), 1);
        assert!(scheduler.get("t").is_none());
    }

    #[test]
    fn repeating_timer_fires_exactly_max_count_times() {
        let scheduler = TimerScheduler::new();
        scheduler.set(draft("t", 100, Some(RepeatSpec { interval_ms: 100, max_count: Some(3), count: 0 })), 0, None);

        let mut total = 0;
        let mut now = 0;
        for _ in 0..10 {
            now += 100;
            total += scheduler.pop_expired(now).len();
        }
        assert_eq!(total, 3);
        assert!(scheduler.get("t").is_none());
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let scheduler = TimerScheduler::new();
        scheduler.set(draft("t", 100, None), 0, None);
        assert!(scheduler.cancel("t"));
        assert_eq!(scheduler.pop_expired(1_000).len(), 0);
    }

    #[test]
    fn replacing_a_timer_supersedes_the_stale_heap_entry() {
        let scheduler = TimerScheduler::new();
        scheduler.set(draft("t", 1_000, None), 0, None);
        scheduler.set(draft("t", 100, None), 0, None);
        assert_eq!(scheduler.pop_expired(100).len(), 1);
        assert_eq!(scheduler.pop_expired(1_000).len(), 0);
    }

    #[tokio::test]
    async fn restore_reports_overdue_timers_for_immediate_firing() {
        let adapter = InMemoryStorageAdapter::new();
        let scheduler = TimerScheduler::new();
        let timer = scheduler.set(draft("t", 100, None), 0, None);
        scheduler.persist(&adapter, &timer).await.unwrap();

        let fresh = TimerScheduler::new();
        let overdue = fresh.restore(&adapter, 10_000).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].name, "t");
    }
}
