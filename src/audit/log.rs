//! Append-only audit trail: a bounded in-memory ring plus an optional
//! persistence adapter, fronted by a [`TraceBus`] fan-out (spec §4.9).
//!
//! Grounded on the teacher's `ExecutionSession` ring of `ReteEvent`s
//! (`debug/event_store.rs`), generalized from one GRL debugging session to
//! the engine's lifetime and widened to query by rule/category/correlation.

use std::collections::VecDeque;
use std::sync::RwLock;

use uuid::Uuid;

use crate::audit::trace_bus::{Subscription, TraceBus};
use crate::model::{AuditCategory, AuditEntry, AuditType};
use crate::storage::{StorageAdapter, StoredState};

pub struct AuditLogConfig {
    pub max_memory_entries: usize,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self { max_memory_entries: 10_000 }
    }
}

pub struct AuditLog {
    config: AuditLogConfig,
    entries: RwLock<VecDeque<AuditEntry>>,
    bus: TraceBus,
    now_fn: fn() -> i64,
}

impl AuditLog {
    pub fn new(config: AuditLogConfig, now_fn: fn() -> i64) -> Self {
        Self {
            config,
            entries: RwLock::new(VecDeque::new()),
            bus: TraceBus::new(),
            now_fn,
        }
    }

    /// Builds and appends an entry, publishing it to subscribers. Persistence
    /// is the caller's responsibility via [`AuditLog::persist`] — recording
    /// never blocks on storage I/O.
    pub fn record(&self, r#type: AuditType, summary: impl Into<String>, source: impl Into<String>) -> AuditEntry {
        let entry = AuditEntry::new(Uuid::new_v4().to_string(), (self.now_fn)(), r#type, summary, source);
        self.append(entry.clone());
        entry
    }

    pub fn append(&self, entry: AuditEntry) {
        let mut entries = self.entries.write().unwrap();
        entries.push_back(entry.clone());
        while entries.len() > self.config.max_memory_entries {
            entries.pop_front();
        }
        drop(entries);
        self.bus.publish(&entry);
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    pub fn by_rule(&self, rule_id: &str) -> Vec<AuditEntry> {
        self.entries.read().unwrap().iter().filter(|e| e.rule_id.as_deref() == Some(rule_id)).cloned().collect()
    }

    pub fn by_category(&self, category: AuditCategory) -> Vec<AuditEntry> {
        self.entries.read().unwrap().iter().filter(|e| e.category == category).cloned().collect()
    }

    pub fn by_correlation(&self, correlation_id: &str) -> Vec<AuditEntry> {
        self.entries.read().unwrap().iter().filter(|e| e.correlation_id.as_deref() == Some(correlation_id)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort persistence of one entry; a storage failure is logged and
    /// the in-memory record stands on its own (spec §7 `StorageError`
    /// policy: engine continues on in-memory state).
    pub async fn persist(&self, adapter: &dyn StorageAdapter, entry: &AuditEntry) {
        let state = serde_json::to_value(entry).expect("AuditEntry always serializes");
        if let Err(e) = adapter.save(&format!("audit:{}", entry.id), StoredState { state, metadata: serde_json::Value::Null }).await {
            tracing::warn!(error = %e, entry_id = %entry.id, "failed to persist audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> i64 {
        42
    }

    #[test]
    fn ring_buffer_evicts_oldest_past_capacity() {
        let log = AuditLog::new(AuditLogConfig { max_memory_entries: 2 }, fixed_now);
        log.record(AuditType::EngineStarted, "a", "engine");
        log.record(AuditType::EngineStarted, "b", "engine");
        log.record(AuditType::EngineStarted, "c", "engine");
        assert_eq!(log.len(), 2);
        let summaries: Vec<String> = log.entries.read().unwrap().iter().map(|e| e.summary.clone()).collect();
        assert_eq!(summaries, vec!["b", "c"]);
    }

    #[test]
    fn by_category_filters_entries() {
        let log = AuditLog::new(AuditLogConfig::default(), fixed_now);
        log.record(AuditType::RuleExecuted, "fired", "engine");
        log.record(AuditType::FactCreated, "fact", "engine");
        assert_eq!(log.by_category(AuditCategory::RuleExecution).len(), 1);
        assert_eq!(log.by_category(AuditCategory::DataChange).len(), 1);
    }

    #[tokio::test]
    async fn subscriber_sees_recorded_entries() {
        let log = AuditLog::new(AuditLogConfig::default(), fixed_now);
        let mut sub = log.subscribe();
        log.record(AuditType::EngineStarted, "up", "engine");
        let entry = sub.rx.recv().await.unwrap();
        assert_eq!(entry.summary, "up");
    }
}
