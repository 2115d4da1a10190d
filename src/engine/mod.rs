//! The dispatcher (spec §4.10): wires every component together and owns
//! the cascade/correlation/serialization semantics described in §5.

pub mod backward;
pub mod config;
pub mod event_bus;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, Notify, Semaphore};
use uuid::Uuid;

pub use backward::QueryResult;
pub use config::{AuditConfig, Config};
pub use event_bus::{EventBus, EventSubscription};

use crate::action::{ActionExecutor, Effect};
use crate::audit::{AuditLog, AuditLogConfig, TraceSubscription};
use crate::condition::{ConditionEvaluator, EvaluationContext};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    AuditEntry, AuditType, ConditionSource, Event, EventDraft, Fact, Rule, RuleCondition, RuleGroup,
    Timer, TimerDraft, Trigger,
};
use crate::rules::{GroupManager, RuleManager, RulePatch};
use crate::services::{BaselineStore, ServiceRegistry};
use crate::storage::StorageAdapter;
use crate::store::{EventStore, EventStoreConfig, FactStore};
use crate::temporal::TemporalMatcher;
use crate::timer::TimerScheduler;

fn real_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub rule_count: usize,
    pub fact_count: usize,
    pub event_count: usize,
    pub timer_count: usize,
    pub audit_entry_count: usize,
}

pub struct Engine {
    config: Config,
    facts: FactStore,
    events: EventStore,
    rules: RuleManager,
    groups: GroupManager,
    temporal: TemporalMatcher,
    timers: TimerScheduler,
    audit: AuditLog,
    event_bus: EventBus,
    services: Arc<dyn ServiceRegistry>,
    storage: Option<Arc<dyn StorageAdapter>>,
    baseline: Option<Arc<dyn BaselineStore>>,
    rule_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    concurrency: Semaphore,
    now_fn: fn() -> i64,
    running: AtomicBool,
    shutdown: Notify,
}

impl Engine {
    pub fn new(config: Config, services: Arc<dyn ServiceRegistry>, storage: Option<Arc<dyn StorageAdapter>>) -> Self {
        Self::with_clock(config, services, storage, real_now)
    }

    pub fn with_clock(config: Config, services: Arc<dyn ServiceRegistry>, storage: Option<Arc<dyn StorageAdapter>>, now_fn: fn() -> i64) -> Self {
        let concurrency = Semaphore::new(config.max_concurrency.max(1));
        Self {
            audit: AuditLog::new(AuditLogConfig { max_memory_entries: config.audit.max_memory_entries }, now_fn),
            facts: FactStore::new(now_fn),
            events: EventStore::new(EventStoreConfig::default(), now_fn),
            rules: RuleManager::new(now_fn),
            groups: GroupManager::new(now_fn),
            temporal: TemporalMatcher::new(now_fn),
            timers: TimerScheduler::new(),
            event_bus: EventBus::new(),
            services,
            storage,
            baseline: None,
            rule_locks: RwLock::new(HashMap::new()),
            concurrency,
            now_fn,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            config,
        }
    }

    /// Wires a [`BaselineStore`] for `baseline(...)` conditions (spec §4.4);
    /// without one, those conditions always resolve to undefined/false.
    pub fn with_baseline_store(mut self, baseline: Arc<dyn BaselineStore>) -> Self {
        self.baseline = Some(baseline);
        self
    }

    fn now(&self) -> i64 {
        (self.now_fn)()
    }

    fn audit_entry(&self, r#type: AuditType, summary: impl Into<String>) -> AuditEntry {
        AuditEntry::new(Uuid::new_v4().to_string(), self.now(), r#type, summary, self.config.name.clone())
    }

    // ---- lifecycle ----------------------------------------------------

    pub async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.audit.record(AuditType::EngineStarted, format!("engine '{}' started", self.config.name), &self.config.name);
        if let Some(storage) = self.storage.clone() {
            if let Ok(overdue) = self.timers.restore(storage.as_ref(), self.now()).await {
                for timer in overdue {
                    self.fire_timer(timer).await;
                }
            }
        }
    }

    /// Drives timer expiry; runs until [`Engine::stop`] is called. The
    /// caller spawns this (the engine owns no thread of its own).
    pub async fn run_timer_loop(&self) {
        loop {
            let sleep_for = match self.timers.next_deadline() {
                Some(at) => Duration::from_millis((at - self.now()).max(0) as u64),
                None => Duration::from_millis(200),
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.shutdown.notified() => break,
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let now = self.now();
            for timer in self.timers.pop_expired(now) {
                self.fire_timer(timer).await;
            }
        }
    }

    async fn fire_timer(&self, timer: Timer) {
        self.audit.record(AuditType::TimerFired, format!("timer '{}' fired", timer.name), &self.config.name);
        if let Some(storage) = &self.storage {
            match self.timers.get(&timer.name) {
                Some(updated) => {
                    let _ = self.timers.persist(storage.as_ref(), &updated).await;
                }
                None => {
                    let _ = self.timers.forget(storage.as_ref(), &timer.name).await;
                }
            }
        }
        let draft = EventDraft {
            topic: timer.on_expire_topic.clone(),
            data: timer.on_expire_data.clone(),
            source: Some(self.config.name.clone()),
            correlation_id: timer.correlation_id.clone(),
            causation_id: None,
        };
        let _ = self.emit(draft).await;
    }

    /// Graceful drain (spec §5 "Cancellation / timeouts"): stops accepting
    /// new `emit` calls and waits up to `shutdownTimeout` for in-flight
    /// cascades — tracked via the concurrency semaphore — to finish.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let permits = self.config.max_concurrency.max(1) as u32;
        let drained = tokio::time::timeout(self.config.shutdown_timeout(), self.concurrency.acquire_many(permits)).await;
        if drained.is_err() {
            tracing::warn!("shutdown timeout elapsed with cascades still in flight");
        }
        self.audit.record(AuditType::EngineStopped, format!("engine '{}' stopped", self.config.name), &self.config.name);
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            rule_count: self.rules.get_all().len(),
            fact_count: self.facts.len(),
            event_count: self.events.size(),
            timer_count: self.timers.list().len(),
            audit_entry_count: self.audit.len(),
        }
    }

    // ---- events ---------------------------------------------------------

    pub async fn emit(&self, draft: EventDraft) -> EngineResult<Event> {
        if draft.topic.is_empty() {
            return Err(EngineError::invalid_argument("event topic must not be empty"));
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(EngineError::invalid_argument("engine is stopped; no new events are accepted"));
        }
        let _permit = self.concurrency.acquire().await.expect("semaphore is never closed while the engine runs");
        let now = self.now();
        let id = Uuid::new_v4().to_string();
        let correlation_id = draft.correlation_id.clone().unwrap_or_else(|| id.clone());
        let event = Event {
            id,
            topic: draft.topic,
            data: draft.data,
            timestamp: now,
            source: draft.source.unwrap_or_else(|| self.config.name.clone()),
            correlation_id: Some(correlation_id),
            causation_id: draft.causation_id,
        };
        self.dispatch_event(event.clone(), 1).await;
        Ok(event)
    }

    fn dispatch_event<'a>(&'a self, event: Event, depth: u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.events.store(event.clone());
            self.event_bus.publish(&event);
            self.audit.record(AuditType::EventEmitted, format!("event '{}' emitted", event.topic), &event.source);

            for firing in self.temporal.ingest(&event) {
                if let Some(rule) = self.rules.get(&firing.rule_id) {
                    let mut data = Map::new();
                    data.insert("matches".to_string(), json!(firing.matches));
                    if let Some(group) = &firing.group_by {
                        data.insert("groupBy".to_string(), json!(group));
                    }
                    self.dispatch_rules_for_trigger(vec![rule], "temporal", data, event.correlation_id.clone(), Some(event.id.clone()), depth).await;
                }
            }

            let rules = self.rules.get_by_event_topic(&event.topic);
            self.dispatch_rules_for_trigger(rules, "event", event.data.clone(), event.correlation_id.clone(), Some(event.id.clone()), depth).await;
        })
    }

    async fn dispatch_rules_for_trigger(
        &self,
        rules: Vec<Rule>,
        trigger_kind: &str,
        trigger_data: Map<String, Value>,
        correlation_id: Option<String>,
        causation_id: Option<String>,
        depth: u32,
    ) {
        for rule in rules {
            if !rule.enabled || !self.groups.is_effectively_enabled(rule.group.as_deref()) {
                let entry = self.audit_entry(AuditType::RuleSkipped, format!("rule '{}' skipped: disabled", rule.id)).with_rule(&rule.id, &rule.name);
                self.audit.append(entry);
                continue;
            }

            // Gate the firing itself, not just the next cascade level: with
            // maxCascadeDepth = N the top-level firing starts at depth 1, so
            // this lets exactly N firings through before the N+1th is
            // rejected (spec §8 scenario 6).
            if depth > self.config.max_cascade_depth {
                let entry = self.audit_entry(AuditType::RuleFailed, format!("cascade depth exceeded for rule '{}'", rule.id)).with_rule(&rule.id, &rule.name);
                self.audit.append(entry);
                continue;
            }

            self.audit.record(AuditType::RuleTriggered, format!("rule '{}' triggered", rule.id), &self.config.name);
            let now = self.now();
            let mut ctx = EvaluationContext::new(&self.facts, trigger_kind, trigger_data.clone(), now);
            if let Some(c) = &correlation_id {
                ctx.variables.insert("__correlation_id".to_string(), json!(c));
            }
            self.resolve_baseline_verdicts(&rule.conditions, &mut ctx).await;

            let conditions_met = ConditionEvaluator::evaluate_all(&rule.conditions, &ctx);
            let cond_entry = self
                .audit_entry(AuditType::ConditionEvaluated, format!("rule '{}' conditions evaluated: {conditions_met}", rule.id))
                .with_rule(&rule.id, &rule.name);
            self.audit.append(cond_entry);
            if !conditions_met {
                self.audit.record(AuditType::RuleSkipped, format!("rule '{}' skipped: conditions not met", rule.id), &self.config.name);
                continue;
            }

            let lock = self.rule_lock(&rule.id);
            let _guard = lock.lock().await;
            let started = self.now();
            let results = ActionExecutor::execute_all(&rule.id, &rule.actions, &mut ctx, self.services.as_ref(), self.config.action_timeout()).await;
            let aborted = results.len() < rule.actions.len();

            let mut effects = Vec::new();
            for (index, result) in results.into_iter().enumerate() {
                let started_entry = self
                    .audit_entry(AuditType::ActionStarted, format!("rule '{}' action {index} started", rule.id))
                    .with_rule(&rule.id, &rule.name);
                self.audit.append(started_entry);
                match result {
                    Ok(produced) => {
                        effects.extend(produced);
                        let entry = self
                            .audit_entry(AuditType::ActionCompleted, format!("rule '{}' action {index} completed", rule.id))
                            .with_rule(&rule.id, &rule.name);
                        self.audit.append(entry);
                    }
                    Err(e) => {
                        let entry = self.audit_entry(AuditType::ActionFailed, e.to_string()).with_rule(&rule.id, &rule.name);
                        self.audit.append(entry);
                    }
                }
            }

            let mut derived_events = Vec::new();
            let mut derived_facts = Vec::new();
            for effect in effects {
                match effect {
                    Effect::SetFact { key, value } => {
                        if let Some(mutation) = self.write_set_fact(&key, value) {
                            derived_facts.push(mutation);
                        }
                    }
                    Effect::DeleteFact { key } => {
                        if let Some(mutation) = self.write_delete_fact(&key) {
                            derived_facts.push(mutation);
                        }
                    }
                    Effect::EmitEvent { topic, data, correlation_id: ev_corr } => {
                        derived_events.push(EventDraft {
                            topic,
                            data,
                            source: Some(self.config.name.clone()),
                            correlation_id: ev_corr.or_else(|| correlation_id.clone()),
                            causation_id: causation_id.clone(),
                        });
                    }
                    Effect::SetTimer { draft } => {
                        let timer = self.timers.set(draft, now, correlation_id.clone());
                        if let Some(storage) = &self.storage {
                            let _ = self.timers.persist(storage.as_ref(), &timer).await;
                        }
                        self.audit.record(AuditType::TimerScheduled, format!("timer '{}' scheduled", timer.name), &self.config.name);
                    }
                    Effect::CancelTimer { name } => {
                        if self.timers.cancel(&name) {
                            if let Some(storage) = &self.storage {
                                let _ = self.timers.forget(storage.as_ref(), &name).await;
                            }
                        }
                    }
                    Effect::Log { level, message } => log_at_level(level, &message),
                }
            }
            // The per-rule lock is released before any cascading dispatch
            // runs: both derived_facts and derived_events may re-enter this
            // rule (directly, or transitively through another rule), and
            // that recursive dispatch must never try to re-acquire this
            // rule's own non-reentrant lock while it's still held.
            drop(_guard);

            self.rules.record_fired(&rule.id, now);
            let duration_ms = self.now() - started;
            let audit_type = if aborted { AuditType::RuleFailed } else { AuditType::RuleExecuted };
            let mut entry = self.audit_entry(audit_type, format!("rule '{}' fired", rule.id)).with_rule(&rule.id, &rule.name).with_duration_ms(duration_ms);
            if let Some(c) = &correlation_id {
                entry = entry.with_correlation(c.clone());
            }
            self.audit.append(entry);

            for (key, value, change_kind) in derived_facts {
                self.dispatch_fact_rules(&key, &value, change_kind, depth + 1).await;
            }

            for draft in derived_events {
                let correlation_id = draft.correlation_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
                let event = Event {
                    id: Uuid::new_v4().to_string(),
                    topic: draft.topic,
                    data: draft.data,
                    timestamp: self.now(),
                    source: draft.source.unwrap_or_else(|| self.config.name.clone()),
                    correlation_id: Some(correlation_id),
                    causation_id: draft.causation_id,
                };
                self.dispatch_event(event, depth + 1).await;
            }
        }
    }

    /// Writes the fact's new value and returns `(key, value, changeKind)`
    /// for the caller to dispatch fact-triggered rules against, once it's
    /// safe to do so. Split out of `apply_set_fact` so the dispatcher can
    /// defer that dispatch past its own per-rule lock guard (see
    /// `dispatch_rules_for_trigger`).
    fn write_set_fact(&self, key: &str, value: Value) -> Option<(String, Value, &'static str)> {
        let existing = self.facts.get(key);
        let fact = self.facts.set(key, value, &self.config.name).ok()?;
        let audit_type = if existing.is_none() { AuditType::FactCreated } else { AuditType::FactUpdated };
        self.audit.record(audit_type, format!("fact '{key}' set"), &self.config.name);
        Some((key.to_string(), fact.value, "set"))
    }

    fn write_delete_fact(&self, key: &str) -> Option<(String, Value, &'static str)> {
        if self.facts.delete(key) {
            self.audit.record(AuditType::FactDeleted, format!("fact '{key}' deleted"), &self.config.name);
            Some((key.to_string(), Value::Null, "delete"))
        } else {
            None
        }
    }

    /// Used by the public `set_fact`/`delete_fact` API, which holds no
    /// rule lock and can dispatch fact-triggered rules immediately.
    async fn apply_set_fact(&self, key: &str, value: Value, depth: u32) {
        if let Some((key, value, kind)) = self.write_set_fact(key, value) {
            self.dispatch_fact_rules(&key, &value, kind, depth).await;
        }
    }

    async fn apply_delete_fact(&self, key: &str, depth: u32) {
        if let Some((key, value, kind)) = self.write_delete_fact(key) {
            self.dispatch_fact_rules(&key, &value, kind, depth).await;
        }
    }

    /// Consults the configured `BaselineStore`, if any, for every distinct
    /// `baseline(metric, ...)` condition on `rule`'s conditions, populating
    /// each metric's verdict into `ctx` so `ConditionEvaluator` can resolve
    /// it (spec §4.4). The metric's current numeric value is read from the
    /// fact of the same name; a condition whose metric has no matching fact
    /// resolves to undefined, same as any other unresolved source.
    async fn resolve_baseline_verdicts(&self, conditions: &[RuleCondition], ctx: &mut EvaluationContext<'_>) {
        let Some(store) = &self.baseline else { return };
        for condition in conditions {
            let ConditionSource::Baseline { metric, comparison, sensitivity } = &condition.source else { continue };
            if ctx.baseline.contains_key(metric) {
                continue;
            }
            let Some(value) = self.facts.get(metric).and_then(|f| f.value.as_f64()) else { continue };
            if let Ok(verdict) = store.check_anomaly(metric, value, comparison, *sensitivity).await {
                ctx.baseline.insert(metric.clone(), json!(verdict.is_anomaly));
            }
        }
    }

    // Boxed like `dispatch_event`: this closes a second recursive cycle
    // (dispatch_rules_for_trigger -> apply_set_fact -> dispatch_fact_rules
    // -> dispatch_rules_for_trigger) that never passes through the event
    // path, so it needs its own indirection point.
    fn dispatch_fact_rules<'a>(
        &'a self,
        key: &'a str,
        value: &'a Value,
        change_kind: &'a str,
        depth: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let rules = self.rules.get_by_fact_pattern(key);
            if rules.is_empty() {
                return;
            }
            let mut data = Map::new();
            data.insert("key".to_string(), json!(key));
            data.insert("value".to_string(), value.clone());
            data.insert("changeKind".to_string(), json!(change_kind));
            self.dispatch_rules_for_trigger(rules, "fact", data, None, None, depth).await;
        })
    }

    fn rule_lock(&self, rule_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.rule_locks.write().unwrap();
        locks.entry(rule_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    // ---- facts ------------------------------------------------------------

    pub async fn set_fact(&self, key: &str, value: Value) -> EngineResult<Fact> {
        if key.is_empty() {
            return Err(EngineError::invalid_argument("fact key must not be empty"));
        }
        self.apply_set_fact(key, value, 1).await;
        self.facts.get(key).ok_or_else(|| EngineError::not_found(format!("fact '{key}' not found after set")))
    }

    pub async fn delete_fact(&self, key: &str) -> bool {
        let existed = self.facts.get(key).is_some();
        self.apply_delete_fact(key, 1).await;
        existed
    }

    pub fn get_fact(&self, key: &str) -> Option<Fact> {
        self.facts.get(key)
    }

    pub fn query_facts(&self, pattern: &str) -> Vec<Fact> {
        self.facts.query(pattern)
    }

    // ---- rules --------------------------------------------------------

    pub fn register_rule(&self, rule: Rule) -> EngineResult<()> {
        if let Trigger::Temporal { pattern } = &rule.trigger {
            self.temporal.register(&rule.id, (**pattern).clone());
        }
        let id = rule.id.clone();
        let name = rule.name.clone();
        self.rules.register(rule, &self.groups)?;
        let entry = self.audit_entry(AuditType::RuleRegistered, format!("rule '{id}' registered")).with_rule(&id, &name);
        self.audit.append(entry);
        Ok(())
    }

    pub fn unregister_rule(&self, id: &str) -> EngineResult<Rule> {
        let rule = self.rules.unregister(id)?;
        if matches!(rule.trigger, Trigger::Temporal { .. }) {
            self.temporal.unregister(id);
        }
        Ok(rule)
    }

    pub fn enable_rule(&self, id: &str) -> EngineResult<()> {
        self.rules.enable(id)?;
        self.audit.record(AuditType::RuleEnabled, format!("rule '{id}' enabled"), &self.config.name);
        Ok(())
    }

    pub fn disable_rule(&self, id: &str) -> EngineResult<()> {
        self.rules.disable(id)?;
        self.audit.record(AuditType::RuleDisabled, format!("rule '{id}' disabled"), &self.config.name);
        Ok(())
    }

    pub fn update_rule(&self, id: &str, patch: RulePatch) -> EngineResult<Rule> {
        self.rules.update(id, patch)
    }

    pub fn get_rule(&self, id: &str) -> Option<Rule> {
        self.rules.get(id)
    }

    pub fn get_all_rules(&self) -> Vec<Rule> {
        self.rules.get_all()
    }

    // ---- groups -----------------------------------------------------------

    pub fn create_group(&self, name: String, description: Option<String>) -> EngineResult<RuleGroup> {
        self.groups.create(name, description)
    }

    pub fn enable_group(&self, id: &str) -> EngineResult<RuleGroup> {
        self.groups.set_enabled(id, true)
    }

    pub fn disable_group(&self, id: &str) -> EngineResult<RuleGroup> {
        self.groups.set_enabled(id, false)
    }

    pub fn delete_group(&self, id: &str) -> EngineResult<()> {
        self.groups.delete(id)?;
        self.rules.clear_group_reference(id);
        Ok(())
    }

    // ---- timers -------------------------------------------------------

    pub async fn set_timer(&self, draft: TimerDraft) -> EngineResult<Timer> {
        let timer = self.timers.set(draft, self.now(), None);
        if let Some(storage) = &self.storage {
            self.timers.persist(storage.as_ref(), &timer).await?;
        }
        self.audit.record(AuditType::TimerScheduled, format!("timer '{}' scheduled", timer.name), &self.config.name);
        Ok(timer)
    }

    pub async fn cancel_timer(&self, name: &str) -> EngineResult<bool> {
        let cancelled = self.timers.cancel(name);
        if cancelled {
            if let Some(storage) = &self.storage {
                self.timers.forget(storage.as_ref(), name).await?;
            }
        }
        Ok(cancelled)
    }

    pub fn get_timer(&self, name: &str) -> Option<Timer> {
        self.timers.get(name)
    }

    // ---- subscriptions / queries ----------------------------------------

    pub fn subscribe(&self, topic_pattern: impl Into<String>) -> EventSubscription {
        self.event_bus.subscribe(topic_pattern)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.event_bus.unsubscribe(id);
    }

    pub fn subscribe_audit(&self) -> TraceSubscription {
        self.audit.subscribe()
    }

    pub fn query(&self, goal: &str) -> QueryResult {
        backward::query(goal, &self.facts, &self.rules, backward::DEFAULT_MAX_DEPTH)
    }
}

fn log_at_level(level: crate::model::LogLevel, message: &str) {
    use crate::model::LogLevel::*;
    match level {
        Trace => tracing::trace!("{message}"),
        Debug => tracing::debug!("{message}"),
        Info => tracing::info!("{message}"),
        Warn => tracing::warn!("{message}"),
        Error => tracing::error!("{message}"),
    }
}
