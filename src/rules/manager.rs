//! Rule registry indexed by trigger kind for O(1) dispatch (spec §4.3).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::model::{Rule, Trigger};
use crate::pattern;
use crate::rules::group::GroupManager;

struct Inner {
    rules: HashMap<String, Rule>,
    by_event_topic: HashMap<String, Vec<String>>,
    by_fact_pattern: HashMap<String, Vec<String>>,
    by_timer_name: HashMap<String, Vec<String>>,
    temporal_rule_ids: Vec<String>,
}

pub struct RuleManager {
    inner: RwLock<Inner>,
    now_fn: fn() -> i64,
}

/// Fields a caller may patch via [`RuleManager::update`]; `None` leaves the
/// field unchanged.
#[derive(Debug, Default)]
pub struct RulePatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
    pub group: Option<Option<String>>,
    pub conditions: Option<Vec<crate::model::RuleCondition>>,
    pub actions: Option<Vec<crate::model::RuleAction>>,
}

impl RuleManager {
    pub fn new(now_fn: fn() -> i64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                rules: HashMap::new(),
                by_event_topic: HashMap::new(),
                by_fact_pattern: HashMap::new(),
                by_timer_name: HashMap::new(),
                temporal_rule_ids: Vec::new(),
            }),
            now_fn,
        }
    }

    pub fn register(&self, rule: Rule, groups: &GroupManager) -> EngineResult<()> {
        if let Some(group_id) = &rule.group {
            if groups.get(group_id).is_none() {
                return Err(EngineError::ValidationError {
                    issues: vec![format!("rule references nonexistent group '{group_id}'")],
                });
            }
        }
        let mut inner = self.inner.write().unwrap();
        if inner.rules.contains_key(&rule.id) {
            return Err(EngineError::conflict(format!("rule id '{}' already registered", rule.id)));
        }
        match &rule.trigger {
            Trigger::Event { topic } => {
                inner.by_event_topic.entry(topic.clone()).or_default().push(rule.id.clone());
            }
            Trigger::Fact { pattern } => {
                inner.by_fact_pattern.entry(pattern.clone()).or_default().push(rule.id.clone());
            }
            Trigger::Timer { name } => {
                inner.by_timer_name.entry(name.clone()).or_default().push(rule.id.clone());
            }
            Trigger::Temporal { .. } => {
                inner.temporal_rule_ids.push(rule.id.clone());
            }
        }
        inner.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> EngineResult<Rule> {
        let mut inner = self.inner.write().unwrap();
        let rule = inner.rules.remove(id).ok_or_else(|| EngineError::not_found(format!("rule '{id}' not found")))?;
        match &rule.trigger {
            Trigger::Event { topic } => remove_from_index(&mut inner.by_event_topic, topic, id),
            Trigger::Fact { pattern } => remove_from_index(&mut inner.by_fact_pattern, pattern, id),
            Trigger::Timer { name } => remove_from_index(&mut inner.by_timer_name, name, id),
            Trigger::Temporal { .. } => inner.temporal_rule_ids.retain(|x| x != id),
        }
        Ok(rule)
    }

    pub fn get(&self, id: &str) -> Option<Rule> {
        self.inner.read().unwrap().rules.get(id).cloned()
    }

    pub fn update(&self, id: &str, patch: RulePatch) -> EngineResult<Rule> {
        let mut inner = self.inner.write().unwrap();
        let rule = inner.rules.get_mut(id).ok_or_else(|| EngineError::not_found(format!("rule '{id}' not found")))?;
        if let Some(name) = patch.name {
            rule.name = name;
        }
        if let Some(description) = patch.description {
            rule.description = description;
        }
        if let Some(priority) = patch.priority {
            rule.priority = priority;
        }
        if let Some(enabled) = patch.enabled {
            rule.enabled = enabled;
        }
        if let Some(group) = patch.group {
            rule.group = group;
        }
        if let Some(conditions) = patch.conditions {
            rule.conditions = conditions;
        }
        if let Some(actions) = patch.actions {
            rule.actions = actions;
        }
        rule.updated_at = (self.now_fn)();
        rule.version += 1;
        Ok(rule.clone())
    }

    pub fn enable(&self, id: &str) -> EngineResult<()> {
        self.update(id, RulePatch { enabled: Some(true), ..Default::default() }).map(|_| ())
    }

    pub fn disable(&self, id: &str) -> EngineResult<()> {
        self.update(id, RulePatch { enabled: Some(false), ..Default::default() }).map(|_| ())
    }

    pub fn get_all(&self) -> Vec<Rule> {
        self.inner.read().unwrap().rules.values().cloned().collect()
    }

    pub fn get_by_event_topic(&self, topic: &str) -> Vec<Rule> {
        let inner = self.inner.read().unwrap();
        let mut rules: Vec<Rule> = inner
            .by_event_topic
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.rules.get(id).cloned())
            .collect();
        sort_by_priority(&mut rules);
        rules
    }

    /// Matches `key` (a concrete changed fact key) against every registered
    /// fact-trigger pattern using wildcard semantics (spec §9 open question,
    /// resolved in favor of wildcard match).
    pub fn get_by_fact_pattern(&self, key: &str) -> Vec<Rule> {
        let inner = self.inner.read().unwrap();
        let mut rules: Vec<Rule> = inner
            .by_fact_pattern
            .iter()
            .filter(|(pat, _)| pattern::matches_fixed_arity(pat, key) || pat.as_str() == key)
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| inner.rules.get(id).cloned())
            .collect();
        sort_by_priority(&mut rules);
        rules
    }

    pub fn get_by_timer_name(&self, name: &str) -> Vec<Rule> {
        let inner = self.inner.read().unwrap();
        let mut rules: Vec<Rule> = inner
            .by_timer_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.rules.get(id).cloned())
            .collect();
        sort_by_priority(&mut rules);
        rules
    }

    pub fn get_temporal_rules(&self) -> Vec<Rule> {
        let inner = self.inner.read().unwrap();
        let mut rules: Vec<Rule> = inner
            .temporal_rule_ids
            .iter()
            .filter_map(|id| inner.rules.get(id).cloned())
            .collect();
        sort_by_priority(&mut rules);
        rules
    }

    pub fn record_fired(&self, id: &str, fired_at: i64) {
        if let Some(rule) = self.inner.write().unwrap().rules.get_mut(id) {
            rule.last_fired_at = Some(fired_at);
            rule.fire_count += 1;
        }
    }

    /// Clear `group` on every rule that references `group_id`; called by
    /// [`GroupManager::delete`] (spec §4.8).
    pub fn clear_group_reference(&self, group_id: &str) {
        let mut inner = self.inner.write().unwrap();
        for rule in inner.rules.values_mut() {
            if rule.group.as_deref() == Some(group_id) {
                rule.group = None;
            }
        }
    }
}

fn remove_from_index(index: &mut HashMap<String, Vec<String>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|x| x != id);
    }
}

/// Stable sort by `(priority DESC, id ASC)` (spec §4.3, invariant 3 of §8).
fn sort_by_priority(rules: &mut [Rule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RuleBuilder, Trigger};

    fn rule(id: &str, priority: i32, topic: &str) -> Rule {
        RuleBuilder::new(id, id, Trigger::Event { topic: topic.to_string() })
            .priority(priority)
            .build(0)
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mgr = RuleManager::new(|| 0);
        let groups = GroupManager::new(|| 0);
        mgr.register(rule("r1", 0, "t"), &groups).unwrap();
        let err = mgr.register(rule("r1", 0, "t"), &groups).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn nonexistent_group_reference_is_rejected() {
        let mgr = RuleManager::new(|| 0);
        let groups = GroupManager::new(|| 0);
        let mut r = rule("r1", 0, "t");
        r.group = Some("missing".to_string());
        let err = mgr.register(r, &groups).unwrap_err();
        assert!(matches!(err, EngineError::ValidationError { .. }));
    }

    #[test]
    fn event_topic_dispatch_is_sorted_by_priority_then_id() {
        let mgr = RuleManager::new(|| 0);
        let groups = GroupManager::new(|| 0);
        mgr.register(rule("b", 5, "t"), &groups).unwrap();
        mgr.register(rule("a", 10, "t"), &groups).unwrap();
        mgr.register(rule("c", 10, "t"), &groups).unwrap();

        let ids: Vec<String> = mgr.get_by_event_topic("t").into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn disabled_rules_remain_in_index() {
        let mgr = RuleManager::new(|| 0);
        let groups = GroupManager::new(|| 0);
        mgr.register(rule("a", 0, "t"), &groups).unwrap();
        mgr.disable("a").unwrap();
        assert_eq!(mgr.get_by_event_topic("t").len(), 1);
        assert!(!mgr.get("a").unwrap().enabled);
    }

    #[test]
    fn fact_pattern_trigger_matches_wildcards() {
        let mgr = RuleManager::new(|| 0);
        let groups = GroupManager::new(|| 0);
        let r = RuleBuilder::new("r1", "r1", Trigger::Fact { pattern: "user:*".to_string() }).build(0);
        mgr.register(r, &groups).unwrap();
        assert_eq!(mgr.get_by_fact_pattern("user:U1").len(), 1);
        assert_eq!(mgr.get_by_fact_pattern("order:1").len(), 0);
    }

    #[test]
    fn deleting_group_clears_rule_reference() {
        let mgr = RuleManager::new(|| 0);
        let groups = GroupManager::new(|| 0);
        let group = groups.create("g1".to_string(), None).unwrap();
        let mut r = rule("r1", 0, "t");
        r.group = Some(group.id.clone());
        mgr.register(r, &groups).unwrap();
        mgr.clear_group_reference(&group.id);
        assert_eq!(mgr.get("r1").unwrap().group, None);
    }
}
