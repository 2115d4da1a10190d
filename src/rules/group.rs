//! Named rule groups with cascade enable/disable (spec §4.8).

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::RuleGroup;

pub struct GroupManager {
    groups: RwLock<HashMap<String, RuleGroup>>,
    now_fn: fn() -> i64,
}

impl GroupManager {
    pub fn new(now_fn: fn() -> i64) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            now_fn,
        }
    }

    pub fn create(&self, name: String, description: Option<String>) -> EngineResult<RuleGroup> {
        let now = (self.now_fn)();
        let group = RuleGroup {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        self.groups.write().unwrap().insert(group.id.clone(), group.clone());
        Ok(group)
    }

    pub fn get(&self, id: &str) -> Option<RuleGroup> {
        self.groups.read().unwrap().get(id).cloned()
    }

    pub fn get_all(&self) -> Vec<RuleGroup> {
        self.groups.read().unwrap().values().cloned().collect()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> EngineResult<RuleGroup> {
        let mut groups = self.groups.write().unwrap();
        let group = groups.get_mut(id).ok_or_else(|| EngineError::not_found(format!("group '{id}' not found")))?;
        group.enabled = enabled;
        group.updated_at = (self.now_fn)();
        Ok(group.clone())
    }

    /// Returns the deleted group's id so callers (the engine) can clear the
    /// reference on every rule pointing at it.
    pub fn delete(&self, id: &str) -> EngineResult<()> {
        self.groups.write().unwrap().remove(id).ok_or_else(|| EngineError::not_found(format!("group '{id}' not found")))?;
        Ok(())
    }

    /// Effective-enabled predicate (spec GLOSSARY): true when the group
    /// either does not exist as a reference (None) or is itself enabled.
    pub fn is_effectively_enabled(&self, group_id: Option<&str>) -> bool {
        match group_id {
            None => true,
            Some(id) => self.get(id).map(|g| g.enabled).unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_group_is_effectively_enabled() {
        let mgr = GroupManager::new(|| 0);
        assert!(mgr.is_effectively_enabled(None));
    }

    #[test]
    fn disabled_group_is_not_effectively_enabled() {
        let mgr = GroupManager::new(|| 0);
        let g = mgr.create("g1".to_string(), None).unwrap();
        mgr.set_enabled(&g.id, false).unwrap();
        assert!(!mgr.is_effectively_enabled(Some(&g.id)));
        mgr.set_enabled(&g.id, true).unwrap();
        assert!(mgr.is_effectively_enabled(Some(&g.id)));
    }
}
