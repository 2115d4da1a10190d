use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The 18 trace event types the engine emits (spec §6 "Trace events"),
/// each mapped to one of 5 audit categories by [`AuditCategory::of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditType {
    RuleRegistered,
    RuleEnabled,
    RuleDisabled,
    RuleTriggered,
    RuleSkipped,
    RuleExecuted,
    RuleFailed,
    ConditionEvaluated,
    ActionStarted,
    ActionCompleted,
    ActionFailed,
    EventEmitted,
    FactCreated,
    FactUpdated,
    FactDeleted,
    TimerScheduled,
    TimerFired,
    EngineStarted,
    EngineStopped,
    StorageError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Lifecycle,
    RuleExecution,
    DataChange,
    Evaluation,
    System,
}

impl AuditType {
    pub fn category(self) -> AuditCategory {
        use AuditCategory::*;
        use AuditType::*;
        match self {
            RuleRegistered | RuleEnabled | RuleDisabled | EngineStarted | EngineStopped => Lifecycle,
            RuleTriggered | RuleSkipped | RuleExecuted | RuleFailed => RuleExecution,
            FactCreated | FactUpdated | FactDeleted | EventEmitted => DataChange,
            ConditionEvaluated | ActionStarted | ActionCompleted | ActionFailed => Evaluation,
            TimerScheduled | TimerFired | StorageError => System,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: i64,
    pub category: AuditCategory,
    pub r#type: AuditType,
    pub summary: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl AuditEntry {
    pub fn new(id: impl Into<String>, timestamp: i64, r#type: AuditType, summary: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp,
            category: r#type.category(),
            r#type,
            summary: summary.into(),
            source: source.into(),
            rule_id: None,
            rule_name: None,
            correlation_id: None,
            details: Map::new(),
            duration_ms: None,
        }
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>, rule_name: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self.rule_name = Some(rule_name.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_table_covers_all_eighteen_plus_storage() {
        assert_eq!(AuditType::RuleExecuted.category(), AuditCategory::RuleExecution);
        assert_eq!(AuditType::FactCreated.category(), AuditCategory::DataChange);
        assert_eq!(AuditType::ActionFailed.category(), AuditCategory::Evaluation);
        assert_eq!(AuditType::TimerFired.category(), AuditCategory::System);
        assert_eq!(AuditType::EngineStarted.category(), AuditCategory::Lifecycle);
    }
}
