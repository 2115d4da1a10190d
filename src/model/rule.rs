use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What activates a rule (spec §3 "Rule.trigger").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Event { topic: String },
    Fact { pattern: String },
    Timer { name: String },
    Temporal { pattern: Box<TemporalPatternDef> },
}

/// A `TemporalPattern` carries its own `groupBy`-keyed rule reference; the
/// trigger variant only needs to name which temporal pattern drives it, so
/// this wraps the pattern definition used for registration/indexing.
pub type TemporalPatternDef = TemporalPattern;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMatcher {
    pub topic: String,
    /// Optional field-level filters the event's `data` must satisfy, in
    /// addition to topic match (dotted path → required literal value).
    #[serde(default)]
    pub filter: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CountComparison {
    Gte,
    Lte,
    Eq,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemporalPattern {
    Sequence {
        events: Vec<EventMatcher>,
        within_ms: i64,
        #[serde(default)]
        group_by: Option<String>,
    },
    Absence {
        after: EventMatcher,
        expected: EventMatcher,
        within_ms: i64,
        #[serde(default)]
        group_by: Option<String>,
    },
    Count {
        event: EventMatcher,
        threshold: u64,
        comparison: CountComparison,
        window_ms: i64,
        #[serde(default)]
        sliding: bool,
    },
    Aggregate {
        event: EventMatcher,
        field: String,
        function: AggregateFunction,
        threshold: f64,
        comparison: CountComparison,
        window_ms: i64,
    },
}

/// Where a condition's left-hand value is resolved from (spec §3/§4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionSource {
    Fact { pattern: String },
    Event { field: String },
    Context { key: String },
    Lookup { name: String },
    Baseline {
        metric: String,
        comparison: String,
        #[serde(default)]
        sensitivity: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
    Matches,
    Exists,
    NotExists,
}

/// A literal value or a `{ref: "root.path"}` resolved at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ValueOrRef {
    Ref { r#ref: String },
    Literal(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleCondition {
    pub source: ConditionSource,
    pub operator: Operator,
    #[serde(default)]
    pub value: Option<ValueOrRef>,
    #[serde(default)]
    pub negate: bool,
}

/// Tagged action variants (spec §3 "RuleAction").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    SetFact {
        key: String,
        value: ValueOrRef,
    },
    DeleteFact {
        key: String,
    },
    EmitEvent {
        topic: String,
        #[serde(default)]
        data: Map<String, Value>,
        #[serde(default)]
        correlation_id: Option<String>,
    },
    SetTimer {
        timer: TimerDraft,
    },
    CancelTimer {
        name: String,
    },
    CallService {
        service: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        result_key: Option<String>,
        #[serde(default)]
        on_error: OnServiceError,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    Conditional {
        conditions: Vec<RuleCondition>,
        then: Vec<RuleAction>,
        #[serde(default)]
        r#else: Vec<RuleAction>,
    },
    ForEach {
        items: ValueOrRef,
        body: Vec<RuleAction>,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnServiceError {
    #[default]
    Continue,
    Fail,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepeatSpec {
    pub interval_ms: i64,
    #[serde(default)]
    pub max_count: Option<u64>,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerDraft {
    pub name: String,
    pub duration_ms: i64,
    pub on_expire_topic: String,
    #[serde(default)]
    pub on_expire_data: Map<String, Value>,
    #[serde(default)]
    pub repeat: Option<RepeatSpec>,
}

/// A scheduled, named, one-shot-or-repeating timer (spec §3 "Timer").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timer {
    pub name: String,
    pub on_expire_topic: String,
    pub on_expire_data: Map<String, Value>,
    pub expires_at: i64,
    pub repeat: Option<RepeatSpec>,
    /// Correlation propagated to the emitted expiry event, so a cascade
    /// started by a rule action that set this timer stays traceable.
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleGroup {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Parses the duration grammar `^\d+(ms|s|m|h|d|w|y)$`, bare digits = ms.
pub fn parse_duration_ms(spec: &str) -> Result<i64, String> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err("duration string is empty".to_string());
    }
    if let Ok(ms) = spec.parse::<i64>() {
        return Ok(ms);
    }
    let split_at = spec
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("invalid duration: {spec}"))?;
    let (digits, unit) = spec.split_at(split_at);
    let n: i64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {spec}"))?;
    let multiplier = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "y" => 365 * 86_400_000,
        other => return Err(format!("unknown duration unit: {other}")),
    };
    Ok(n * multiplier)
}

/// A registered trigger → conditions → actions rule (spec §3 "Rule").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub priority: i32,
    pub enabled: bool,
    pub tags: HashSet<String>,
    pub group: Option<String>,
    pub trigger: Trigger,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_fired_at: Option<i64>,
    pub fire_count: u64,
    pub version: u64,
}

/// Builder mirroring the teacher's preference for explicit construction over
/// ad hoc struct literals scattered through call sites.
pub struct RuleBuilder {
    id: String,
    name: String,
    description: Option<String>,
    priority: i32,
    enabled: bool,
    tags: HashSet<String>,
    group: Option<String>,
    trigger: Trigger,
    conditions: Vec<RuleCondition>,
    actions: Vec<RuleAction>,
}

impl RuleBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            priority: 0,
            enabled: true,
            tags: HashSet::new(),
            group: None,
            trigger,
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn condition(mut self, condition: RuleCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn action(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn build(self, now: i64) -> Rule {
        Rule {
            id: self.id,
            name: self.name,
            description: self.description,
            priority: self.priority,
            enabled: self.enabled,
            tags: self.tags,
            group: self.group,
            trigger: self.trigger,
            conditions: self.conditions,
            actions: self.actions,
            created_at: now,
            updated_at: now,
            last_fired_at: None,
            fire_count: 0,
            version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_digits_are_milliseconds() {
        assert_eq!(parse_duration_ms("500").unwrap(), 500);
    }

    #[test]
    fn unit_suffixes_convert_correctly() {
        assert_eq!(parse_duration_ms("5m").unwrap(), 300_000);
        assert_eq!(parse_duration_ms("2h").unwrap(), 7_200_000);
        assert_eq!(parse_duration_ms("1d").unwrap(), 86_400_000);
        assert_eq!(parse_duration_ms("100ms").unwrap(), 100);
    }

    #[test]
    fn rejects_malformed_duration() {
        assert!(parse_duration_ms("").is_err());
        assert!(parse_duration_ms("5x").is_err());
        assert!(parse_duration_ms("abc").is_err());
    }
}
