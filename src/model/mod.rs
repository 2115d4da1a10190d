pub mod audit;
pub mod fact;
pub mod event;
pub mod rule;

pub use audit::{AuditCategory, AuditEntry, AuditType};
pub use event::{get_path, Event, EventDraft};
pub use fact::{Fact, FactChangeKind};
pub use rule::{
    AggregateFunction, ConditionSource, CountComparison, EventMatcher, LogLevel, OnServiceError,
    Operator, RepeatSpec, Rule, RuleAction, RuleBuilder, RuleCondition, RuleGroup, TemporalPattern,
    Timer, TimerDraft, Trigger, ValueOrRef, parse_duration_ms,
};
