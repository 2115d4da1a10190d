//! Operator + source-resolution + fact-pattern interpolation (spec §4.4).

use regex::Regex;
use serde_json::{Map, Value};

use crate::model::{event::get_path, ConditionSource, Operator, RuleCondition, ValueOrRef};
use crate::store::FactStore;

/// Everything a condition (or a `{ref:...}`) is evaluated against.
pub struct EvaluationContext<'a> {
    pub trigger_kind: String,
    pub trigger_data: Map<String, Value>,
    pub facts: &'a FactStore,
    pub variables: Map<String, Value>,
    pub lookups: Map<String, Value>,
    /// Anomaly verdicts resolved by the dispatcher before conditions run,
    /// keyed by metric name (spec §4.4 `baseline(...)`).
    pub baseline: Map<String, Value>,
    pub now: i64,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(facts: &'a FactStore, trigger_kind: impl Into<String>, trigger_data: Map<String, Value>, now: i64) -> Self {
        Self {
            trigger_kind: trigger_kind.into(),
            trigger_data,
            facts,
            variables: Map::new(),
            lookups: Map::new(),
            baseline: Map::new(),
            now,
        }
    }
}

/// A resolved condition source: either a single (possibly undefined) value,
/// or — for wildcard fact patterns — the multiset of matching fact values.
enum Resolved {
    Single(Option<Value>),
    Multi(Vec<Value>),
}

pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn evaluate(condition: &RuleCondition, ctx: &EvaluationContext) -> bool {
        let resolved = resolve_source(&condition.source, ctx);
        let right = condition
            .value
            .as_ref()
            .map(|v| resolve_value_or_ref(v, ctx))
            .unwrap_or(None);

        let result = match resolved {
            Resolved::Single(left) => apply_operator(condition.operator, left.as_ref(), right.as_ref()),
            Resolved::Multi(values) => values.iter().any(|v| apply_operator(condition.operator, Some(v), right.as_ref())),
        };

        if condition.negate {
            !result
        } else {
            result
        }
    }

    /// Short-circuit AND, in order (spec §4.4).
    pub fn evaluate_all(conditions: &[RuleCondition], ctx: &EvaluationContext) -> bool {
        conditions.iter().all(|c| Self::evaluate(c, ctx))
    }
}

/// Replace `${event.path}` / `${var.name}` / `${context.key}` tokens inside
/// a fact pattern string with their resolved, stringified values.
pub fn interpolate(template: &str, ctx: &EvaluationContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let token = &after[..end];
        let resolved = resolve_token(token, ctx);
        out.push_str(&resolved.map(value_to_interp_string).unwrap_or_default());
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve_token(token: &str, ctx: &EvaluationContext) -> Option<Value> {
    let (root, path) = token.split_once('.')?;
    match root {
        "event" => get_path(&ctx.trigger_data, path).cloned(),
        "var" => dotted_get(&Value::Object(ctx.variables.clone()), path),
        "context" => dotted_get(&Value::Object(ctx.variables.clone()), path),
        _ => None,
    }
}

fn value_to_interp_string(v: Value) -> String {
    match v {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn resolve_source(source: &ConditionSource, ctx: &EvaluationContext) -> Resolved {
    match source {
        ConditionSource::Fact { pattern } => {
            let interpolated = interpolate(pattern, ctx);
            if crate::pattern::is_exact(&interpolated) {
                Resolved::Single(ctx.facts.get(&interpolated).map(|f| f.value))
            } else {
                let values: Vec<Value> = ctx.facts.query(&interpolated).into_iter().map(|f| f.value).collect();
                Resolved::Multi(values)
            }
        }
        ConditionSource::Event { field } => Resolved::Single(get_path(&ctx.trigger_data, field).cloned()),
        ConditionSource::Context { key } => Resolved::Single(ctx.variables.get(key).cloned()),
        ConditionSource::Lookup { name } => {
            let (head, rest) = name.split_once('.').map(|(h, r)| (h, Some(r))).unwrap_or((name.as_str(), None));
            let base = ctx.lookups.get(head).cloned();
            Resolved::Single(match (base, rest) {
                (Some(v), Some(path)) => dotted_get(&v, path),
                (v, None) => v,
                _ => None,
            })
        }
        ConditionSource::Baseline { metric, .. } => {
            // The dispatcher calls the configured BaselineStore and populates
            // ctx.baseline[metric] with the verdict's `is_anomaly` bool before
            // conditions run. Absence means no BaselineStore is configured, or
            // the metric has no matching fact to check.
            Resolved::Single(ctx.baseline.get(metric).cloned())
        }
    }
}

fn resolve_value_or_ref(value: &ValueOrRef, ctx: &EvaluationContext) -> Option<Value> {
    match value {
        ValueOrRef::Literal(v) => Some(v.clone()),
        ValueOrRef::Ref { r#ref } => resolve_ref_path(r#ref, ctx),
    }
}

/// Resolves a `"<root>.<dotted-path>"` reference (spec §4.4 "Reference
/// resolution"), root ∈ {event, fact, var, context, lookup}.
pub fn resolve_ref_path(r#ref: &str, ctx: &EvaluationContext) -> Option<Value> {
    let (root, path) = r#ref.split_once('.')?;
    match root {
        "event" => get_path(&ctx.trigger_data, path).cloned(),
        "fact" => ctx.facts.get(path).map(|f| f.value),
        "var" | "context" => ctx
            .variables
            .get(path)
            .cloned()
            .or_else(|| dotted_get(&Value::Object(ctx.variables.clone()), path)),
        "lookup" => dotted_get(&Value::Object(ctx.lookups.clone()), path),
        _ => None,
    }
}

/// Resolves a [`ValueOrRef`], recursing into literal JSON for any embedded
/// `{ref: ...}` placeholders or `${...}` string tokens (spec §4.5
/// "Reference materialization").
pub fn materialize_value_or_ref(value: &ValueOrRef, ctx: &EvaluationContext) -> Value {
    match value {
        ValueOrRef::Ref { r#ref } => resolve_ref_path(r#ref, ctx).unwrap_or(Value::Null),
        ValueOrRef::Literal(v) => materialize_json(v, ctx),
    }
}

/// Deep-walks a JSON value, replacing single-key `{"ref": "<path>"}` objects
/// with their resolved value and interpolating `${...}` tokens in strings.
pub fn materialize_json(value: &Value, ctx: &EvaluationContext) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(r)) = map.get("ref") {
                    return resolve_ref_path(r, ctx).unwrap_or(Value::Null);
                }
            }
            Value::Object(map.iter().map(|(k, v)| (k.clone(), materialize_json(v, ctx))).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(|v| materialize_json(v, ctx)).collect()),
        Value::String(s) if s.contains("${") => Value::String(interpolate(s, ctx)),
        other => other.clone(),
    }
}

fn dotted_get(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for seg in path.split('.') {
        current = current.as_object()?.get(seg)?;
    }
    Some(current.clone())
}

fn apply_operator(op: Operator, left: Option<&Value>, right: Option<&Value>) -> bool {
    match op {
        Operator::Exists => left.is_some() && !matches!(left, Some(Value::Null)),
        Operator::NotExists => left.is_none() || matches!(left, Some(Value::Null)),
        _ => {
            let (Some(l), Some(r)) = (left, right) else { return false };
            match op {
                Operator::Eq => l == r,
                Operator::Neq => l != r,
                Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                    let (Some(lf), Some(rf)) = (l.as_f64(), r.as_f64()) else { return false };
                    match op {
                        Operator::Gt => lf > rf,
                        Operator::Gte => lf >= rf,
                        Operator::Lt => lf < rf,
                        Operator::Lte => lf <= rf,
                        _ => unreachable!(),
                    }
                }
                Operator::In => r.as_array().map(|arr| arr.contains(l)).unwrap_or(false),
                Operator::NotIn => !r.as_array().map(|arr| arr.contains(l)).unwrap_or(false),
                Operator::Contains => match (l, r) {
                    (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                    (Value::Array(arr), needle) => arr.contains(needle),
                    _ => false,
                },
                Operator::NotContains => !match (l, r) {
                    (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                    (Value::Array(arr), needle) => arr.contains(needle),
                    _ => false,
                },
                Operator::Matches => {
                    let Some(pattern) = r.as_str() else { return false };
                    let Ok(re) = Regex::new(pattern) else { return false };
                    let haystack = match l {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    re.is_match(&haystack)
                }
                Operator::Exists | Operator::NotExists => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuleCondition;
    use serde_json::json;

    fn facts() -> FactStore {
        FactStore::new(|| 0)
    }

    fn condition(source: ConditionSource, operator: Operator, value: Option<Value>) -> RuleCondition {
        RuleCondition {
            source,
            operator,
            value: value.map(ValueOrRef::Literal),
            negate: false,
        }
    }

    #[test]
    fn undefined_propagates_false_except_for_exists() {
        let store = facts();
        let ctx = EvaluationContext::new(&store, "event", Map::new(), 0);
        let c = condition(ConditionSource::Fact { pattern: "missing".into() }, Operator::Eq, Some(json!(1)));
        assert!(!ConditionEvaluator::evaluate(&c, &ctx));

        let c = condition(ConditionSource::Fact { pattern: "missing".into() }, Operator::NotExists, None);
        assert!(ConditionEvaluator::evaluate(&c, &ctx));
    }

    #[test]
    fn numeric_comparison_requires_both_sides_finite() {
        let store = facts();
        store.set("n", json!(10), "t").unwrap();
        let ctx = EvaluationContext::new(&store, "event", Map::new(), 0);
        let c = condition(ConditionSource::Fact { pattern: "n".into() }, Operator::Gt, Some(json!(5)));
        assert!(ConditionEvaluator::evaluate(&c, &ctx));

        let c = condition(ConditionSource::Fact { pattern: "n".into() }, Operator::Gt, Some(json!("not a number")));
        assert!(!ConditionEvaluator::evaluate(&c, &ctx));
    }

    #[test]
    fn negate_flips_final_result() {
        let store = facts();
        store.set("n", json!(10), "t").unwrap();
        let ctx = EvaluationContext::new(&store, "event", Map::new(), 0);
        let mut c = condition(ConditionSource::Fact { pattern: "n".into() }, Operator::Eq, Some(json!(10)));
        c.negate = true;
        assert!(!ConditionEvaluator::evaluate(&c, &ctx));
    }

    #[test]
    fn wildcard_fact_pattern_resolves_to_multiset_membership() {
        let store = facts();
        store.set("score:a", json!(1), "t").unwrap();
        store.set("score:b", json!(2), "t").unwrap();
        let ctx = EvaluationContext::new(&store, "event", Map::new(), 0);
        let c = condition(ConditionSource::Fact { pattern: "score:*".into() }, Operator::Eq, Some(json!(2)));
        assert!(ConditionEvaluator::evaluate(&c, &ctx));
        let c = condition(ConditionSource::Fact { pattern: "score:*".into() }, Operator::Eq, Some(json!(3)));
        assert!(!ConditionEvaluator::evaluate(&c, &ctx));
    }

    #[test]
    fn interpolation_resolves_event_tokens_in_fact_pattern() {
        let store = facts();
        store.set("user:U1:profile", json!("p"), "t").unwrap();
        let mut data = Map::new();
        data.insert("userId".to_string(), json!("U1"));
        let ctx = EvaluationContext::new(&store, "event", data, 0);
        let c = condition(ConditionSource::Fact { pattern: "user:${event.userId}:profile".into() }, Operator::Eq, Some(json!("p")));
        assert!(ConditionEvaluator::evaluate(&c, &ctx));
    }

    #[test]
    fn evaluate_all_short_circuits_in_order() {
        let store = facts();
        let ctx = EvaluationContext::new(&store, "event", Map::new(), 0);
        let conditions = vec![
            condition(ConditionSource::Context { key: "x".into() }, Operator::Exists, None),
        ];
        assert!(!ConditionEvaluator::evaluate_all(&conditions, &ctx));
    }

    #[test]
    fn deep_structural_equality_for_objects() {
        let store = facts();
        store.set("obj", json!({"a": 1, "b": [1,2]}), "t").unwrap();
        let ctx = EvaluationContext::new(&store, "event", Map::new(), 0);
        let c = condition(ConditionSource::Fact { pattern: "obj".into() }, Operator::Eq, Some(json!({"a": 1, "b": [1,2]})));
        assert!(ConditionEvaluator::evaluate(&c, &ctx));
    }
}
