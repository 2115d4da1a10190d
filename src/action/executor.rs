//! Executes a rule's action list against an [`EvaluationContext`],
//! producing [`Effect`]s the dispatcher applies once the whole list
//! completes (spec §4.5 "Serialization").

use std::time::Duration;

use serde_json::{Map, Value};

use crate::condition::{materialize_json, materialize_value_or_ref, ConditionEvaluator, EvaluationContext};
use crate::error::{EngineError, EngineResult};
use crate::model::{LogLevel, OnServiceError, RuleAction, TimerDraft};
use crate::services::ServiceRegistry;

/// One deferred outcome of running a single action. The dispatcher applies
/// `SetFact`/`DeleteFact`/`SetTimer`/`CancelTimer` atomically once the
/// action list finishes, and enqueues `EmitEvent` for FIFO delivery after.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SetFact { key: String, value: Value },
    DeleteFact { key: String },
    EmitEvent { topic: String, data: Map<String, Value>, correlation_id: Option<String> },
    SetTimer { draft: TimerDraft },
    CancelTimer { name: String },
    Log { level: LogLevel, message: String },
}

pub struct ActionExecutor;

impl ActionExecutor {
    /// Runs `actions` in order against `ctx`, consulting `registry` for
    /// `call_service`. A `call_service` failure with `on_error: fail` aborts
    /// the whole list and returns `Err`; any other action failure is
    /// reported inline as an `Err` too, since the caller (the dispatcher)
    /// is the one with enough context to turn it into an audit entry and
    /// decide whether to keep going — this executor never swallows errors.
    pub async fn execute_all(
        rule_id: &str,
        actions: &[RuleAction],
        ctx: &mut EvaluationContext<'_>,
        registry: &dyn ServiceRegistry,
        action_timeout: Duration,
    ) -> Vec<EngineResult<Vec<Effect>>> {
        let mut results = Vec::with_capacity(actions.len());
        let mut index = 0usize;
        for action in actions {
            let outcome = Self::execute_one(rule_id, action, ctx, registry, action_timeout, &mut index).await;
            let should_abort = matches!(
                (&outcome, action),
                (Err(_), RuleAction::CallService { on_error: OnServiceError::Fail, .. })
            );
            results.push(outcome);
            if should_abort {
                break;
            }
        }
        results
    }

    async fn execute_one(
        rule_id: &str,
        action: &RuleAction,
        ctx: &mut EvaluationContext<'_>,
        registry: &dyn ServiceRegistry,
        action_timeout: Duration,
        index: &mut usize,
    ) -> EngineResult<Vec<Effect>> {
        let my_index = *index;
        *index += 1;
        match action {
            RuleAction::SetFact { key, value } => {
                let key = crate::condition::interpolate(key, ctx);
                let value = materialize_value_or_ref(value, ctx);
                Ok(vec![Effect::SetFact { key, value }])
            }
            RuleAction::DeleteFact { key } => {
                let key = crate::condition::interpolate(key, ctx);
                Ok(vec![Effect::DeleteFact { key }])
            }
            RuleAction::EmitEvent { topic, data, correlation_id } => {
                let topic = crate::condition::interpolate(topic, ctx);
                let data = match materialize_json(&Value::Object(data.clone()), ctx) {
                    Value::Object(m) => m,
                    _ => Map::new(),
                };
                let correlation_id = correlation_id.clone().or_else(|| ctx.variables.get("__correlation_id").and_then(|v| v.as_str()).map(str::to_string));
                Ok(vec![Effect::EmitEvent { topic, data, correlation_id }])
            }
            RuleAction::SetTimer { timer } => {
                let name = crate::condition::interpolate(&timer.name, ctx);
                let on_expire_topic = crate::condition::interpolate(&timer.on_expire_topic, ctx);
                let on_expire_data = match materialize_json(&Value::Object(timer.on_expire_data.clone()), ctx) {
                    Value::Object(m) => m,
                    _ => Map::new(),
                };
                Ok(vec![Effect::SetTimer {
                    draft: TimerDraft {
                        name,
                        duration_ms: timer.duration_ms,
                        on_expire_topic,
                        on_expire_data,
                        repeat: timer.repeat.clone(),
                    },
                }])
            }
            RuleAction::CancelTimer { name } => {
                let name = crate::condition::interpolate(name, ctx);
                Ok(vec![Effect::CancelTimer { name }])
            }
            RuleAction::CallService { service, method, args, result_key, on_error } => {
                let resolved_args: Vec<Value> = args.iter().map(|a| materialize_json(a, ctx)).collect();
                let call = registry.call(service, method, &resolved_args);
                let result = match tokio::time::timeout(action_timeout, call).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(EngineError::Timeout(action_timeout)),
                };
                match result {
                    Ok(value) => {
                        if let Some(key) = result_key {
                            ctx.variables.insert(key.clone(), value);
                        }
                        Ok(vec![])
                    }
                    Err(e) => {
                        let wrapped = EngineError::ActionFailed {
                            rule_id: rule_id.to_string(),
                            action_index: my_index,
                            message: e.to_string(),
                        };
                        match on_error {
                            OnServiceError::Fail => Err(wrapped),
                            OnServiceError::Continue => Err(wrapped),
                        }
                    }
                }
            }
            RuleAction::Log { level, message } => {
                let message = crate::condition::interpolate(message, ctx);
                Ok(vec![Effect::Log { level: *level, message }])
            }
            RuleAction::Conditional { conditions, then, r#else } => {
                let branch = if ConditionEvaluator::evaluate_all(conditions, ctx) { then } else { r#else };
                let mut effects = Vec::new();
                for sub in branch {
                    effects.extend(Box::pin(Self::execute_one(rule_id, sub, ctx, registry, action_timeout, index)).await?);
                }
                Ok(effects)
            }
            RuleAction::ForEach { items, body } => {
                let resolved = materialize_value_or_ref(items, ctx);
                let Value::Array(elements) = resolved else {
                    return Ok(vec![]);
                };
                let mut effects = Vec::new();
                for element in elements {
                    ctx.variables.insert("item".to_string(), element);
                    for sub in body {
                        effects.extend(Box::pin(Self::execute_one(rule_id, sub, ctx, registry, action_timeout, index)).await?);
                    }
                }
                ctx.variables.remove("item");
                Ok(effects)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConditionSource, Operator, RuleCondition, ValueOrRef};
    use crate::store::FactStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoRegistry;

    #[async_trait]
    impl ServiceRegistry for EchoRegistry {
        async fn call(&self, _service: &str, _method: &str, args: &[Value]) -> EngineResult<Value> {
            Ok(args.first().cloned().unwrap_or(Value::Null))
        }
    }

    struct FailingRegistry;

    #[async_trait]
    impl ServiceRegistry for FailingRegistry {
        async fn call(&self, _service: &str, _method: &str, _args: &[Value]) -> EngineResult<Value> {
            Err(EngineError::invalid_argument("boom"))
        }
    }

    fn ctx(facts: &FactStore) -> EvaluationContext<'_> {
        EvaluationContext::new(facts, "event", Map::new(), 0)
    }

    #[tokio::test]
    async fn set_fact_resolves_ref_into_a_set_fact_effect() {
        let facts = FactStore::new(|| 0);
        let mut data = Map::new();
        data.insert("userId".to_string(), json!("U1"));
        let mut c = ctx(&facts);
        c.trigger_data = data;
        let registry = EchoRegistry;
        let actions = vec![RuleAction::SetFact {
            key: "user:last".to_string(),
            value: ValueOrRef::Ref { r#ref: "event.userId".to_string() },
        }];
        let results = ActionExecutor::execute_all("r1", &actions, &mut c, &registry, Duration::from_secs(1)).await;
        let effects = results[0].as_ref().unwrap();
        assert_eq!(effects[0], Effect::SetFact { key: "user:last".to_string(), value: json!("U1") });
    }

    #[tokio::test]
    async fn call_service_writes_result_key_into_variables() {
        let facts = FactStore::new(|| 0);
        let mut c = ctx(&facts);
        let registry = EchoRegistry;
        let actions = vec![RuleAction::CallService {
            service: "svc".to_string(),
            method: "m".to_string(),
            args: vec![json!(42)],
            result_key: Some("out".to_string()),
            on_error: OnServiceError::Continue,
        }];
        let results = ActionExecutor::execute_all("r1", &actions, &mut c, &registry, Duration::from_secs(1)).await;
        assert!(results[0].is_ok());
        assert_eq!(c.variables.get("out"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn call_service_fail_policy_aborts_remaining_actions() {
        let facts = FactStore::new(|| 0);
        let mut c = ctx(&facts);
        let registry = FailingRegistry;
        let actions = vec![
            RuleAction::CallService {
                service: "svc".to_string(),
                method: "m".to_string(),
                args: vec![],
                result_key: None,
                on_error: OnServiceError::Fail,
            },
            RuleAction::Log { level: LogLevel::Info, message: "should not run".to_string() },
        ];
        let results = ActionExecutor::execute_all("r1", &actions, &mut c, &registry, Duration::from_secs(1)).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(EngineError::ActionFailed { .. })));
    }

    #[tokio::test]
    async fn for_each_binds_item_variable_per_element() {
        let facts = FactStore::new(|| 0);
        let mut c = ctx(&facts);
        let registry = EchoRegistry;
        let actions = vec![RuleAction::ForEach {
            items: ValueOrRef::Literal(json!([1, 2, 3])),
            body: vec![RuleAction::SetFact {
                key: "last_item".to_string(),
                value: ValueOrRef::Ref { r#ref: "var.item".to_string() },
            }],
        }];
        let results = ActionExecutor::execute_all("r1", &actions, &mut c, &registry, Duration::from_secs(1)).await;
        let effects = results[0].as_ref().unwrap();
        assert_eq!(effects.len(), 3);
        assert_eq!(effects[2], Effect::SetFact { key: "last_item".to_string(), value: json!(3) });
    }

    #[tokio::test]
    async fn conditional_runs_then_or_else_branch() {
        let facts = FactStore::new(|| 0);
        let mut c = ctx(&facts);
        c.variables.insert("flag".to_string(), json!(true));
        let registry = EchoRegistry;
        let cond = RuleCondition {
            source: ConditionSource::Context { key: "flag".to_string() },
            operator: Operator::Eq,
            value: Some(ValueOrRef::Literal(json!(true))),
            negate: false,
        };
        let actions = vec![RuleAction::Conditional {
            conditions: vec![cond],
            then: vec![RuleAction::Log { level: LogLevel::Info, message: "yes".to_string() }],
            r#else: vec![RuleAction::Log { level: LogLevel::Info, message: "no".to_string() }],
        }];
        let results = ActionExecutor::execute_all("r1", &actions, &mut c, &registry, Duration::from_secs(1)).await;
        let effects = results[0].as_ref().unwrap();
        assert_eq!(effects[0], Effect::Log { level: LogLevel::Info, message: "yes".to_string() });
    }
}
