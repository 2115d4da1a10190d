//! Depth-first backward-chaining query (spec §4.10 "query(goal)").
//!
//! A goal names a fact and, optionally, the value it must equal
//! (`"key"` for "is this fact truthy", `"key=value"` for exact equality,
//! `value` parsed as JSON or else taken as a literal string). The engine is
//! provable for a goal if the fact already holds it, or if some registered
//! rule would set it and every one of that rule's `fact`-sourced equality
//! conditions is itself provable; any other condition kind is evaluated
//! directly against the current fact store rather than chained through,
//! since events/context/lookups/baselines are not something the engine can
//! derive on its own.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde_json::{Map, Value};

use crate::condition::{ConditionEvaluator, EvaluationContext};
use crate::model::{ConditionSource, Operator, Rule, RuleAction, ValueOrRef};
use crate::rules::RuleManager;
use crate::store::FactStore;

pub const DEFAULT_MAX_DEPTH: usize = 50;

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub is_provable: bool,
    pub proof_trace: Option<Vec<String>>,
    pub goals_explored: usize,
    pub rules_evaluated: usize,
    pub query_time_ms: f64,
}

struct Goal {
    key: String,
    expected: Option<Value>,
}

fn parse_goal(goal: &str) -> Goal {
    match goal.split_once('=') {
        Some((key, value)) => {
            let expected = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
            Goal { key: key.trim().to_string(), expected: Some(expected) }
        }
        None => Goal { key: goal.trim().to_string(), expected: None },
    }
}

fn goal_satisfied(value: &Value, expected: &Option<Value>) -> bool {
    match expected {
        Some(v) => value == v,
        None => !matches!(value, Value::Null | Value::Bool(false)),
    }
}

struct Chainer<'a> {
    facts: &'a FactStore,
    rules: &'a RuleManager,
    max_depth: usize,
    memo: HashMap<String, bool>,
    in_progress: HashSet<String>,
    goals_explored: usize,
    rules_evaluated: usize,
    trace: Vec<String>,
}

impl<'a> Chainer<'a> {
    fn goal_key(goal: &Goal) -> String {
        match &goal.expected {
            Some(v) => format!("{}={v}", goal.key),
            None => goal.key.clone(),
        }
    }

    fn prove(&mut self, goal: &Goal, depth: usize) -> bool {
        let memo_key = Self::goal_key(goal);
        if let Some(cached) = self.memo.get(&memo_key) {
            return *cached;
        }
        if depth > self.max_depth || self.in_progress.contains(&memo_key) {
            return false;
        }
        self.goals_explored += 1;

        if let Some(fact) = self.facts.get(&goal.key) {
            if goal_satisfied(&fact.value, &goal.expected) {
                self.trace.push(format!("fact '{}' already satisfies goal", goal.key));
                self.memo.insert(memo_key, true);
                return true;
            }
        }

        self.in_progress.insert(memo_key.clone());
        let mut rules = self.rules.get_all();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        let mut proven = false;
        for rule in &rules {
            if !rule.enabled || !sets_goal_key(rule, &goal.key, &goal.expected) {
                continue;
            }
            self.rules_evaluated += 1;
            if self.rule_conditions_provable(rule, depth) {
                self.trace.push(format!("rule '{}' proves '{}'", rule.id, goal.key));
                proven = true;
                break;
            }
        }
        self.in_progress.remove(&memo_key);
        self.memo.insert(memo_key, proven);
        proven
    }

    fn rule_conditions_provable(&mut self, rule: &Rule, depth: usize) -> bool {
        let now = 0;
        for condition in &rule.conditions {
            let recurses = matches!(
                (&condition.source, condition.operator, &condition.value),
                (ConditionSource::Fact { pattern }, Operator::Eq, Some(ValueOrRef::Literal(_))) if crate::pattern::is_exact(pattern)
            );
            if recurses {
                let ConditionSource::Fact { pattern } = &condition.source else { unreachable!() };
                let Some(ValueOrRef::Literal(expected)) = &condition.value else { unreachable!() };
                let sub_goal = Goal { key: pattern.clone(), expected: Some(expected.clone()) };
                let holds = self.prove(&sub_goal, depth + 1);
                let holds = if condition.negate { !holds } else { holds };
                if !holds {
                    return false;
                }
            } else {
                let ctx = EvaluationContext::new(self.facts, "query", Map::new(), now);
                if !ConditionEvaluator::evaluate(condition, &ctx) {
                    return false;
                }
            }
        }
        true
    }
}

fn sets_goal_key(rule: &Rule, key: &str, expected: &Option<Value>) -> bool {
    rule.actions.iter().any(|action| match action {
        RuleAction::SetFact { key: k, value } => {
            if k != key {
                return false;
            }
            match (expected, value) {
                (Some(exp), ValueOrRef::Literal(v)) => v == exp,
                _ => true,
            }
        }
        _ => false,
    })
}

/// Runs a depth-first, memoized backward-chaining search for `goal`.
pub fn query(goal: &str, facts: &FactStore, rules: &RuleManager, max_depth: usize) -> QueryResult {
    let started = Instant::now();
    let parsed = parse_goal(goal);
    let mut chainer = Chainer {
        facts,
        rules,
        max_depth,
        memo: HashMap::new(),
        in_progress: HashSet::new(),
        goals_explored: 0,
        rules_evaluated: 0,
        trace: Vec::new(),
    };
    let is_provable = chainer.prove(&parsed, 0);
    QueryResult {
        is_provable,
        proof_trace: if is_provable { Some(chainer.trace) } else { None },
        goals_explored: chainer.goals_explored,
        rules_evaluated: chainer.rules_evaluated,
        query_time_ms: started.elapsed().as_secs_f64() * 1000.0,
    }
}
