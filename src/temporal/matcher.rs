//! Per-pattern temporal state machines (spec §4.6): `sequence`, `absence`,
//! `count`, `aggregate`. `ingest(event)` advances every registered pattern
//! and returns the firings produced; `tick(now)` additionally drives
//! `absence` deadlines that elapse without a matching event ever arriving.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::model::event::get_path;
use crate::model::{AggregateFunction, CountComparison, Event, EventMatcher, TemporalPattern};

#[derive(Debug, Clone)]
pub struct TemporalFiring {
    pub rule_id: String,
    pub matches: Vec<Event>,
    pub group_by: Option<String>,
}

struct SequencePartial {
    step: usize,
    collected: Vec<Event>,
    started_at: i64,
}

struct AbsenceDeadline {
    after_event: Event,
    deadline: i64,
}

struct CountState {
    timestamps: VecDeque<i64>,
    armed: bool,
    last_fired_window: Option<i64>,
}

struct AggregateState {
    samples: VecDeque<(i64, f64)>,
    armed: bool,
}

enum PatternState {
    Sequence { groups: HashMap<String, Vec<SequencePartial>> },
    Absence { groups: HashMap<String, AbsenceDeadline> },
    Count { groups: HashMap<String, CountState> },
    Aggregate { groups: HashMap<String, AggregateState> },
}

struct Registration {
    pattern: TemporalPattern,
    state: PatternState,
}

/// Owns runtime state for every rule with a `Temporal` trigger.
pub struct TemporalMatcher {
    registrations: RwLock<HashMap<String, Registration>>,
    now_fn: fn() -> i64,
}

impl TemporalMatcher {
    pub fn new(now_fn: fn() -> i64) -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            now_fn,
        }
    }

    pub fn register(&self, rule_id: &str, pattern: TemporalPattern) {
        let state = match &pattern {
            TemporalPattern::Sequence { .. } => PatternState::Sequence { groups: HashMap::new() },
            TemporalPattern::Absence { .. } => PatternState::Absence { groups: HashMap::new() },
            TemporalPattern::Count { .. } => PatternState::Count { groups: HashMap::new() },
            TemporalPattern::Aggregate { .. } => PatternState::Aggregate { groups: HashMap::new() },
        };
        self.registrations.write().unwrap().insert(rule_id.to_string(), Registration { pattern, state });
    }

    pub fn unregister(&self, rule_id: &str) {
        self.registrations.write().unwrap().remove(rule_id);
    }

    /// Advances every registered pattern with `event`, returning firings.
    pub fn ingest(&self, event: &Event) -> Vec<TemporalFiring> {
        let now = (self.now_fn)();
        let mut registrations = self.registrations.write().unwrap();
        let mut firings = Vec::new();
        for (rule_id, reg) in registrations.iter_mut() {
            match (&reg.pattern, &mut reg.state) {
                (TemporalPattern::Sequence { events, within_ms, group_by }, PatternState::Sequence { groups }) => {
                    ingest_sequence(rule_id, events, *within_ms, group_by.as_deref(), groups, event, now, &mut firings);
                }
                (TemporalPattern::Absence { after, expected, within_ms, group_by }, PatternState::Absence { groups }) => {
                    ingest_absence(after, expected, *within_ms, group_by.as_deref(), groups, event, now);
                }
                (TemporalPattern::Count { event: matcher, threshold, comparison, window_ms, sliding }, PatternState::Count { groups }) => {
                    ingest_count(rule_id, matcher, *threshold, *comparison, *window_ms, *sliding, groups, event, now, &mut firings);
                }
                (TemporalPattern::Aggregate { event: matcher, field, function, threshold, comparison, window_ms }, PatternState::Aggregate { groups }) => {
                    ingest_aggregate(rule_id, matcher, field, *function, *threshold, *comparison, *window_ms, groups, event, now, &mut firings);
                }
                _ => unreachable!("pattern and state kind always constructed together"),
            }
        }
        firings
    }

    /// Drives `absence` deadlines that elapse without ever seeing the
    /// `expected` event; call periodically (the dispatcher's timer loop).
    pub fn tick(&self, now: i64) -> Vec<TemporalFiring> {
        let mut registrations = self.registrations.write().unwrap();
        let mut firings = Vec::new();
        for (rule_id, reg) in registrations.iter_mut() {
            if let PatternState::Absence { groups } = &mut reg.state {
                let elapsed: Vec<String> = groups
                    .iter()
                    .filter(|(_, d)| d.deadline <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in elapsed {
                    if let Some(deadline) = groups.remove(&key) {
                        firings.push(TemporalFiring {
                            rule_id: rule_id.clone(),
                            matches: vec![deadline.after_event],
                            group_by: Some(key),
                        });
                    }
                }
            }
        }
        firings
    }
}

fn matches_event(matcher: &EventMatcher, event: &Event) -> bool {
    if matcher.topic != event.topic {
        return false;
    }
    matcher.filter.iter().all(|(path, expected)| get_path(&event.data, path) == Some(expected))
}

fn group_key(group_by: Option<&str>, event: &Event) -> String {
    match group_by {
        None => "_".to_string(),
        Some(path) => {
            let path = path.strip_prefix("data.").unwrap_or(path);
            get_path(&event.data, path).map(|v| v.to_string()).unwrap_or_else(|| "_".to_string())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn ingest_sequence(
    rule_id: &str,
    steps: &[EventMatcher],
    within_ms: i64,
    group_by: Option<&str>,
    groups: &mut HashMap<String, Vec<SequencePartial>>,
    event: &Event,
    now: i64,
    firings: &mut Vec<TemporalFiring>,
) {
    if steps.is_empty() {
        return;
    }
    let key = group_key(group_by, event);
    let partials = groups.entry(key.clone()).or_default();
    partials.retain(|p| now - p.started_at <= within_ms);

    let mut completed = None;
    for partial in partials.iter_mut() {
        if partial.step < steps.len() && matches_event(&steps[partial.step], event) {
            partial.collected.push(event.clone());
            partial.step += 1;
            if partial.step == steps.len() {
                completed = Some(partial.collected.clone());
            }
            break;
        }
    }
    if let Some(matches) = completed {
        partials.retain(|p| p.step < steps.len());
        firings.push(TemporalFiring { rule_id: rule_id.to_string(), matches, group_by: group_by.map(|_| key.clone()) });
    }
    if matches_event(&steps[0], event) {
        partials.push(SequencePartial { step: 1, collected: vec![event.clone()], started_at: now });
    }
}

fn ingest_absence(
    after: &EventMatcher,
    expected: &EventMatcher,
    within_ms: i64,
    group_by: Option<&str>,
    groups: &mut HashMap<String, AbsenceDeadline>,
    event: &Event,
    now: i64,
) {
    let key = group_key(group_by, event);
    if matches_event(expected, event) {
        groups.remove(&key);
        return;
    }
    if matches_event(after, event) {
        groups.insert(key, AbsenceDeadline { after_event: event.clone(), deadline: now + within_ms });
    }
}

#[allow(clippy::too_many_arguments)]
fn ingest_count(
    rule_id: &str,
    matcher: &EventMatcher,
    threshold: u64,
    comparison: CountComparison,
    window_ms: i64,
    sliding: bool,
    groups: &mut HashMap<String, CountState>,
    event: &Event,
    now: i64,
    firings: &mut Vec<TemporalFiring>,
) {
    if !matches_event(matcher, event) {
        return;
    }
    let key = group_key(None, event);
    let state = groups.entry(key.clone()).or_insert_with(|| CountState { timestamps: VecDeque::new(), armed: true, last_fired_window: None });
    state.timestamps.push_back(now);
    while let Some(&front) = state.timestamps.front() {
        if now - front > window_ms {
            state.timestamps.pop_front();
        } else {
            break;
        }
    }
    let count = state.timestamps.len() as u64;
    let crosses = match comparison {
        CountComparison::Gte => count >= threshold,
        CountComparison::Lte => count <= threshold,
        CountComparison::Eq => count == threshold,
    };

    if sliding {
        if crosses && state.armed {
            state.armed = false;
            firings.push(TemporalFiring { rule_id: rule_id.to_string(), matches: vec![event.clone()], group_by: None });
        } else if !crosses {
            state.armed = true;
        }
    } else {
        let window_index = now / window_ms.max(1);
        if crosses && state.last_fired_window != Some(window_index) {
            state.last_fired_window = Some(window_index);
            firings.push(TemporalFiring { rule_id: rule_id.to_string(), matches: vec![event.clone()], group_by: None });
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn ingest_aggregate(
    rule_id: &str,
    matcher: &EventMatcher,
    field: &str,
    function: AggregateFunction,
    threshold: f64,
    comparison: CountComparison,
    window_ms: i64,
    groups: &mut HashMap<String, AggregateState>,
    event: &Event,
    now: i64,
    firings: &mut Vec<TemporalFiring>,
) {
    if !matches_event(matcher, event) {
        return;
    }
    let Some(value) = get_path(&event.data, field).and_then(|v| v.as_f64()) else {
        return;
    };
    let key = group_key(None, event);
    let state = groups.entry(key).or_insert_with(|| AggregateState { samples: VecDeque::new(), armed: true });
    state.samples.push_back((now, value));
    while let Some(&(ts, _)) = state.samples.front() {
        if now - ts > window_ms {
            state.samples.pop_front();
        } else {
            break;
        }
    }
    if state.samples.is_empty() {
        return;
    }
    let aggregate = match function {
        AggregateFunction::Sum => state.samples.iter().map(|(_, v)| v).sum(),
        AggregateFunction::Avg => state.samples.iter().map(|(_, v)| v).sum::<f64>() / state.samples.len() as f64,
        AggregateFunction::Min => state.samples.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min),
        AggregateFunction::Max => state.samples.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max),
        AggregateFunction::Count => state.samples.len() as f64,
    };
    let crosses = match comparison {
        CountComparison::Gte => aggregate >= threshold,
        CountComparison::Lte => aggregate <= threshold,
        CountComparison::Eq => (aggregate - threshold).abs() < f64::EPSILON,
    };
    if crosses && state.armed {
        state.armed = false;
        firings.push(TemporalFiring { rule_id: rule_id.to_string(), matches: vec![event.clone()], group_by: None });
    } else if !crosses {
        state.armed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn event(topic: &str, ts: i64, data: Map<String, serde_json::Value>) -> Event {
        Event {
            id: format!("e-{ts}"),
            topic: topic.to_string(),
            data,
            timestamp: ts,
            source: "test".to_string(),
            correlation_id: None,
            causation_id: None,
        }
    }

    #[test]
    fn sequence_fires_once_all_steps_match_within_window() {
        let matcher = TemporalMatcher::new(|| 0);
        let mut data = Map::new();
        data.insert("userId".to_string(), json!("u"));
        let steps = vec![EventMatcher { topic: "login.failed".to_string(), filter: Map::new() }; 3];
        matcher.register("r1", TemporalPattern::Sequence { events: steps, within_ms: 300_000, group_by: Some("data.userId".to_string()) });

        let mut firings = Vec::new();
        for i in 0..3 {
            firings.extend(matcher.ingest(&event("login.failed", i, data.clone())));
        }
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].matches.len(), 3);
    }

    #[test]
    fn absence_fires_when_expected_never_arrives() {
        let matcher = TemporalMatcher::new(|| 0);
        matcher.register(
            "r1",
            TemporalPattern::Absence {
                after: EventMatcher { topic: "order.placed".to_string(), filter: Map::new() },
                expected: EventMatcher { topic: "order.confirmed".to_string(), filter: Map::new() },
                within_ms: 1_000,
                group_by: None,
            },
        );
        matcher.ingest(&event("order.placed", 0, Map::new()));
        assert!(matcher.tick(500).is_empty());
        let firings = matcher.tick(1_500);
        assert_eq!(firings.len(), 1);
    }

    #[test]
    fn absence_is_cancelled_by_expected_event() {
        let matcher = TemporalMatcher::new(|| 0);
        matcher.register(
            "r1",
            TemporalPattern::Absence {
                after: EventMatcher { topic: "order.placed".to_string(), filter: Map::new() },
                expected: EventMatcher { topic: "order.confirmed".to_string(), filter: Map::new() },
                within_ms: 1_000,
                group_by: None,
            },
        );
        matcher.ingest(&event("order.placed", 0, Map::new()));
        matcher.ingest(&event("order.confirmed", 100, Map::new()));
        assert!(matcher.tick(2_000).is_empty());
    }

    #[test]
    fn count_sliding_is_edge_triggered() {
        let matcher = TemporalMatcher::new(|| 0);
        matcher.register(
            "r1",
            TemporalPattern::Count {
                event: EventMatcher { topic: "error".to_string(), filter: Map::new() },
                threshold: 2,
                comparison: CountComparison::Gte,
                window_ms: 10_000,
                sliding: true,
            },
        );
        let mut firings = Vec::new();
        firings.extend(matcher.ingest(&event("error", 0, Map::new())));
        firings.extend(matcher.ingest(&event("error", 1, Map::new())));
        firings.extend(matcher.ingest(&event("error", 2, Map::new())));
        assert_eq!(firings.len(), 1);
    }

    #[test]
    fn aggregate_fires_on_threshold_crossing() {
        let matcher = TemporalMatcher::new(|| 0);
        matcher.register(
            "r1",
            TemporalPattern::Aggregate {
                event: EventMatcher { topic: "cpu".to_string(), filter: Map::new() },
                field: "pct".to_string(),
                function: AggregateFunction::Avg,
                threshold: 80.0,
                comparison: CountComparison::Gte,
                window_ms: 60_000,
            },
        );
        let mut data = Map::new();
        data.insert("pct".to_string(), json!(90.0));
        let firings = matcher.ingest(&event("cpu", 0, data));
        assert_eq!(firings.len(), 1);
    }
}
