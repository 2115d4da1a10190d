pub mod evaluator;

pub use evaluator::{
    interpolate, materialize_json, materialize_value_or_ref, resolve_ref_path, ConditionEvaluator,
    EvaluationContext,
};
