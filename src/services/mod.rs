//! External collaborators consumed by the engine but not owned by it
//! (spec §6): services invoked by `call_service`, and the anomaly-baseline
//! checker consulted by `baseline` conditions.

pub mod http;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineResult;

/// A single callable registered under a service name (spec §6
/// "ServiceRegistry"). Method signatures are dynamic by design: the engine
/// does not know argument or return shapes ahead of time.
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, method: &str, args: &[Value]) -> EngineResult<Value>;
}

/// Registry of named services looked up by `call_service` actions.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn call(&self, service: &str, method: &str, args: &[Value]) -> EngineResult<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyVerdict {
    pub is_anomaly: bool,
    pub z_score: f64,
    pub severity: String,
}

/// Consulted by `baseline(metric, comparison, sensitivity)` conditions
/// (spec §4.4, §6).
#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn check_anomaly(&self, metric: &str, value: f64, comparison: &str, sensitivity: Option<f64>) -> EngineResult<AnomalyVerdict>;
}
