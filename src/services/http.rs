//! Reqwest-backed [`Service`] plus an in-process [`ServiceRegistry`].
//!
//! Mirrors the teacher's HTTP client wrapper: one shared `reqwest::Client`,
//! a fixed per-call timeout, and error bodies folded into `ActionFailed`
//! instead of bubbling raw transport errors to rule authors.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::services::Service;
use crate::services::ServiceRegistry as ServiceRegistryTrait;

/// Calls `POST {base_url}/{method}` with `args` as the JSON body and expects
/// a JSON response; a non-2xx status or a non-JSON body is reported as
/// `ActionFailed`'s underlying cause by the caller.
pub struct HttpService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builder with static config cannot fail"),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Service for HttpService {
    async fn call(&self, method: &str, args: &[Value]) -> EngineResult<Value> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), method);
        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| EngineError::ActionFailed {
                rule_id: String::new(),
                action_index: 0,
                message: format!("http service call to '{url}' failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(EngineError::ActionFailed {
                rule_id: String::new(),
                action_index: 0,
                message: format!("http service '{url}' responded with status {}", response.status()),
            });
        }

        response.json::<Value>().await.map_err(|e| EngineError::ActionFailed {
            rule_id: String::new(),
            action_index: 0,
            message: format!("http service '{url}' returned non-JSON body: {e}"),
        })
    }
}

/// In-process name → [`Service`] map. `call_service` actions resolve through
/// this; the rule's id/action index are stitched into any error by the
/// action executor, since a `Service` impl does not know which rule invoked it.
#[derive(Default)]
pub struct InMemoryServiceRegistry {
    services: RwLock<HashMap<String, Box<dyn Service>>>,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: impl Into<String>, service: Box<dyn Service>) {
        self.services.write().await.insert(name.into(), service);
    }
}

#[async_trait]
impl ServiceRegistryTrait for InMemoryServiceRegistry {
    async fn call(&self, service: &str, method: &str, args: &[Value]) -> EngineResult<Value> {
        let guard = self.services.read().await;
        let svc = guard
            .get(service)
            .ok_or_else(|| EngineError::not_found(format!("service '{service}' not registered")))?;
        svc.call(method, args).await
    }
}
