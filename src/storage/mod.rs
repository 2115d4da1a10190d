//! `StorageAdapter` (spec §6): consumed by rule/timer/audit persistence.
//! Not part of the core — the engine runs fully in-memory without one.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::EngineResult;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredState {
    pub state: Value,
    pub metadata: Value,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn save(&self, key: &str, state: StoredState) -> EngineResult<()>;
    async fn load(&self, key: &str) -> EngineResult<Option<StoredState>>;
    async fn delete(&self, key: &str) -> EngineResult<bool>;
    async fn exists(&self, key: &str) -> EngineResult<bool>;
    async fn list_keys(&self) -> EngineResult<Vec<String>>;
}

/// Reference adapter used by tests and as the engine's default when no
/// persistence is configured; backed by a plain map, so nothing actually
/// survives a process restart.
#[derive(Default)]
pub struct InMemoryStorageAdapter {
    entries: RwLock<HashMap<String, StoredState>>,
}

impl InMemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorageAdapter {
    async fn save(&self, key: &str, state: StoredState) -> EngineResult<()> {
        self.entries.write().await.insert(key.to_string(), state);
        Ok(())
    }

    async fn load(&self, key: &str) -> EngineResult<Option<StoredState>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> EngineResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> EngineResult<bool> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn list_keys(&self) -> EngineResult<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}
