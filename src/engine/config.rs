//! Engine configuration (spec §6 "Config (engine)").

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub max_concurrency: usize,
    pub debounce_ms: Option<i64>,
    pub max_cascade_depth: u32,
    pub action_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub max_memory_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { max_memory_entries: 10_000 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "flowguard".to_string(),
            max_concurrency: num_cpus(),
            debounce_ms: None,
            max_cascade_depth: 64,
            action_timeout_ms: 30_000,
            shutdown_timeout_ms: 30_000,
            audit: AuditConfig::default(),
        }
    }
}

impl Config {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
