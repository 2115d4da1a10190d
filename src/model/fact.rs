use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A versioned key/value record in the fact store (spec §3 "Fact").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub key: String,
    pub value: Value,
    pub timestamp: i64,
    pub source: String,
    pub version: u64,
}

impl Fact {
    pub fn new(key: impl Into<String>, value: Value, source: impl Into<String>, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
            source: source.into(),
            version: 1,
        }
    }
}

/// The two kinds of change a `FactStore` subscriber is notified of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactChangeKind {
    Set,
    Delete,
}
