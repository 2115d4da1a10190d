use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An immutable domain event (spec §3 "Event").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub topic: String,
    pub data: Map<String, Value>,
    pub timestamp: i64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

/// An event author submits before the engine assigns `id`/`timestamp` and
/// resolves correlation/causation.
#[derive(Debug, Clone, Deserialize)]
pub struct EventDraft {
    pub topic: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub causation_id: Option<String>,
}

impl EventDraft {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: Map::new(),
            source: None,
            correlation_id: None,
            causation_id: None,
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }
}

/// Dotted-path lookup into `event.data`, e.g. `"user.id"` → `data["user"]["id"]`.
pub fn get_path<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut current: &Value = data.get(path.split('.').next()?)?;
    let mut segments = path.split('.');
    segments.next();
    for seg in segments {
        current = current.as_object()?.get(seg)?;
    }
    Some(current)
}
