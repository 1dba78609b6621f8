//! Event record, producer attribution, and category types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::{EventId, RunId};

/// Broad grouping of events. The `action` string is interpreted relative to
/// its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Run state transitions (`started`, `completed`, `failed`, `cancelled`).
    Lifecycle,
    /// Output produced by a producer (partial text, results).
    Output,
    /// Work handed from one producer to another.
    Dispatch,
    /// Infrastructure notices not tied to the executor's own logic.
    System,
}

impl Category {
    /// Returns the canonical string label for this category.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Output => "output",
            Self::Dispatch => "dispatch",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lifecycle" => Ok(Self::Lifecycle),
            "output" => Ok(Self::Output),
            "dispatch" => Ok(Self::Dispatch),
            "system" => Ok(Self::System),
            _ => Err(ParseCategoryError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown category string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown event category: {0}")]
pub struct ParseCategoryError(pub String);

/// The kind of producer that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    Coordinator,
    Supervisor,
    Worker,
}

impl ProducerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Supervisor => "supervisor",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for ProducerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProducerType {
    type Err = ParseProducerTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Self::Coordinator),
            "supervisor" => Ok(Self::Supervisor),
            "worker" => Ok(Self::Worker),
            _ => Err(ParseProducerTypeError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown producer type string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown producer type: {0}")]
pub struct ParseProducerTypeError(pub String);

/// Attribution of an event to a specific producer inside the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    pub producer_id: String,
    pub producer_type: ProducerType,
    pub producer_name: String,
    /// Team or group the producer belongs to, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

impl EventSource {
    pub fn new(
        producer_id: impl Into<String>,
        producer_type: ProducerType,
        producer_name: impl Into<String>,
    ) -> Self {
        Self {
            producer_id: producer_id.into(),
            producer_type,
            producer_name: producer_name.into(),
            group_name: None,
        }
    }

    pub fn with_group(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }
}

/// An event as handed over by a producer, before the store has assigned
/// its identity.
///
/// The run id, sequence, timestamp and event id are all filled in by the
/// run's sink; producers only describe *what* happened.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub source: Option<EventSource>,
    pub category: Category,
    pub action: String,
    pub payload: Map<String, Value>,
}

impl EventDraft {
    pub fn new(category: Category, action: impl Into<String>) -> Self {
        Self {
            source: None,
            category,
            action: action.into(),
            payload: Map::new(),
        }
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Replaces the payload. Non-object values are wrapped as `{"value": ..}`.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    /// Sets a single payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// One immutable, ordered record of progress attributed to a run.
///
/// This is the wire shape delivered to subscribers and returned by history
/// queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Store-assigned identifier; strictly increasing within a run.
    pub id: EventId,
    pub run_id: RunId,
    /// Run-scoped counter assigned by the sink. A gap means an event was
    /// lost between the producer and the store.
    pub sequence: u64,
    pub timestamp_millis: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
    pub category: Category,
    pub action: String,
    pub payload: Map<String, Value>,
}

impl Event {
    /// Returns `true` for lifecycle events that end a run.
    pub fn is_terminal(&self) -> bool {
        self.category == Category::Lifecycle
            && matches!(
                self.action.as_str(),
                crate::lifecycle::COMPLETED | crate::lifecycle::FAILED | crate::lifecycle::CANCELLED
            )
    }
}
