//! Message and request bodies exchanged over the bus and HTTP

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// History event: `{"key": <service name>, "data": {<metric>: <number>, ...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub key: String,
    pub data: Map<String, Value>,
}

impl HistoryEvent {
    pub fn new(key: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            data,
        }
    }
}

/// Body of the example HTTP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleMessage {
    pub content: String,
}

impl ExampleMessage {
    /// The echo reply for `self`
    pub fn reply(&self) -> Self {
        Self {
            content: format!("Hi! You said `{}`.", self.content),
        }
    }
}
