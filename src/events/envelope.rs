//! The immutable record of one published event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One published event. Created once at publish time, immutable thereafter;
/// `version` is the envelope's assigned position in the durable stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub event_id: String,
    /// Event type, e.g. `workspace:member:added`.
    pub event: String,
    pub aggregate_id: Option<String>,
    pub payload: Value,
    pub metadata: Value,
    /// Monotonic position in the event stream.
    pub version: i64,
    pub occurred_at: DateTime<Utc>,
    /// Set once the envelope has been handed to at least one subscriber.
    pub delivered_at: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    /// Build a fresh envelope for publication at the given stream position.
    pub fn new(event: impl Into<String>, payload: Value, version: i64) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event: event.into(),
            aggregate_id: None,
            payload,
            metadata: Value::Null,
            version,
            occurred_at: Utc::now(),
            delivered_at: None,
        }
    }

    pub fn with_aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}
