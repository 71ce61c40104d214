//! Workflow definitions and the reducer registry.
//!
//! A definition is a persisted state machine: states are step ids plus the
//! implicit terminal statuses, the initial state is `initial_step_id` (first
//! step when unset), and an instance completes when its matched step is
//! flagged terminal, has no `next_step_id`, or transitions into a terminal
//! step. Definitions are immutable once published under a given
//! `(id, version)`; new behavior requires a new version.
//!
//! Step reducers are closures and cannot survive serialization, so steps
//! carry a stable string key instead; [`ReducerRegistry`] resolves keys to
//! executable reducers at registration and hydration time. Unknown keys fall
//! back to [`MERGE_EVENT`] with a logged warning.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventEnvelope;

/// Reducer signature: `(state, event payload, envelope) -> new state`.
pub type ReducerFn = Arc<dyn Fn(Value, &Value, &EventEnvelope) -> Value + Send + Sync>;

/// Built-in reducer keys.
pub const MERGE_EVENT: &str = "merge_event";
pub const REPLACE_STATE: &str = "replace_state";
pub const APPEND_EVENT: &str = "append_event";

/// One step of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub id: String,
    /// Event pattern that advances an instance waiting at this step.
    /// Terminal steps reached on entry never consult it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
    #[serde(default)]
    pub terminal: bool,
    /// Stable reducer key resolved through the [`ReducerRegistry`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            on_event: None,
            next_step_id: None,
            terminal: false,
            reducer: None,
            metadata: Value::Null,
        }
    }

    pub fn on(mut self, pattern: impl Into<String>) -> Self {
        self.on_event = Some(pattern.into());
        self
    }

    pub fn then(mut self, next_step_id: impl Into<String>) -> Self {
        self.next_step_id = Some(next_step_id.into());
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn with_reducer(mut self, key: impl Into<String>) -> Self {
        self.reducer = Some(key.into());
        self
    }
}

/// A workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub version: i64,
    pub name: String,
    /// Pattern whose match spawns a new instance.
    pub trigger_event: String,
    pub steps: Vec<StepDefinition>,
    /// Defaults to the first step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl WorkflowDefinition {
    pub fn new(
        id: impl Into<String>,
        version: i64,
        name: impl Into<String>,
        trigger_event: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            version,
            name: name.into(),
            trigger_event: trigger_event.into(),
            steps: Vec::new(),
            initial_step_id: None,
            metadata: Value::Null,
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn initial_step_id(&self) -> Option<&str> {
        self.initial_step_id
            .as_deref()
            .or_else(|| self.steps.first().map(|s| s.id.as_str()))
    }
}

fn merge_event(state: Value, payload: &Value, envelope: &EventEnvelope) -> Value {
    let mut base = match state {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("state".to_string(), other);
            map
        }
    };
    if let Value::Object(patch) = payload {
        for (key, value) in patch {
            base.insert(key.clone(), value.clone());
        }
    }
    base.insert(
        "last_event".to_string(),
        Value::String(envelope.event.clone()),
    );
    base.insert(
        "last_event_id".to_string(),
        Value::String(envelope.event_id.clone()),
    );
    Value::Object(base)
}

fn append_event(state: Value, payload: &Value, envelope: &EventEnvelope) -> Value {
    let mut base = match state {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    let events = base
        .entry("events".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(items) = events {
        items.push(serde_json::json!({
            "event": envelope.event,
            "event_id": envelope.event_id,
            "payload": payload,
        }));
    }
    Value::Object(base)
}

/// Resolves stable reducer keys to executable reducers.
pub struct ReducerRegistry {
    reducers: RwLock<HashMap<String, ReducerFn>>,
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ReducerRegistry {
    /// Registry pre-loaded with the built-in reducers.
    pub fn with_builtins() -> Self {
        let registry = Self {
            reducers: RwLock::new(HashMap::new()),
        };
        registry.register(MERGE_EVENT, Arc::new(merge_event));
        registry.register(REPLACE_STATE, Arc::new(|_, payload, _| payload.clone()));
        registry.register(APPEND_EVENT, Arc::new(append_event));
        registry
    }

    pub fn register(&self, key: impl Into<String>, reducer: ReducerFn) {
        self.reducers.write().insert(key.into(), reducer);
    }

    /// Resolve a key, falling back to [`MERGE_EVENT`] for `None` or unknown
    /// keys (unknown keys are logged — the degradation is explicit, not
    /// silent).
    pub fn resolve(&self, key: Option<&str>) -> ReducerFn {
        let reducers = self.reducers.read();
        match key {
            None => Arc::clone(&reducers[MERGE_EVENT]),
            Some(key) => match reducers.get(key) {
                Some(reducer) => Arc::clone(reducer),
                None => {
                    log::warn!("unknown reducer key {key:?}; falling back to {MERGE_EVENT}");
                    Arc::clone(&reducers[MERGE_EVENT])
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event: &str) -> EventEnvelope {
        EventEnvelope::new(event, json!({}), 1)
    }

    #[test]
    fn test_definition_serialization_roundtrip() {
        let definition = WorkflowDefinition::new("wf", 1, "Workflow", "a:start")
            .step(
                StepDefinition::new("first")
                    .on("a:next")
                    .then("second")
                    .with_reducer(APPEND_EVENT),
            )
            .step(StepDefinition::new("second").terminal());

        let value = serde_json::to_value(&definition).unwrap();
        let back: WorkflowDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(back, definition);
        assert_eq!(back.initial_step_id(), Some("first"));
    }

    #[test]
    fn test_merge_event_reducer() {
        let registry = ReducerRegistry::with_builtins();
        let reducer = registry.resolve(None);

        let env = envelope("workspace:member:added");
        let state = reducer(json!({"count": 1}), &json!({"member": "ada"}), &env);
        assert_eq!(state["count"], 1);
        assert_eq!(state["member"], "ada");
        assert_eq!(state["last_event"], "workspace:member:added");
    }

    #[test]
    fn test_replace_state_reducer() {
        let registry = ReducerRegistry::with_builtins();
        let reducer = registry.resolve(Some(REPLACE_STATE));
        let state = reducer(json!({"old": true}), &json!({"new": true}), &envelope("e"));
        assert_eq!(state, json!({"new": true}));
    }

    #[test]
    fn test_append_event_reducer() {
        let registry = ReducerRegistry::with_builtins();
        let reducer = registry.resolve(Some(APPEND_EVENT));

        let state = reducer(json!({}), &json!({"n": 1}), &envelope("tick:a"));
        let state = reducer(state, &json!({"n": 2}), &envelope("tick:b"));
        let events = state["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "tick:a");
        assert_eq!(events[1]["payload"]["n"], 2);
    }

    #[test]
    fn test_unknown_reducer_falls_back_to_merge() {
        let registry = ReducerRegistry::with_builtins();
        let reducer = registry.resolve(Some("no_such_reducer"));
        let state = reducer(json!({}), &json!({"k": "v"}), &envelope("e"));
        assert_eq!(state["k"], "v");
        assert!(state["last_event_id"].is_string());
    }

    #[test]
    fn test_custom_reducer_registration() {
        let registry = ReducerRegistry::with_builtins();
        registry.register(
            "count_events",
            Arc::new(|state, _, _| {
                let count = state["count"].as_i64().unwrap_or(0);
                json!({"count": count + 1})
            }),
        );
        let reducer = registry.resolve(Some("count_events"));
        let state = reducer(json!({"count": 2}), &json!({}), &envelope("e"));
        assert_eq!(state["count"], 3);
    }
}
