//! Persisted, event-driven workflow state machines.

pub mod definition;
pub mod engine;

pub use definition::{
    ReducerFn, ReducerRegistry, StepDefinition, WorkflowDefinition, APPEND_EVENT, MERGE_EVENT,
    REPLACE_STATE,
};
pub use engine::{WorkflowEngine, ENGINE_CONSUMER_ID};
