//! Domain record types translated by the [`DomainStore`](super::DomainStore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One versioned shared artifact on the blackboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlackboardEntryRecord {
    pub workspace_id: String,
    pub artifact_key: String,
    pub artifact_id: String,
    pub artifact_type: String,
    /// Starts at 1 and increases by exactly 1 per successful write.
    pub version: i64,
    pub payload: Value,
    /// Actor that produced this revision.
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

/// Append-only annotation on an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlackboardFeedbackRecord {
    pub feedback_id: String,
    pub target_id: String,
    pub source_actor: String,
    pub content: String,
    pub severity: String,
    pub status: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable read cursor for one named event consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerCheckpoint {
    pub consumer_id: String,
    pub last_version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "completed" => WorkflowStatus::Completed,
            "failed" => WorkflowStatus::Failed,
            "paused" => WorkflowStatus::Paused,
            _ => WorkflowStatus::Running,
        }
    }
}

/// Persisted form of a workflow definition. The executable definition
/// (compiled patterns, resolved reducers) lives in the engine; this record
/// carries the serialized steps for hydration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinitionRecord {
    pub definition_id: String,
    pub version: i64,
    pub name: String,
    pub trigger_event: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// One running execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstanceRecord {
    pub instance_id: String,
    pub definition_id: String,
    pub definition_version: i64,
    pub status: WorkflowStatus,
    pub current_step_id: Option<String>,
    pub state: Value,
    pub trigger_event_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only audit row: one per instance creation and per transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowHistoryRecord {
    pub entry_id: String,
    pub instance_id: String,
    pub step_id: Option<String>,
    pub transition: String,
    pub event_id: Option<String>,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Point-in-time snapshot of a workspace's blackboard contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSnapshotRecord {
    pub snapshot_id: String,
    pub workspace_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}
