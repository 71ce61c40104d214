//! Domain store: the typed façade over the persistence manager.
//!
//! Translates domain records (blackboard entries, events, checkpoints,
//! workflow definitions/instances/history, workspace snapshots) to and from
//! the generic store. Owns the blackboard's optimistic-concurrency write
//! path and the event log's monotonic version assignment; components above
//! this layer never issue SQL themselves.

pub mod records;

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::db::{DatabasePool, SqlDialect, SqlRow, SqlValue};
use crate::error::{BlackboardError, PersistenceError};
use crate::events::EventEnvelope;
use crate::persistence::{EntityRecord, PersistenceManager};

pub use records::{
    BlackboardEntryRecord, BlackboardFeedbackRecord, ConsumerCheckpoint,
    WorkflowDefinitionRecord, WorkflowHistoryRecord, WorkflowInstanceRecord,
    WorkspaceSnapshotRecord, WorkflowStatus,
};

/// A blackboard write request. `expected_version` carries the caller's
/// last-seen version: `None` upserts unconditionally (still bumping the
/// version atomically), `Some(0)` asserts creation, `Some(n)` asserts the
/// stored version is exactly `n`.
#[derive(Debug, Clone)]
pub struct BlackboardUpsert {
    pub workspace_id: String,
    pub artifact_key: String,
    pub artifact_type: String,
    pub payload: Value,
    pub source: String,
    pub expected_version: Option<i64>,
}

#[derive(Clone)]
pub struct DomainStore {
    persistence: Arc<PersistenceManager>,
}

impl DomainStore {
    pub fn new(persistence: Arc<PersistenceManager>) -> Self {
        Self { persistence }
    }

    pub fn persistence(&self) -> &Arc<PersistenceManager> {
        &self.persistence
    }

    fn pool(&self) -> Arc<dyn DatabasePool> {
        self.persistence.pool()
    }

    fn dialect(&self) -> SqlDialect {
        self.persistence.pool().dialect()
    }

    // -----------------------------------------------------------------------
    // Workspaces (generic entity table)
    // -----------------------------------------------------------------------

    pub async fn create_workspace(&self, payload: Value) -> Result<EntityRecord, PersistenceError> {
        self.persistence.repository("workspace")?.create(payload).await
    }

    pub async fn get_workspace(&self, id: &str) -> Result<Option<EntityRecord>, PersistenceError> {
        self.persistence.repository("workspace")?.get(id).await
    }

    // -----------------------------------------------------------------------
    // Blackboard entries
    // -----------------------------------------------------------------------

    fn entry_from_row(
        upsert: &BlackboardUpsert,
        row: &SqlRow,
    ) -> Result<BlackboardEntryRecord, PersistenceError> {
        Ok(BlackboardEntryRecord {
            workspace_id: upsert.workspace_id.clone(),
            artifact_key: upsert.artifact_key.clone(),
            artifact_id: row.text("artifact_id")?,
            artifact_type: upsert.artifact_type.clone(),
            version: row.int("version")?,
            payload: upsert.payload.clone(),
            source: upsert.source.clone(),
            updated_at: row.timestamp("updated_at")?,
        })
    }

    /// Versioned compare-and-swap upsert. Exactly one of two racing writers
    /// at the same expected version succeeds; the loser gets
    /// `version_conflict` with the stored version attached.
    pub async fn upsert_blackboard_entry(
        &self,
        upsert: BlackboardUpsert,
    ) -> Result<BlackboardEntryRecord, BlackboardError> {
        let d = self.dialect();
        let now = Utc::now();

        let rows = match upsert.expected_version {
            None => {
                let sql = format!(
                    "INSERT INTO cowork_blackboard_entry \
                     (workspace_id, artifact_key, artifact_id, artifact_type, version, payload, source, updated_at) \
                     VALUES ({}, {}, {}, {}, 1, {}, {}, {}) \
                     ON CONFLICT (workspace_id, artifact_key) DO UPDATE SET \
                       version = cowork_blackboard_entry.version + 1, \
                       artifact_type = excluded.artifact_type, \
                       payload = excluded.payload, \
                       source = excluded.source, \
                       updated_at = excluded.updated_at \
                     RETURNING artifact_id, version, updated_at",
                    d.placeholder(1),
                    d.placeholder(2),
                    d.placeholder(3),
                    d.placeholder(4),
                    d.placeholder(5),
                    d.placeholder(6),
                    d.placeholder(7),
                );
                self.pool()
                    .query(
                        &sql,
                        &[
                            SqlValue::Text(upsert.workspace_id.clone()),
                            SqlValue::Text(upsert.artifact_key.clone()),
                            SqlValue::Text(Uuid::new_v4().to_string()),
                            SqlValue::Text(upsert.artifact_type.clone()),
                            SqlValue::Json(upsert.payload.clone()),
                            SqlValue::Text(upsert.source.clone()),
                            SqlValue::Timestamp(now),
                        ],
                    )
                    .await?
            }
            Some(0) => {
                let sql = format!(
                    "INSERT INTO cowork_blackboard_entry \
                     (workspace_id, artifact_key, artifact_id, artifact_type, version, payload, source, updated_at) \
                     VALUES ({}, {}, {}, {}, 1, {}, {}, {}) \
                     ON CONFLICT (workspace_id, artifact_key) DO NOTHING \
                     RETURNING artifact_id, version, updated_at",
                    d.placeholder(1),
                    d.placeholder(2),
                    d.placeholder(3),
                    d.placeholder(4),
                    d.placeholder(5),
                    d.placeholder(6),
                    d.placeholder(7),
                );
                self.pool()
                    .query(
                        &sql,
                        &[
                            SqlValue::Text(upsert.workspace_id.clone()),
                            SqlValue::Text(upsert.artifact_key.clone()),
                            SqlValue::Text(Uuid::new_v4().to_string()),
                            SqlValue::Text(upsert.artifact_type.clone()),
                            SqlValue::Json(upsert.payload.clone()),
                            SqlValue::Text(upsert.source.clone()),
                            SqlValue::Timestamp(now),
                        ],
                    )
                    .await?
            }
            Some(expected) => {
                let sql = format!(
                    "UPDATE cowork_blackboard_entry SET \
                       version = version + 1, \
                       artifact_type = {}, \
                       payload = {}, \
                       source = {}, \
                       updated_at = {} \
                     WHERE workspace_id = {} AND artifact_key = {} AND version = {} \
                     RETURNING artifact_id, version, updated_at",
                    d.placeholder(1),
                    d.placeholder(2),
                    d.placeholder(3),
                    d.placeholder(4),
                    d.placeholder(5),
                    d.placeholder(6),
                    d.placeholder(7),
                );
                self.pool()
                    .query(
                        &sql,
                        &[
                            SqlValue::Text(upsert.artifact_type.clone()),
                            SqlValue::Json(upsert.payload.clone()),
                            SqlValue::Text(upsert.source.clone()),
                            SqlValue::Timestamp(now),
                            SqlValue::Text(upsert.workspace_id.clone()),
                            SqlValue::Text(upsert.artifact_key.clone()),
                            SqlValue::Int(expected),
                        ],
                    )
                    .await?
            }
        };

        match rows.first() {
            Some(row) => Ok(Self::entry_from_row(&upsert, row)?),
            None => {
                let stored = self
                    .get_blackboard_entry(&upsert.workspace_id, &upsert.artifact_key)
                    .await?
                    .map(|entry| entry.version);
                Err(BlackboardError::VersionConflict {
                    workspace_id: upsert.workspace_id,
                    artifact_key: upsert.artifact_key,
                    expected: upsert.expected_version.unwrap_or(0),
                    stored,
                })
            }
        }
    }

    fn stored_entry_from_row(row: &SqlRow) -> Result<BlackboardEntryRecord, PersistenceError> {
        Ok(BlackboardEntryRecord {
            workspace_id: row.text("workspace_id")?,
            artifact_key: row.text("artifact_key")?,
            artifact_id: row.text("artifact_id")?,
            artifact_type: row.text("artifact_type")?,
            version: row.int("version")?,
            payload: row.json("payload")?,
            source: row.text("source")?,
            updated_at: row.timestamp("updated_at")?,
        })
    }

    pub async fn get_blackboard_entry(
        &self,
        workspace_id: &str,
        artifact_key: &str,
    ) -> Result<Option<BlackboardEntryRecord>, PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "SELECT workspace_id, artifact_key, artifact_id, artifact_type, version, payload, source, updated_at \
             FROM cowork_blackboard_entry WHERE workspace_id = {} AND artifact_key = {}",
            d.placeholder(1),
            d.placeholder(2),
        );
        let rows = self
            .pool()
            .query(
                &sql,
                &[
                    SqlValue::Text(workspace_id.to_string()),
                    SqlValue::Text(artifact_key.to_string()),
                ],
            )
            .await?;
        rows.first().map(Self::stored_entry_from_row).transpose()
    }

    pub async fn list_blackboard_entries(
        &self,
    ) -> Result<Vec<BlackboardEntryRecord>, PersistenceError> {
        let rows = self
            .pool()
            .query(
                "SELECT workspace_id, artifact_key, artifact_id, artifact_type, version, payload, source, updated_at \
                 FROM cowork_blackboard_entry ORDER BY workspace_id, artifact_key",
                &[],
            )
            .await?;
        rows.iter().map(Self::stored_entry_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Blackboard feedback
    // -----------------------------------------------------------------------

    pub async fn insert_feedback(
        &self,
        record: &BlackboardFeedbackRecord,
    ) -> Result<(), PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "INSERT INTO cowork_blackboard_feedback \
             (feedback_id, target_id, source_actor, content, severity, status, metadata, created_at, updated_at) \
             VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {})",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6),
            d.placeholder(7),
            d.placeholder(8),
            d.placeholder(9),
        );
        self.pool()
            .execute(
                &sql,
                &[
                    SqlValue::Text(record.feedback_id.clone()),
                    SqlValue::Text(record.target_id.clone()),
                    SqlValue::Text(record.source_actor.clone()),
                    SqlValue::Text(record.content.clone()),
                    SqlValue::Text(record.severity.clone()),
                    SqlValue::Text(record.status.clone()),
                    SqlValue::Json(record.metadata.clone()),
                    SqlValue::Timestamp(record.created_at),
                    SqlValue::Timestamp(record.updated_at),
                ],
            )
            .await?;
        Ok(())
    }

    fn feedback_from_row(row: &SqlRow) -> Result<BlackboardFeedbackRecord, PersistenceError> {
        Ok(BlackboardFeedbackRecord {
            feedback_id: row.text("feedback_id")?,
            target_id: row.text("target_id")?,
            source_actor: row.text("source_actor")?,
            content: row.text("content")?,
            severity: row.text("severity")?,
            status: row.text("status")?,
            metadata: row.json("metadata")?,
            created_at: row.timestamp("created_at")?,
            updated_at: row.timestamp("updated_at")?,
        })
    }

    pub async fn list_feedback(&self) -> Result<Vec<BlackboardFeedbackRecord>, PersistenceError> {
        let rows = self
            .pool()
            .query(
                "SELECT feedback_id, target_id, source_actor, content, severity, status, metadata, created_at, updated_at \
                 FROM cowork_blackboard_feedback ORDER BY created_at, feedback_id",
                &[],
            )
            .await?;
        rows.iter().map(Self::feedback_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Event log and consumer checkpoints
    // -----------------------------------------------------------------------

    fn envelope_from_row(row: &SqlRow) -> Result<EventEnvelope, PersistenceError> {
        Ok(EventEnvelope {
            event_id: row.text("event_id")?,
            event: row.text("event")?,
            aggregate_id: row.opt_text("aggregate_id")?,
            payload: row.json("payload")?,
            metadata: row.json("metadata")?,
            version: row.int("version")?,
            occurred_at: row.timestamp("occurred_at")?,
            delivered_at: row.opt_timestamp("delivered_at")?,
        })
    }

    /// Append an immutable envelope, assigning the next monotonic version in
    /// the same statement.
    pub async fn append_event(
        &self,
        event: &str,
        aggregate_id: Option<&str>,
        payload: Value,
        metadata: Value,
    ) -> Result<EventEnvelope, PersistenceError> {
        let d = self.dialect();
        let event_id = Uuid::new_v4().to_string();
        let occurred_at = Utc::now();

        let sql = format!(
            "INSERT INTO cowork_event_log \
             (event_id, event, aggregate_id, payload, metadata, version, occurred_at) \
             VALUES ({}, {}, {}, {}, {}, \
                     (SELECT COALESCE(MAX(version), 0) + 1 FROM cowork_event_log), {}) \
             RETURNING version",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6),
        );
        let rows = self
            .pool()
            .query(
                &sql,
                &[
                    SqlValue::Text(event_id.clone()),
                    SqlValue::Text(event.to_string()),
                    match aggregate_id {
                        Some(id) => SqlValue::Text(id.to_string()),
                        None => SqlValue::Null,
                    },
                    SqlValue::Json(payload.clone()),
                    SqlValue::Json(metadata.clone()),
                    SqlValue::Timestamp(occurred_at),
                ],
            )
            .await?;
        let version = rows
            .first()
            .ok_or_else(|| PersistenceError::driver("event insert returned no version"))?
            .int("version")?;

        Ok(EventEnvelope {
            event_id,
            event: event.to_string(),
            aggregate_id: aggregate_id.map(str::to_string),
            payload,
            metadata,
            version,
            occurred_at,
            delivered_at: None,
        })
    }

    /// Events strictly newer than `after_version`, ascending, at most
    /// `limit` rows.
    pub async fn events_after(
        &self,
        after_version: i64,
        limit: i64,
    ) -> Result<Vec<EventEnvelope>, PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "SELECT event_id, event, aggregate_id, payload, metadata, version, occurred_at, delivered_at \
             FROM cowork_event_log WHERE version > {} ORDER BY version ASC LIMIT {}",
            d.placeholder(1),
            d.placeholder(2),
        );
        let rows = self
            .pool()
            .query(&sql, &[SqlValue::Int(after_version), SqlValue::Int(limit)])
            .await?;
        rows.iter().map(Self::envelope_from_row).collect()
    }

    /// Stamp first-delivery time. Later deliveries leave the stamp alone.
    pub async fn mark_event_delivered(&self, event_id: &str) -> Result<(), PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "UPDATE cowork_event_log SET delivered_at = {} \
             WHERE event_id = {} AND delivered_at IS NULL",
            d.placeholder(1),
            d.placeholder(2),
        );
        self.pool()
            .execute(
                &sql,
                &[
                    SqlValue::Timestamp(Utc::now()),
                    SqlValue::Text(event_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn load_checkpoint(
        &self,
        consumer_id: &str,
    ) -> Result<Option<i64>, PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "SELECT last_version FROM cowork_event_consumer_checkpoint WHERE consumer_id = {}",
            d.placeholder(1),
        );
        let rows = self
            .pool()
            .query(&sql, &[SqlValue::Text(consumer_id.to_string())])
            .await?;
        rows.first().map(|row| row.int("last_version")).transpose()
    }

    pub async fn save_checkpoint(
        &self,
        consumer_id: &str,
        last_version: i64,
    ) -> Result<(), PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "INSERT INTO cowork_event_consumer_checkpoint (consumer_id, last_version, updated_at) \
             VALUES ({}, {}, {}) \
             ON CONFLICT (consumer_id) DO UPDATE SET \
               last_version = excluded.last_version, \
               updated_at = excluded.updated_at",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
        );
        self.pool()
            .execute(
                &sql,
                &[
                    SqlValue::Text(consumer_id.to_string()),
                    SqlValue::Int(last_version),
                    SqlValue::Timestamp(Utc::now()),
                ],
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Workflow definitions, instances, history
    // -----------------------------------------------------------------------

    /// Persist a definition. Definitions are immutable under a given
    /// `(definition_id, version)`; a duplicate save is a no-op.
    pub async fn save_workflow_definition(
        &self,
        definition_id: &str,
        version: i64,
        name: &str,
        trigger_event: &str,
        payload: Value,
    ) -> Result<(), PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "INSERT INTO cowork_workflow_definition \
             (definition_id, version, name, trigger_event, payload, created_at) \
             VALUES ({}, {}, {}, {}, {}, {}) \
             ON CONFLICT (definition_id, version) DO NOTHING",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6),
        );
        self.pool()
            .execute(
                &sql,
                &[
                    SqlValue::Text(definition_id.to_string()),
                    SqlValue::Int(version),
                    SqlValue::Text(name.to_string()),
                    SqlValue::Text(trigger_event.to_string()),
                    SqlValue::Json(payload),
                    SqlValue::Timestamp(Utc::now()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn list_workflow_definitions(
        &self,
    ) -> Result<Vec<WorkflowDefinitionRecord>, PersistenceError> {
        let rows = self
            .pool()
            .query(
                "SELECT definition_id, version, name, trigger_event, payload, created_at \
                 FROM cowork_workflow_definition ORDER BY definition_id, version",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(WorkflowDefinitionRecord {
                    definition_id: row.text("definition_id")?,
                    version: row.int("version")?,
                    name: row.text("name")?,
                    trigger_event: row.text("trigger_event")?,
                    payload: row.json("payload")?,
                    created_at: row.timestamp("created_at")?,
                })
            })
            .collect()
    }

    fn instance_from_row(row: &SqlRow) -> Result<WorkflowInstanceRecord, PersistenceError> {
        Ok(WorkflowInstanceRecord {
            instance_id: row.text("instance_id")?,
            definition_id: row.text("definition_id")?,
            definition_version: row.int("definition_version")?,
            status: WorkflowStatus::parse(&row.text("status")?),
            current_step_id: row.opt_text("current_step_id")?,
            state: row.json("state")?,
            trigger_event_id: row.text("trigger_event_id")?,
            started_at: row.timestamp("started_at")?,
            updated_at: row.timestamp("updated_at")?,
            completed_at: row.opt_timestamp("completed_at")?,
        })
    }

    pub async fn save_workflow_instance(
        &self,
        record: &WorkflowInstanceRecord,
    ) -> Result<(), PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "INSERT INTO cowork_workflow_instance \
             (instance_id, definition_id, definition_version, status, current_step_id, state, \
              trigger_event_id, started_at, updated_at, completed_at) \
             VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, \
                     CASE WHEN {} THEN {} ELSE NULL END) \
             ON CONFLICT (instance_id) DO UPDATE SET \
               status = excluded.status, \
               current_step_id = excluded.current_step_id, \
               state = excluded.state, \
               updated_at = excluded.updated_at, \
               completed_at = excluded.completed_at",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6),
            d.placeholder(7),
            d.placeholder(8),
            d.placeholder(9),
            d.placeholder(10),
            d.placeholder(11),
        );
        self.pool()
            .execute(
                &sql,
                &[
                    SqlValue::Text(record.instance_id.clone()),
                    SqlValue::Text(record.definition_id.clone()),
                    SqlValue::Int(record.definition_version),
                    SqlValue::Text(record.status.as_str().to_string()),
                    match &record.current_step_id {
                        Some(step) => SqlValue::Text(step.clone()),
                        None => SqlValue::Null,
                    },
                    SqlValue::Json(record.state.clone()),
                    SqlValue::Text(record.trigger_event_id.clone()),
                    SqlValue::Timestamp(record.started_at),
                    SqlValue::Timestamp(record.updated_at),
                    SqlValue::Bool(record.completed_at.is_some()),
                    SqlValue::Timestamp(record.completed_at.unwrap_or(record.updated_at)),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_workflow_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstanceRecord>, PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "SELECT instance_id, definition_id, definition_version, status, current_step_id, state, \
                    trigger_event_id, started_at, updated_at, completed_at \
             FROM cowork_workflow_instance WHERE instance_id = {}",
            d.placeholder(1),
        );
        let rows = self
            .pool()
            .query(&sql, &[SqlValue::Text(instance_id.to_string())])
            .await?;
        rows.first().map(Self::instance_from_row).transpose()
    }

    pub async fn list_running_instances(
        &self,
    ) -> Result<Vec<WorkflowInstanceRecord>, PersistenceError> {
        let rows = self
            .pool()
            .query(
                "SELECT instance_id, definition_id, definition_version, status, current_step_id, state, \
                        trigger_event_id, started_at, updated_at, completed_at \
                 FROM cowork_workflow_instance WHERE status = 'running' ORDER BY started_at",
                &[],
            )
            .await?;
        rows.iter().map(Self::instance_from_row).collect()
    }

    pub async fn append_workflow_history(
        &self,
        record: &WorkflowHistoryRecord,
    ) -> Result<(), PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "INSERT INTO cowork_workflow_history \
             (entry_id, instance_id, step_id, transition, event_id, payload, recorded_at) \
             VALUES ({}, {}, {}, {}, {}, {}, {})",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6),
            d.placeholder(7),
        );
        self.pool()
            .execute(
                &sql,
                &[
                    SqlValue::Text(record.entry_id.clone()),
                    SqlValue::Text(record.instance_id.clone()),
                    match &record.step_id {
                        Some(step) => SqlValue::Text(step.clone()),
                        None => SqlValue::Null,
                    },
                    SqlValue::Text(record.transition.clone()),
                    match &record.event_id {
                        Some(id) => SqlValue::Text(id.clone()),
                        None => SqlValue::Null,
                    },
                    SqlValue::Json(record.payload.clone()),
                    SqlValue::Timestamp(record.recorded_at),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn list_workflow_history(
        &self,
        instance_id: &str,
    ) -> Result<Vec<WorkflowHistoryRecord>, PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "SELECT entry_id, instance_id, step_id, transition, event_id, payload, recorded_at \
             FROM cowork_workflow_history WHERE instance_id = {} \
             ORDER BY recorded_at, entry_id",
            d.placeholder(1),
        );
        let rows = self
            .pool()
            .query(&sql, &[SqlValue::Text(instance_id.to_string())])
            .await?;
        rows.iter()
            .map(|row| {
                Ok(WorkflowHistoryRecord {
                    entry_id: row.text("entry_id")?,
                    instance_id: row.text("instance_id")?,
                    step_id: row.opt_text("step_id")?,
                    transition: row.text("transition")?,
                    event_id: row.opt_text("event_id")?,
                    payload: row.json("payload")?,
                    recorded_at: row.timestamp("recorded_at")?,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Workspace snapshots
    // -----------------------------------------------------------------------

    pub async fn save_workspace_snapshot(
        &self,
        workspace_id: &str,
        payload: Value,
    ) -> Result<WorkspaceSnapshotRecord, PersistenceError> {
        let d = self.dialect();
        let record = WorkspaceSnapshotRecord {
            snapshot_id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            payload,
            created_at: Utc::now(),
        };
        let sql = format!(
            "INSERT INTO cowork_workspace_snapshot (snapshot_id, workspace_id, payload, created_at) \
             VALUES ({}, {}, {}, {})",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
        );
        self.pool()
            .execute(
                &sql,
                &[
                    SqlValue::Text(record.snapshot_id.clone()),
                    SqlValue::Text(record.workspace_id.clone()),
                    SqlValue::Json(record.payload.clone()),
                    SqlValue::Timestamp(record.created_at),
                ],
            )
            .await?;
        Ok(record)
    }

    pub async fn latest_workspace_snapshot(
        &self,
        workspace_id: &str,
    ) -> Result<Option<WorkspaceSnapshotRecord>, PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "SELECT snapshot_id, workspace_id, payload, created_at \
             FROM cowork_workspace_snapshot WHERE workspace_id = {} \
             ORDER BY created_at DESC LIMIT 1",
            d.placeholder(1),
        );
        let rows = self
            .pool()
            .query(&sql, &[SqlValue::Text(workspace_id.to_string())])
            .await?;
        rows.first()
            .map(|row| {
                Ok(WorkspaceSnapshotRecord {
                    snapshot_id: row.text("snapshot_id")?,
                    workspace_id: row.text("workspace_id")?,
                    payload: row.json("payload")?,
                    created_at: row.timestamp("created_at")?,
                })
            })
            .transpose()
    }
}
