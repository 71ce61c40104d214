//! Blackboard — shared, versioned artifacts for inter-agent coordination.
//!
//! The blackboard is an in-memory cache of artifacts and feedback, hydrated
//! from and written through to the domain store. It is a projection, not the
//! source of truth: a fresh process rebuilds it with
//! [`Blackboard::configure_persistence`]. Writes use optimistic concurrency
//! instead of locks — racing writers at the same expected version are
//! detected at the storage layer and surfaced as `version_conflict`, and the
//! caller decides whether to re-read and retry.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::BlackboardError;
use crate::store::{
    BlackboardEntryRecord, BlackboardFeedbackRecord, BlackboardUpsert, DomainStore,
};

/// Options for [`Blackboard::update_artifact`].
#[derive(Debug, Clone)]
pub struct UpdateArtifact {
    pub workspace_id: String,
    /// The caller's last-seen version: `None` for an unconditional upsert,
    /// `Some(0)` to assert creation, `Some(n)` for compare-and-swap.
    pub expected_version: Option<i64>,
}

impl UpdateArtifact {
    pub fn in_workspace(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            expected_version: None,
        }
    }

    pub fn expecting(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Options for [`Blackboard::configure_persistence`].
#[derive(Debug, Clone)]
pub struct PersistenceOptions {
    /// Load existing artifacts and feedback into the cache so a fresh
    /// process recovers prior state instead of starting empty.
    pub hydrate_from_store: bool,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            hydrate_from_store: true,
        }
    }
}

/// The shared blackboard.
pub struct Blackboard {
    artifacts: DashMap<(String, String), BlackboardEntryRecord>,
    feedbacks: DashMap<String, Vec<BlackboardFeedbackRecord>>,
    store: RwLock<Option<Arc<DomainStore>>>,
    /// Serializes cache-only writes so the in-memory CAS check is atomic.
    memory_write_lock: tokio::sync::Mutex<()>,
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Blackboard {
    pub fn new() -> Self {
        Self {
            artifacts: DashMap::new(),
            feedbacks: DashMap::new(),
            store: RwLock::new(None),
            memory_write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn current_store(&self) -> Option<Arc<DomainStore>> {
        self.store.read().clone()
    }

    /// Attach the domain store and optionally hydrate the cache from it.
    pub async fn configure_persistence(
        &self,
        store: Arc<DomainStore>,
        options: PersistenceOptions,
    ) -> Result<(), BlackboardError> {
        if options.hydrate_from_store {
            for entry in store.list_blackboard_entries().await? {
                self.artifacts.insert(
                    (entry.workspace_id.clone(), entry.artifact_key.clone()),
                    entry,
                );
            }
            for feedback in store.list_feedback().await? {
                self.feedbacks
                    .entry(feedback.target_id.clone())
                    .or_default()
                    .push(feedback);
            }
            log::debug!(
                "blackboard hydrated: {} artifacts, {} feedback targets",
                self.artifacts.len(),
                self.feedbacks.len()
            );
        }
        *self.store.write() = Some(store);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    /// Write an artifact revision. With persistence configured the write
    /// goes through the store's versioned upsert; if two writers race on the
    /// same key at the same `expected_version`, exactly one succeeds and the
    /// other receives a version conflict — no silent overwrite.
    pub async fn update_artifact(
        &self,
        artifact_key: &str,
        payload: Value,
        actor: &str,
        artifact_type: &str,
        options: UpdateArtifact,
    ) -> Result<BlackboardEntryRecord, BlackboardError> {
        let entry = match self.current_store() {
            Some(store) => {
                store
                    .upsert_blackboard_entry(BlackboardUpsert {
                        workspace_id: options.workspace_id.clone(),
                        artifact_key: artifact_key.to_string(),
                        artifact_type: artifact_type.to_string(),
                        payload,
                        source: actor.to_string(),
                        expected_version: options.expected_version,
                    })
                    .await?
            }
            None => {
                self.memory_upsert(artifact_key, payload, actor, artifact_type, &options)
                    .await?
            }
        };

        self.artifacts.insert(
            (entry.workspace_id.clone(), entry.artifact_key.clone()),
            entry.clone(),
        );
        Ok(entry)
    }

    /// Cache-only CAS for store-less operation; same semantics as the
    /// storage path.
    async fn memory_upsert(
        &self,
        artifact_key: &str,
        payload: Value,
        actor: &str,
        artifact_type: &str,
        options: &UpdateArtifact,
    ) -> Result<BlackboardEntryRecord, BlackboardError> {
        let _guard = self.memory_write_lock.lock().await;

        let cache_key = (options.workspace_id.clone(), artifact_key.to_string());
        let existing = self.artifacts.get(&cache_key).map(|e| e.value().clone());
        let stored_version = existing.as_ref().map(|e| e.version);

        if let Some(expected) = options.expected_version {
            if stored_version.unwrap_or(0) != expected {
                return Err(BlackboardError::VersionConflict {
                    workspace_id: options.workspace_id.clone(),
                    artifact_key: artifact_key.to_string(),
                    expected,
                    stored: stored_version,
                });
            }
        }

        Ok(BlackboardEntryRecord {
            workspace_id: options.workspace_id.clone(),
            artifact_key: artifact_key.to_string(),
            artifact_id: existing
                .map(|e| e.artifact_id)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            artifact_type: artifact_type.to_string(),
            version: stored_version.unwrap_or(0) + 1,
            payload,
            source: actor.to_string(),
            updated_at: chrono::Utc::now(),
        })
    }

    /// Read an artifact from the cache.
    pub fn get_artifact(
        &self,
        workspace_id: &str,
        artifact_key: &str,
    ) -> Option<BlackboardEntryRecord> {
        self.artifacts
            .get(&(workspace_id.to_string(), artifact_key.to_string()))
            .map(|e| e.value().clone())
    }

    /// All cached artifacts of one workspace, sorted by key.
    pub fn list_artifacts(&self, workspace_id: &str) -> Vec<BlackboardEntryRecord> {
        let mut entries: Vec<BlackboardEntryRecord> = self
            .artifacts
            .iter()
            .filter(|e| e.key().0 == workspace_id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.artifact_key.cmp(&b.artifact_key));
        entries
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    /// Append a feedback record. Feedback is append-only: existing records
    /// are never mutated.
    pub async fn add_feedback(
        &self,
        actor: &str,
        target_id: &str,
        content: &str,
        severity: &str,
        metadata: Value,
    ) -> Result<BlackboardFeedbackRecord, BlackboardError> {
        let now = chrono::Utc::now();
        let record = BlackboardFeedbackRecord {
            feedback_id: Uuid::new_v4().to_string(),
            target_id: target_id.to_string(),
            source_actor: actor.to_string(),
            content: content.to_string(),
            severity: severity.to_string(),
            status: "open".to_string(),
            metadata,
            created_at: now,
            updated_at: now,
        };

        if let Some(store) = self.current_store() {
            store.insert_feedback(&record).await?;
        }
        self.feedbacks
            .entry(target_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    /// Feedback recorded against one target, from the cache.
    pub fn get_feedbacks(&self, target_id: &str) -> Vec<BlackboardFeedbackRecord> {
        self.feedbacks
            .get(target_id)
            .map(|f| f.value().clone())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Write a snapshot of each cached workspace's artifacts to the store.
    pub async fn flush_persistence(&self) -> Result<(), BlackboardError> {
        let Some(store) = self.current_store() else {
            return Ok(());
        };

        let mut by_workspace: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for entry in self.artifacts.iter() {
            by_workspace
                .entry(entry.workspace_id.clone())
                .or_default()
                .insert(
                    entry.artifact_key.clone(),
                    serde_json::to_value(entry.value()).unwrap_or(Value::Null),
                );
        }

        for (workspace_id, artifacts) in by_workspace {
            store
                .save_workspace_snapshot(
                    &workspace_id,
                    serde_json::json!({ "artifacts": artifacts }),
                )
                .await?;
        }
        Ok(())
    }

    /// Drop all cached state. Persistence, if configured, is untouched.
    pub fn clear(&self) {
        self.artifacts.clear();
        self.feedbacks.clear();
    }

    /// Testing aid: reset in-memory state and detach the store.
    pub fn reset_for_tests(&self) {
        self.clear();
        *self.store.write() = None;
    }
}
