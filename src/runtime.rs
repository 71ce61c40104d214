//! The application root.
//!
//! Components are explicitly constructed and dependency-injected here — no
//! process-wide singletons. `init` wires the stack leaf-to-root
//! (persistence, domain store, event bus, blackboard, workflow engine,
//! agent coordinator), hydrates what persists, and starts the background
//! machinery; `shutdown` unwinds it. Tests build a fresh in-memory stack
//! per case instead of mutating shared state.

use std::sync::Arc;

use anyhow::Context;

use crate::blackboard::{Blackboard, PersistenceOptions};
use crate::config::OrchestratorConfig;
use crate::coordinator::AgentCoordinator;
use crate::db::{DatabasePool, SqliteDatabasePool};
use crate::events::EventBus;
use crate::persistence::PersistenceManager;
use crate::store::DomainStore;
use crate::workflow::WorkflowEngine;

/// Owner of the component graph for one orchestrator process.
pub struct Orchestrator {
    config: OrchestratorConfig,
    persistence: Arc<PersistenceManager>,
    store: Arc<DomainStore>,
    event_bus: Arc<EventBus>,
    blackboard: Arc<Blackboard>,
    workflow_engine: Arc<WorkflowEngine>,
    coordinator: Arc<AgentCoordinator>,
}

impl Orchestrator {
    /// Wire and start the full stack against the given pool.
    pub async fn init(
        config: OrchestratorConfig,
        pool: Arc<dyn DatabasePool>,
    ) -> anyhow::Result<Self> {
        let persistence = Arc::new(PersistenceManager::new(
            pool,
            config.migrations_dir.clone(),
        ));
        if config.auto_migrate {
            let report = persistence
                .migrate()
                .await
                .context("running startup migrations")?;
            log::info!(
                "migrations: {} applied, {} skipped",
                report.applied.len(),
                report.skipped.len()
            );
        }

        let store = Arc::new(DomainStore::new(Arc::clone(&persistence)));

        let event_bus = Arc::new(EventBus::new());
        event_bus.configure_persistence(Arc::clone(&store));

        let blackboard = Arc::new(Blackboard::new());
        blackboard
            .configure_persistence(Arc::clone(&store), PersistenceOptions::default())
            .await
            .context("hydrating blackboard")?;

        let workflow_engine = Arc::new(WorkflowEngine::new(Arc::clone(&event_bus)));
        workflow_engine
            .configure_persistence(Arc::clone(&store))
            .await
            .context("hydrating workflow engine")?;
        workflow_engine.start().await.context("starting workflow engine")?;

        event_bus.start_dispatcher(config.dispatch_interval_ms, config.dispatch_batch_size);

        let coordinator = Arc::new(AgentCoordinator::new(
            Arc::clone(&event_bus),
            Arc::clone(&blackboard),
        ));

        Ok(Self {
            config,
            persistence,
            store,
            event_bus,
            blackboard,
            workflow_engine,
            coordinator,
        })
    }

    /// Connect to PostgreSQL and init against it.
    #[cfg(feature = "postgres")]
    pub async fn connect(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let pool = crate::db::PgDatabasePool::connect(&config.database_url, 10)
            .await
            .context("connecting to postgres")?;
        Self::init(config, Arc::new(pool)).await
    }

    /// Fresh stack over a private in-memory database, for tests and
    /// examples.
    pub async fn in_memory_for_tests() -> anyhow::Result<Self> {
        let pool = Arc::new(SqliteDatabasePool::in_memory()?);
        let config = OrchestratorConfig {
            migrations_dir: concat!(env!("CARGO_MANIFEST_DIR"), "/migrations").into(),
            ..OrchestratorConfig::default()
        };
        Self::init(config, pool).await
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn persistence(&self) -> &Arc<PersistenceManager> {
        &self.persistence
    }

    pub fn store(&self) -> &Arc<DomainStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn blackboard(&self) -> &Arc<Blackboard> {
        &self.blackboard
    }

    pub fn workflow_engine(&self) -> &Arc<WorkflowEngine> {
        &self.workflow_engine
    }

    pub fn coordinator(&self) -> &Arc<AgentCoordinator> {
        &self.coordinator
    }

    /// Stop background machinery, flush caches, and release the pool.
    pub async fn shutdown(&self) {
        self.workflow_engine.stop();
        self.event_bus.stop_dispatcher().await;
        if let Err(e) = self.blackboard.flush_persistence().await {
            log::warn!("blackboard flush during shutdown failed: {e}");
        }
        self.persistence.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::UpdateArtifact;
    use crate::store::WorkflowStatus;
    use crate::workflow::{StepDefinition, WorkflowDefinition};
    use serde_json::json;

    #[tokio::test]
    async fn test_full_stack_smoke() {
        let orchestrator = Orchestrator::in_memory_for_tests().await.unwrap();

        // Persistence is healthy and migrated.
        let health = orchestrator.persistence().health_check().await;
        assert!(health.healthy);

        // Workflows run end to end through the shared bus.
        let definition = WorkflowDefinition::new("greet", 1, "Greeting", "greet:start")
            .step(StepDefinition::new("waiting").on("greet:finish").then("done"))
            .step(StepDefinition::new("done").terminal());
        orchestrator
            .workflow_engine()
            .register_definition(definition, true)
            .await
            .unwrap();

        orchestrator
            .event_bus()
            .publish("greet:start", json!({"who": "world"}))
            .await
            .unwrap();
        orchestrator
            .event_bus()
            .publish("greet:finish", json!({}))
            .await
            .unwrap();

        let instances = orchestrator.workflow_engine().running_instances();
        assert!(instances.is_empty());

        // The blackboard writes through to storage.
        orchestrator
            .blackboard()
            .update_artifact(
                "readme",
                json!({"body": "hello"}),
                "writer",
                "document",
                UpdateArtifact::in_workspace("ws-1"),
            )
            .await
            .unwrap();
        let stored = orchestrator
            .store()
            .get_blackboard_entry("ws-1", "readme")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);

        // Instances are persisted as completed.
        let running = orchestrator.store().list_running_instances().await.unwrap();
        assert!(running.is_empty());
        let all_completed = orchestrator
            .store()
            .persistence()
            .pool()
            .query(
                "SELECT status FROM cowork_workflow_instance",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(all_completed.len(), 1);
        assert_eq!(
            WorkflowStatus::parse(&all_completed[0].text("status").unwrap()),
            WorkflowStatus::Completed
        );

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_fresh_test_stacks_are_isolated() {
        let first = Orchestrator::in_memory_for_tests().await.unwrap();
        first
            .blackboard()
            .update_artifact(
                "shared",
                json!({}),
                "a",
                "document",
                UpdateArtifact::in_workspace("ws-1"),
            )
            .await
            .unwrap();

        let second = Orchestrator::in_memory_for_tests().await.unwrap();
        assert!(second.blackboard().get_artifact("ws-1", "shared").is_none());

        first.shutdown().await;
        second.shutdown().await;
    }
}
