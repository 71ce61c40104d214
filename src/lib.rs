//! # cowork
//!
//! Coordination substrate for multiple autonomous agents working on a shared
//! project: a relational persistence layer with checksum-verified migrations
//! and generic JSON repositories, a durable event bus with pattern
//! subscriptions and per-consumer replay, a workflow engine whose state
//! machines survive process restarts, a versioned blackboard with optimistic
//! concurrency, and an agent coordinator for policy-gated messaging and
//! bounded-concurrency task batches.
//!
//! The design assumes one active orchestrator process per database:
//! durability — not live failover — is the crash-recovery guarantee.
//!
//! # Example
//!
//! ```rust,no_run
//! use cowork::runtime::Orchestrator;
//! use cowork::config::OrchestratorConfig;
//! use cowork::db::SqliteDatabasePool;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let pool = Arc::new(SqliteDatabasePool::open("cowork.db")?);
//! let orchestrator = Orchestrator::init(OrchestratorConfig::from_env(), pool).await?;
//! orchestrator.event_bus().publish("workspace:created", serde_json::json!({})).await?;
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod blackboard;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod events;
pub mod persistence;
pub mod runtime;
pub mod store;
pub mod workflow;

pub use blackboard::Blackboard;
pub use config::OrchestratorConfig;
pub use coordinator::AgentCoordinator;
pub use error::{
    BlackboardError, CoordinatorError, EventBusError, PersistenceError, WorkflowError,
};
pub use events::{EventBus, EventEnvelope};
pub use persistence::PersistenceManager;
pub use runtime::Orchestrator;
pub use store::DomainStore;
pub use workflow::{WorkflowDefinition, WorkflowEngine};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialise the `env_logger` backend for the `log` facade. Safe to call
/// more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder()
        .format_timestamp_millis()
        .try_init();
}
