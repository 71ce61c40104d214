//! Error taxonomy for the coordination substrate.
//!
//! Every component has its own error enum; each variant carries the
//! structured context a caller needs for programmatic handling, and every
//! enum exposes a stable machine-readable `code()` string. Infrastructure
//! errors propagate unwrapped to the caller — retry and backoff, if any,
//! belong to the caller, never to this layer.

use thiserror::Error;

/// Errors raised by the persistence layer (pool, migrations, repositories,
/// transactions).
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// A repository was requested for an entity type that has no table
    /// mapping. Raised before any SQL is issued.
    #[error("unknown entity type: {entity_type}")]
    UnknownEntityType { entity_type: String },

    /// An update targeted an entity id that does not exist.
    #[error("entity not found: {entity_type}/{id}")]
    EntityNotFound { entity_type: String, id: String },

    /// A caller-controlled identifier (table name, filter key, order-by key)
    /// failed the safe-identifier check. Raised before any SQL is issued.
    #[error("unsafe SQL identifier rejected: {identifier:?}")]
    InvalidIdentifier { identifier: String },

    /// A filter value could not be interpreted for its field (e.g. an
    /// unparsable date-time for `created_at`).
    #[error("invalid filter value for {field}: {message}")]
    InvalidFilter { field: String, message: String },

    /// `limit` was not a positive integer, or `offset` was negative.
    #[error("invalid {field} value: {value}")]
    InvalidPagination { field: &'static str, value: i64 },

    /// A transaction could not be started, or was used after finalize.
    #[error("transaction error: {message}")]
    TransactionFailed { message: String },

    /// A migration's SQL failed to execute. Only the failing migration is
    /// rolled back; the whole `migrate()` call aborts.
    #[error("migration {name} failed: {message}")]
    MigrationFailed { name: String, message: String },

    /// An already-applied migration file no longer hashes to its recorded
    /// checksum. This is a hard integrity violation and halts migration.
    #[error(
        "migration integrity violation for {name}: recorded checksum {recorded}, file now hashes to {actual}"
    )]
    MigrationIntegrity {
        name: String,
        recorded: String,
        actual: String,
    },

    /// The underlying database driver reported an error.
    #[error("database driver error: {message}")]
    Driver { message: String },
}

impl PersistenceError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownEntityType { .. } => "unknown_entity_type",
            Self::EntityNotFound { .. } => "entity_not_found",
            Self::InvalidIdentifier { .. } => "invalid_identifier",
            Self::InvalidFilter { .. } => "invalid_filter",
            Self::InvalidPagination { .. } => "invalid_pagination",
            Self::TransactionFailed { .. } => "transaction_failed",
            Self::MigrationFailed { .. } => "migration_failed",
            Self::MigrationIntegrity { .. } => "migration_integrity",
            Self::Driver { .. } => "driver_error",
        }
    }

    /// Wrap a driver-level error message.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Driver {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Driver {
            message: err.to_string(),
        }
    }
}

/// Errors raised by the event bus.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// A subscription pattern could not be compiled.
    #[error("invalid event pattern: {pattern:?}")]
    InvalidPattern { pattern: String },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl EventBusError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPattern { .. } => "invalid_pattern",
            Self::Persistence(e) => e.code(),
        }
    }
}

/// Errors raised by the blackboard.
#[derive(Debug, Error)]
pub enum BlackboardError {
    /// Optimistic-concurrency check failed: the stored version no longer
    /// matches the caller's `expected_version`. The caller decides whether
    /// to re-read and retry.
    #[error(
        "version conflict on {workspace_id}/{artifact_key}: expected {expected}, stored {stored:?}"
    )]
    VersionConflict {
        workspace_id: String,
        artifact_key: String,
        expected: i64,
        stored: Option<i64>,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl BlackboardError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::VersionConflict { .. } => "version_conflict",
            Self::Persistence(e) => e.code(),
        }
    }
}

/// Errors raised by the workflow engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A persistence-requiring method was called before
    /// `configure_persistence`.
    #[error("persistence not configured: {operation} requires a domain store")]
    PersistenceNotConfigured { operation: &'static str },

    #[error("workflow definition not found: {definition_id} v{version}")]
    DefinitionNotFound {
        definition_id: String,
        version: i64,
    },

    /// A definition failed structural validation (empty steps, duplicate
    /// step ids, uncompilable event pattern, dangling next_step_id).
    #[error("invalid workflow definition {definition_id}: {message}")]
    InvalidDefinition {
        definition_id: String,
        message: String,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    EventBus(#[from] EventBusError),
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PersistenceNotConfigured { .. } => "persistence_not_configured",
            Self::DefinitionNotFound { .. } => "definition_not_found",
            Self::InvalidDefinition { .. } => "invalid_definition",
            Self::Persistence(e) => e.code(),
            Self::EventBus(e) => e.code(),
        }
    }
}

/// Errors raised by the agent coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The messaging policy rejected the route. Raised before any delivery
    /// or event emission.
    #[error("messaging route not allowed: {from} -> {to}")]
    RouteNotAllowed { from: String, to: String },

    #[error(transparent)]
    EventBus(#[from] EventBusError),

    #[error(transparent)]
    Blackboard(#[from] BlackboardError),
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RouteNotAllowed { .. } => "route_not_allowed",
            Self::EventBus(e) => e.code(),
            Self::Blackboard(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_error_codes() {
        let err = PersistenceError::UnknownEntityType {
            entity_type: "widget".into(),
        };
        assert_eq!(err.code(), "unknown_entity_type");

        let err = PersistenceError::MigrationIntegrity {
            name: "0001_init.sql".into(),
            recorded: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(err.code(), "migration_integrity");
        assert!(err.to_string().contains("0001_init.sql"));
    }

    #[test]
    fn test_version_conflict_context() {
        let err = BlackboardError::VersionConflict {
            workspace_id: "ws-1".into(),
            artifact_key: "plan".into(),
            expected: 2,
            stored: Some(3),
        };
        assert_eq!(err.code(), "version_conflict");
        assert!(err.to_string().contains("ws-1/plan"));
    }

    #[test]
    fn test_nested_codes_pass_through() {
        let err = WorkflowError::Persistence(PersistenceError::driver("boom"));
        assert_eq!(err.code(), "driver_error");

        let err = CoordinatorError::RouteNotAllowed {
            from: "qa".into(),
            to: "research".into(),
        };
        assert_eq!(err.code(), "route_not_allowed");
    }
}
