//! Runtime configuration for the orchestrator.
//!
//! Loading is deliberately thin: values come from the environment with the
//! `COWORK_` prefix, and every field has a sensible default so tests and
//! embedded deployments can construct a config directly.

use std::path::PathBuf;

/// Configuration consumed by the application root.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Tenant identifier for this orchestrator deployment.
    pub tenant_id: String,
    /// Optional owner identifier for audit trails.
    pub owner_id: Option<String>,
    /// Database connection string (used by the `postgres` feature).
    pub database_url: String,
    /// Directory containing ordered `*.sql` migration files.
    pub migrations_dir: PathBuf,
    /// Run `migrate()` during `Orchestrator::init`.
    pub auto_migrate: bool,
    /// Poll interval for the event-bus background dispatcher.
    pub dispatch_interval_ms: u64,
    /// Maximum events loaded per dispatcher drain query.
    pub dispatch_batch_size: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            owner_id: None,
            database_url: "postgres://localhost/cowork".to_string(),
            migrations_dir: PathBuf::from("migrations"),
            auto_migrate: true,
            dispatch_interval_ms: 500,
            dispatch_batch_size: 100,
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from `COWORK_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tenant_id: env_string("COWORK_TENANT_ID").unwrap_or(defaults.tenant_id),
            owner_id: env_string("COWORK_OWNER_ID"),
            database_url: env_string("COWORK_DATABASE_URL").unwrap_or(defaults.database_url),
            migrations_dir: env_string("COWORK_MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.migrations_dir),
            auto_migrate: env_parsed("COWORK_AUTO_MIGRATE").unwrap_or(defaults.auto_migrate),
            dispatch_interval_ms: env_parsed("COWORK_DISPATCH_INTERVAL_MS")
                .unwrap_or(defaults.dispatch_interval_ms),
            dispatch_batch_size: env_parsed("COWORK_DISPATCH_BATCH_SIZE")
                .unwrap_or(defaults.dispatch_batch_size),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    match env_string(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("ignoring unparsable {key}={raw:?}");
                None
            }
        },
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.tenant_id, "default");
        assert!(cfg.auto_migrate);
        assert_eq!(cfg.dispatch_batch_size, 100);
    }
}
