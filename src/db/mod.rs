//! Database drivers behind a pluggable pool contract.

pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

pub use pool::{DatabasePool, DatabaseTransaction, SqlDialect, SqlRow, SqlValue};
#[cfg(feature = "postgres")]
pub use postgres::PgDatabasePool;
pub use sqlite::SqliteDatabasePool;
