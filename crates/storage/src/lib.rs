pub mod cache;
pub mod query;

pub use cache::{CacheEntry, StanzaCache};
pub use query::{CompiledQuery, Query, QueryShapeError};

use rusqlite::Connection;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open stanza log: {0}")]
    ConnectionFailed(String),

    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error(transparent)]
    QueryShape(#[from] QueryShapeError),

    #[error("stanza log row {0} has no cached stanza")]
    MissingEntry(u64),
}

impl From<StorageError> for perch_core::PerchError {
    fn from(error: StorageError) -> Self {
        perch_core::PerchError::Storage(error.to_string())
    }
}

/// A schema step; `version` is stored in SQLite's `user_version` once the
/// step has run.
struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../migrations/001_stanza_log.sql"),
}];

/// Opens a private in-memory database with every migration applied.
pub(crate) fn open_in_memory() -> Result<Connection, StorageError> {
    let connection = Connection::open_in_memory()
        .map_err(|error| StorageError::ConnectionFailed(error.to_string()))?;
    migrate(&connection)?;
    Ok(connection)
}

fn schema_version(connection: &Connection) -> rusqlite::Result<u32> {
    connection.pragma_query_value(None, "user_version", |row| row.get(0))
}

fn migrate(connection: &Connection) -> Result<(), StorageError> {
    let current = schema_version(connection).map_err(|error| StorageError::MigrationFailed {
        version: 0,
        reason: format!("unreadable schema version: {error}"),
    })?;

    for migration in MIGRATIONS.iter().filter(|migration| migration.version > current) {
        let failed = |error: rusqlite::Error| StorageError::MigrationFailed {
            version: migration.version,
            reason: error.to_string(),
        };
        let tx = connection.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.pragma_update(None, "user_version", migration.version)
            .map_err(failed)?;
        tx.commit().map_err(failed)?;
        debug!(version = migration.version, "stanza log schema migrated");
    }
    Ok(())
}
