/// Database helpers
///
/// Every store runs on SQLite with WAL journaling: one writer at a time,
/// readers concurrent with the writer. Schemas are created inline by each
/// store on open.
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

use crate::error::{PdsError, PdsResult};

/// Pool options shared by the service-level databases
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Open (creating if missing) a SQLite database at `path`
pub async fn create_pool(path: &Path, options: DatabaseOptions) -> PdsResult<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let connect = SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .create_if_missing(true)
        .busy_timeout(options.busy_timeout);
    SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .connect_with(connect)
        .await
        .map_err(PdsError::Database)
}

/// In-memory pool for tests
///
/// Pinned to one connection: every new `:memory:` connection would
/// otherwise open its own empty database.
pub async fn memory_pool() -> PdsResult<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(":memory:")
        .await
        .map_err(PdsError::Database)
}

/// Fail fast if the database is unreachable
pub async fn test_connection(pool: &SqlitePool) -> PdsResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
