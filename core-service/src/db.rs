//! SQLite pool bootstrap.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Path selecting a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Open (creating when missing) the database at `path`.
///
/// `:memory:` opens an in-memory database on a single connection, so every
/// query sees the same data.
pub async fn create_pool(path: &Path) -> Result<SqlitePool> {
    info!(database = %path.display(), "Creating database connection pool");

    if path.as_os_str() == IN_MEMORY {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        return Ok(pool);
    }

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    debug!("SQLite connection options configured");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options)
        .await?;

    info!(connections = pool.size(), "Database connection pool created");
    Ok(pool)
}
