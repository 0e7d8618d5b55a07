// SQLite pool setup

use crate::queries::map_sqlx_error;
use conveyor_core::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Open the queue database, creating it if needed.
///
/// `CONVEYOR_POOL_SIZE` and `CONVEYOR_POOL_TIMEOUT` (seconds) tune the pool.
/// An in-memory database is pinned to one connection: every SQLite
/// `:memory:` connection is its own database, so a wider pool would scatter
/// the tables.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let size = if database_url.contains(":memory:") {
        1
    } else {
        env_or("CONVEYOR_POOL_SIZE", 20)
    };

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(map_sqlx_error)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(env_or("CONVEYOR_POOL_TIMEOUT", 5)))
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(size)
        .connect_with(options)
        .await
        .map_err(map_sqlx_error)
}
