// Schema setup

use crate::queries::map_sqlx_error;
use conveyor_core::Result;
use sqlx::SqlitePool;
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/001_initial_schema.sql");

/// Apply the job-queue schema if this database has not seen it yet.
///
/// There is a single schema script; the `schema_version` stamp it writes is
/// what a future upgrade would key on.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    if schema_applied(pool).await? {
        return Ok(());
    }

    info!("applying job queue schema");
    let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
    sqlx::raw_sql(SCHEMA)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
    tx.commit().await.map_err(map_sqlx_error)?;

    Ok(())
}

async fn schema_applied(pool: &SqlitePool) -> Result<bool> {
    let tables: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'jobs'")
            .fetch_one(pool)
            .await
            .map_err(map_sqlx_error)?;

    Ok(tables > 0)
}
