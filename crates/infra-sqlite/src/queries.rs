// Shared SQL for pool-level and in-transaction access.
//
// Every helper is generic over the executor, so the store and the
// transaction wrapper run the same statements.

use conveyor_core::domain::{Job, JobId, NewJob};
use conveyor_core::error::{AppError, Result};
use sqlx::sqlite::Sqlite;

/// Every database failure surfaces as [`AppError::Storage`]. Nothing in the
/// queue branches on the failure kind (a failed transaction rolls back and
/// the candidate is skipped or the call reported), so the variant stays
/// opaque and the message keeps whatever detail the driver gives us.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> AppError {
    let detail = match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("{} (sqlite code {})", db_err.message(), code),
            None => db_err.message().to_string(),
        },
        other => other.to_string(),
    };
    AppError::Storage(detail)
}

/// Argument vectors are stored as an opaque JSON-array column. Equality
/// checks compare this encoded form byte for byte.
pub(crate) fn encode_args(args: &[String]) -> Result<String> {
    serde_json::to_string(args).map_err(AppError::from)
}

fn decode_args(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::Serialization(format!("malformed args column: {e}")))
}

/// SQLite row representation of a job.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    id: i64,
    command: String,
    args: String,
    state: String,
    queue: String,
    priority: i32,
    created_at: i64,
    execute_after: i64,
    started_at: Option<i64>,
    checked_at: Option<i64>,
    closed_at: Option<i64>,
    max_runtime_ms: i64,
    worker_name: Option<String>,
    output: Option<String>,
    error_output: Option<String>,
    exit_code: Option<i32>,
    is_retry_job: bool,
    original_job_id: Option<i64>,
    max_retries: i32,
}

impl JobRow {
    pub(crate) fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            command: self.command,
            args: decode_args(&self.args)?,
            state: self.state.parse()?,
            queue: self.queue,
            priority: self.priority,
            created_at: self.created_at,
            execute_after: self.execute_after,
            started_at: self.started_at,
            checked_at: self.checked_at,
            closed_at: self.closed_at,
            max_runtime_ms: self.max_runtime_ms,
            worker_name: self.worker_name,
            output: self.output,
            error_output: self.error_output,
            exit_code: self.exit_code,
            is_retry_job: self.is_retry_job,
            original_job_id: self.original_job_id.map(JobId),
            max_retries: self.max_retries,
        })
    }
}

pub(crate) async fn insert_job<'e, E>(executor: E, job: &NewJob) -> Result<Job>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        INSERT INTO jobs (
            command, args, state, queue, priority,
            created_at, execute_after, max_runtime_ms,
            is_retry_job, original_job_id, max_retries
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(&job.command)
    .bind(encode_args(&job.args)?)
    .bind(job.state.as_str())
    .bind(&job.queue)
    .bind(job.priority)
    .bind(job.created_at)
    .bind(job.execute_after)
    .bind(job.max_runtime_ms)
    .bind(job.is_retry_job)
    .bind(job.original_job_id.map(|id| id.0))
    .bind(job.max_retries)
    .fetch_one(executor)
    .await
    .map_err(map_sqlx_error)?;

    row.into_job()
}

pub(crate) async fn fetch_job<'e, E>(executor: E, id: JobId) -> Result<Option<Job>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
        .bind(id.0)
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_error)?;

    row.map(JobRow::into_job).transpose()
}

pub(crate) async fn fetch_many<'e, E>(executor: E, ids: &[JobId]) -> Result<Vec<Job>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb = sqlx::QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id.0);
    }
    separated.push_unseparated(") ORDER BY id ASC");

    let rows: Vec<JobRow> = qb
        .build_query_as()
        .fetch_all(executor)
        .await
        .map_err(map_sqlx_error)?;

    rows.into_iter().map(JobRow::into_job).collect()
}

/// Write all mutable columns back. Identity columns (command, args,
/// created_at, retry linkage) never change after insert.
pub(crate) async fn update_job<'e, E>(executor: E, job: &Job) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE jobs
        SET state = ?, queue = ?, priority = ?, execute_after = ?,
            started_at = ?, checked_at = ?, closed_at = ?, max_runtime_ms = ?,
            worker_name = ?, output = ?, error_output = ?, exit_code = ?,
            max_retries = ?
        WHERE id = ?
        "#,
    )
    .bind(job.state.as_str())
    .bind(&job.queue)
    .bind(job.priority)
    .bind(job.execute_after)
    .bind(job.started_at)
    .bind(job.checked_at)
    .bind(job.closed_at)
    .bind(job.max_runtime_ms)
    .bind(&job.worker_name)
    .bind(&job.output)
    .bind(&job.error_output)
    .bind(job.exit_code)
    .bind(job.max_retries)
    .bind(job.id.0)
    .execute(executor)
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

pub(crate) async fn incoming_ids<'e, E>(executor: E, id: JobId) -> Result<Vec<JobId>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let ids: Vec<i64> =
        sqlx::query_scalar("SELECT source_job_id FROM job_dependencies WHERE dest_job_id = ?")
            .bind(id.0)
            .fetch_all(executor)
            .await
            .map_err(map_sqlx_error)?;

    Ok(ids.into_iter().map(JobId).collect())
}

pub(crate) async fn outgoing_ids<'e, E>(executor: E, id: JobId) -> Result<Vec<JobId>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let ids: Vec<i64> =
        sqlx::query_scalar("SELECT dest_job_id FROM job_dependencies WHERE source_job_id = ?")
            .bind(id.0)
            .fetch_all(executor)
            .await
            .map_err(map_sqlx_error)?;

    Ok(ids.into_iter().map(JobId).collect())
}

pub(crate) async fn count_retry_jobs<'e, E>(executor: E, id: JobId) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE original_job_id = ?")
        .bind(id.0)
        .fetch_one(executor)
        .await
        .map_err(map_sqlx_error)
}

pub(crate) async fn insert_dependency<'e, E>(executor: E, source: JobId, dest: JobId) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO job_dependencies (source_job_id, dest_job_id) VALUES (?, ?)")
        .bind(source.0)
        .bind(dest.0)
        .execute(executor)
        .await
        .map_err(map_sqlx_error)?;

    Ok(())
}

pub(crate) async fn insert_related<'e, E>(
    executor: E,
    job_id: JobId,
    class: &str,
    identifier_json: &str,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO job_related_entities (job_id, related_class, related_id) VALUES (?, ?, ?)")
        .bind(job_id.0)
        .bind(class)
        .bind(identifier_json)
        .execute(executor)
        .await
        .map_err(map_sqlx_error)?;

    Ok(())
}
