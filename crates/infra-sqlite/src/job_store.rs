// SQLite JobStore Implementation

use crate::queries::{self, map_sqlx_error, JobRow};
use crate::transaction::SqliteStoreTransaction;
use async_trait::async_trait;
use conveyor_core::domain::{state, Job, JobId, JobState, NewJob};
use conveyor_core::error::Result;
use conveyor_core::port::{JobStore, JobStoreTransaction};
use sqlx::sqlite::Sqlite;
use sqlx::{QueryBuilder, SqlitePool};

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_optional(&self, mut qb: QueryBuilder<'_, Sqlite>) -> Result<Option<Job>> {
        let row: Option<JobRow> = qb
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(JobRow::into_job).transpose()
    }

    async fn fetch_all(&self, mut qb: QueryBuilder<'_, Sqlite>) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }
}

fn push_excluded_ids(qb: &mut QueryBuilder<'_, Sqlite>, excluded_ids: &[JobId]) {
    if excluded_ids.is_empty() {
        return;
    }
    qb.push(" AND id NOT IN (");
    let mut separated = qb.separated(", ");
    for id in excluded_ids {
        separated.push_bind(id.0);
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &NewJob) -> Result<Job> {
        queries::insert_job(&self.pool, job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        queries::fetch_job(&self.pool, id).await
    }

    async fn update(&self, job: &Job) -> Result<()> {
        queries::update_job(&self.pool, job).await
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn find_by_invocation(&self, command: &str, args: &[String]) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs WHERE command = ? AND args = ? ORDER BY id ASC LIMIT 1",
        )
        .bind(command)
        .bind(queries::encode_args(args)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn find_pending(
        &self,
        now: i64,
        excluded_ids: &[JobId],
        excluded_queues: &[String],
        restricted_queues: &[String],
    ) -> Result<Option<Job>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE worker_name IS NULL AND state = ");
        qb.push_bind(JobState::Pending.as_str());
        qb.push(" AND execute_after < ");
        qb.push_bind(now);

        push_excluded_ids(&mut qb, excluded_ids);

        if !excluded_queues.is_empty() {
            qb.push(" AND queue NOT IN (");
            let mut separated = qb.separated(", ");
            for queue in excluded_queues {
                separated.push_bind(queue);
            }
            separated.push_unseparated(")");
        }

        if !restricted_queues.is_empty() {
            qb.push(" AND queue IN (");
            let mut separated = qb.separated(", ");
            for queue in restricted_queues {
                separated.push_bind(queue);
            }
            separated.push_unseparated(")");
        }

        qb.push(" ORDER BY priority ASC, id ASC LIMIT 1");
        self.fetch_optional(qb).await
    }

    async fn claim(&self, id: JobId, worker_name: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE jobs SET worker_name = ? WHERE id = ? AND worker_name IS NULL")
            .bind(worker_name)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn incoming_ids(&self, id: JobId) -> Result<Vec<JobId>> {
        queries::incoming_ids(&self.pool, id).await
    }

    async fn outgoing_ids(&self, id: JobId) -> Result<Vec<JobId>> {
        queries::outgoing_ids(&self.pool, id).await
    }

    async fn fetch_many(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        queries::fetch_many(&self.pool, ids).await
    }

    async fn count_retry_jobs(&self, id: JobId) -> Result<i64> {
        queries::count_retry_jobs(&self.pool, id).await
    }

    async fn retry_jobs(&self, id: JobId) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> =
            sqlx::query_as("SELECT * FROM jobs WHERE original_job_id = ? ORDER BY id ASC")
                .bind(id.0)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn has_live_retry(&self, id: JobId) -> Result<bool> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM jobs WHERE original_job_id = ");
        qb.push_bind(id.0);
        qb.push(" AND state NOT IN (");
        let mut separated = qb.separated(", ");
        for final_state in state::FINAL_STATES {
            separated.push_bind(final_state.as_str());
        }
        separated.push_unseparated(")");

        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(count > 0)
    }

    async fn find_for_related(
        &self,
        command: &str,
        class: &str,
        identifier_json: &str,
        states: &[JobState],
    ) -> Result<Option<Job>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT j.* FROM jobs j \
             INNER JOIN job_related_entities r ON r.job_id = j.id \
             WHERE j.command = ",
        );
        qb.push_bind(command);
        qb.push(" AND r.related_class = ");
        qb.push_bind(class);
        qb.push(" AND r.related_id = ");
        qb.push_bind(identifier_json);

        if !states.is_empty() {
            qb.push(" AND j.state IN (");
            let mut separated = qb.separated(", ");
            for job_state in states {
                separated.push_bind(job_state.as_str());
            }
            separated.push_unseparated(")");
        }

        qb.push(" ORDER BY j.id ASC LIMIT 1");
        self.fetch_optional(qb).await
    }

    async fn find_all_for_related(&self, class: &str, identifier_json: &str) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT j.* FROM jobs j \
             INNER JOIN job_related_entities r ON r.job_id = j.id \
             WHERE r.related_class = ? AND r.related_id = ? \
             ORDER BY j.id ASC",
        )
        .bind(class)
        .bind(identifier_json)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn next_stale_running(
        &self,
        checked_before: i64,
        excluded_ids: &[JobId],
    ) -> Result<Option<Job>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE state = ");
        qb.push_bind(JobState::Running.as_str());
        qb.push(" AND worker_name IS NOT NULL AND checked_at < ");
        qb.push_bind(checked_before);
        push_excluded_ids(&mut qb, excluded_ids);
        qb.push(" ORDER BY id ASC LIMIT 1");
        self.fetch_optional(qb).await
    }

    async fn finished_closed_before(
        &self,
        cutoff: i64,
        excluded_ids: &[JobId],
        limit: i64,
    ) -> Result<Vec<Job>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE is_retry_job = 0 AND state = ");
        qb.push_bind(JobState::Finished.as_str());
        qb.push(" AND closed_at < ");
        qb.push_bind(cutoff);
        push_excluded_ids(&mut qb, excluded_ids);
        qb.push(" ORDER BY id ASC LIMIT ");
        qb.push_bind(limit);
        self.fetch_all(qb).await
    }

    async fn closed_before(
        &self,
        cutoff: i64,
        excluded_ids: &[JobId],
        limit: i64,
    ) -> Result<Vec<Job>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM jobs WHERE is_retry_job = 0 AND closed_at IS NOT NULL AND closed_at < ",
        );
        qb.push_bind(cutoff);
        push_excluded_ids(&mut qb, excluded_ids);
        qb.push(" ORDER BY id ASC LIMIT ");
        qb.push_bind(limit);
        self.fetch_all(qb).await
    }

    async fn canceled_created_before(
        &self,
        cutoff: i64,
        excluded_ids: &[JobId],
        limit: i64,
    ) -> Result<Vec<Job>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE is_retry_job = 0 AND state = ");
        qb.push_bind(JobState::Canceled.as_str());
        qb.push(" AND created_at < ");
        qb.push_bind(cutoff);
        push_excluded_ids(&mut qb, excluded_ids);
        qb.push(" ORDER BY id ASC LIMIT ");
        qb.push_bind(limit);
        self.fetch_all(qb).await
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT DISTINCT queue FROM jobs ORDER BY queue")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn available_count(&self, queue: &str, now: i64) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs \
             WHERE queue = ? AND state = ? AND worker_name IS NULL AND execute_after < ?",
        )
        .bind(queue)
        .bind(JobState::Pending.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn last_errored(&self, limit: i64) -> Result<Vec<Job>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE state IN (");
        let mut separated = qb.separated(", ");
        for errored_state in state::CLOSED_NON_SUCCESSFUL_STATES {
            separated.push_bind(errored_state.as_str());
        }
        separated.push_unseparated(") ORDER BY closed_at DESC, id DESC LIMIT ");
        qb.push_bind(limit);
        self.fetch_all(qb).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn JobStoreTransaction>> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(SqliteStoreTransaction::new(tx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};

    async fn setup_store() -> SqliteJobStore {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteJobStore::new(pool)
    }

    fn new_job(command: &str, priority: i32, queue: &str) -> NewJob {
        NewJob {
            command: command.to_string(),
            args: vec!["--verbose".to_string()],
            state: JobState::Pending,
            queue: queue.to_string(),
            priority,
            created_at: 1_000,
            execute_after: 1_000,
            max_runtime_ms: 0,
            max_retries: 0,
            is_retry_job: false,
            original_job_id: None,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_monotonic_ids() {
        let store = setup_store().await;

        let first = store.insert(&new_job("a", 0, "default")).await.unwrap();
        let second = store.insert(&new_job("b", 0, "default")).await.unwrap();

        assert!(second.id > first.id);
        let found = store.get(first.id).await.unwrap().unwrap();
        assert_eq!(found.command, "a");
        assert_eq!(found.args, vec!["--verbose".to_string()]);
    }

    #[tokio::test]
    async fn test_claim_is_single_shot() {
        let store = setup_store().await;
        let job = store.insert(&new_job("a", 0, "default")).await.unwrap();

        assert_eq!(store.claim(job.id, "w1").await.unwrap(), 1);
        assert_eq!(store.claim(job.id, "w2").await.unwrap(), 0);

        let claimed = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.worker_name.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_find_pending_orders_by_priority_then_id() {
        let store = setup_store().await;
        let a = store.insert(&new_job("a", 0, "default")).await.unwrap();
        let b = store.insert(&new_job("b", -5, "default")).await.unwrap();
        let c = store.insert(&new_job("c", 0, "default")).await.unwrap();

        let first = store
            .find_pending(2_000, &[], &[], &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, b.id);

        let second = store
            .find_pending(2_000, &[b.id], &[], &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, a.id);

        let third = store
            .find_pending(2_000, &[b.id, a.id], &[], &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.id, c.id);
    }

    #[tokio::test]
    async fn test_find_pending_respects_queue_filters() {
        let store = setup_store().await;
        let fast = store.insert(&new_job("a", 0, "fast")).await.unwrap();
        let slow = store.insert(&new_job("b", 0, "slow")).await.unwrap();

        let not_slow = store
            .find_pending(2_000, &[], &["slow".to_string()], &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(not_slow.id, fast.id);

        let only_slow = store
            .find_pending(2_000, &[], &[], &["slow".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(only_slow.id, slow.id);
    }

    #[tokio::test]
    async fn test_find_pending_skips_future_and_claimed_jobs() {
        let store = setup_store().await;

        let mut future = new_job("later", 0, "default");
        future.execute_after = 5_000;
        store.insert(&future).await.unwrap();

        let due = store.insert(&new_job("now", 0, "default")).await.unwrap();
        store.claim(due.id, "w1").await.unwrap();

        assert!(store.find_pending(2_000, &[], &[], &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invocation_lookup_is_byte_exact_and_oldest_first() {
        let store = setup_store().await;

        let mut one = new_job("sync", 0, "default");
        one.args = vec!["a".to_string()];
        let mut two = new_job("sync", 0, "default");
        two.args = vec!["a".to_string()];
        let mut other = new_job("sync", 0, "default");
        other.args = vec!["b".to_string()];

        let first = store.insert(&one).await.unwrap();
        store.insert(&two).await.unwrap();
        store.insert(&other).await.unwrap();

        let found = store
            .find_by_invocation("sync", &["a".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);

        assert!(store
            .find_by_invocation("sync", &["c".to_string()])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stale_running_selector() {
        let store = setup_store().await;

        let mut job = store.insert(&new_job("a", 0, "default")).await.unwrap();
        store.claim(job.id, "w1").await.unwrap();
        job.worker_name = Some("w1".to_string());
        job.state = JobState::Running;
        job.checked_at = Some(1_000);
        store.update(&job).await.unwrap();

        let stale = store.next_stale_running(2_000, &[]).await.unwrap().unwrap();
        assert_eq!(stale.id, job.id);

        assert!(store
            .next_stale_running(2_000, &[job.id])
            .await
            .unwrap()
            .is_none());
        assert!(store.next_stale_running(500, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_available_count_counts_claimable_jobs() {
        let store = setup_store().await;

        store.insert(&new_job("a", 0, "bulk")).await.unwrap();
        store.insert(&new_job("b", 0, "bulk")).await.unwrap();
        let claimed = store.insert(&new_job("c", 0, "bulk")).await.unwrap();
        store.claim(claimed.id, "w1").await.unwrap();

        assert_eq!(store.available_count("bulk", 2_000).await.unwrap(), 2);
        assert_eq!(store.available_count("other", 2_000).await.unwrap(), 0);
    }
}
