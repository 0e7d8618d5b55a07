// Job Store Port (Interface)

use crate::domain::{Job, JobId, JobState, NewJob};
use crate::error::Result;
use crate::port::transaction::JobStoreTransaction;
use async_trait::async_trait;

/// Typed access to the job tables.
///
/// Methods here auto-commit; multi-row writes go through
/// [`JobStore::begin_transaction`]. Implementations push all concurrency
/// control into the database: the only atomic primitive required is the
/// conditional single-row update behind [`JobStore::claim`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job and return the stored row with its assigned id.
    async fn insert(&self, job: &NewJob) -> Result<Job>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Write all mutable columns of `job` back to its row.
    async fn update(&self, job: &Job) -> Result<()>;

    async fn delete(&self, id: JobId) -> Result<()>;

    /// First job with this exact invocation, lowest id first. Argument
    /// equality is byte-exact on the encoded form.
    async fn find_by_invocation(&self, command: &str, args: &[String]) -> Result<Option<Job>>;

    /// Next claimable candidate: unclaimed, PENDING, due, not excluded,
    /// ordered by (priority ASC, id ASC).
    async fn find_pending(
        &self,
        now: i64,
        excluded_ids: &[JobId],
        excluded_queues: &[String],
        restricted_queues: &[String],
    ) -> Result<Option<Job>>;

    /// Conditional single-row claim
    /// (`UPDATE jobs SET worker_name = ? WHERE id = ? AND worker_name IS NULL`).
    /// Returns the number of rows affected; at most one caller across the
    /// cluster observes 1 for a given job.
    async fn claim(&self, id: JobId, worker_name: &str) -> Result<u64>;

    /// Ids of jobs that must finish before `id` may run.
    async fn incoming_ids(&self, id: JobId) -> Result<Vec<JobId>>;

    /// Ids of jobs waiting on `id`.
    async fn outgoing_ids(&self, id: JobId) -> Result<Vec<JobId>>;

    /// Batched fetch; silently drops ids with no row.
    async fn fetch_many(&self, ids: &[JobId]) -> Result<Vec<Job>>;

    async fn count_retry_jobs(&self, id: JobId) -> Result<i64>;

    async fn retry_jobs(&self, id: JobId) -> Result<Vec<Job>>;

    /// Whether `id` has a retry job that is not yet in a final state.
    async fn has_live_retry(&self, id: JobId) -> Result<bool>;

    async fn find_for_related(
        &self,
        command: &str,
        class: &str,
        identifier_json: &str,
        states: &[JobState],
    ) -> Result<Option<Job>>;

    async fn find_all_for_related(&self, class: &str, identifier_json: &str) -> Result<Vec<Job>>;

    /// One RUNNING job whose last heartbeat is older than `checked_before`,
    /// skipping `excluded_ids`. Callers loop, appending each yielded id.
    async fn next_stale_running(
        &self,
        checked_before: i64,
        excluded_ids: &[JobId],
    ) -> Result<Option<Job>>;

    /// Retention selector: FINISHED non-retry jobs closed before `cutoff`.
    async fn finished_closed_before(
        &self,
        cutoff: i64,
        excluded_ids: &[JobId],
        limit: i64,
    ) -> Result<Vec<Job>>;

    /// Retention selector: non-retry jobs of any closed state, closed before
    /// `cutoff`.
    async fn closed_before(
        &self,
        cutoff: i64,
        excluded_ids: &[JobId],
        limit: i64,
    ) -> Result<Vec<Job>>;

    /// Retention selector: CANCELED non-retry jobs created before `cutoff`
    /// (canceled jobs that never ran have no closed_at).
    async fn canceled_created_before(
        &self,
        cutoff: i64,
        excluded_ids: &[JobId],
        limit: i64,
    ) -> Result<Vec<Job>>;

    async fn list_queues(&self) -> Result<Vec<String>>;

    /// Number of jobs in `queue` a worker could claim right now.
    async fn available_count(&self, queue: &str, now: i64) -> Result<i64>;

    /// Most recently closed non-successful jobs.
    async fn last_errored(&self, limit: i64) -> Result<Vec<Job>>;

    async fn begin_transaction(&self) -> Result<Box<dyn JobStoreTransaction>>;
}
