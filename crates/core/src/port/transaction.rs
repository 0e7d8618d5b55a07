// Transaction port for atomic operations

use crate::domain::{Job, JobId, NewJob};
use crate::error::Result;
use async_trait::async_trait;

/// Transaction trait for atomic multi-step operations
#[async_trait]
pub trait Transaction: Send {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Job store operations within a transaction.
///
/// Everything a close cascade, a submission, or a cleanup deletion writes
/// goes through one of these, so a failure anywhere leaves no partial state.
#[async_trait]
pub trait JobStoreTransaction: Transaction {
    async fn get(&mut self, id: JobId) -> Result<Option<Job>>;

    async fn fetch_many(&mut self, ids: &[JobId]) -> Result<Vec<Job>>;

    async fn insert(&mut self, job: &NewJob) -> Result<Job>;

    async fn update(&mut self, job: &Job) -> Result<()>;

    /// Record that `source` must finish before `dest` may run.
    async fn insert_dependency(&mut self, source: JobId, dest: JobId) -> Result<()>;

    async fn insert_related(
        &mut self,
        job_id: JobId,
        class: &str,
        identifier_json: &str,
    ) -> Result<()>;

    /// Ids of jobs waiting on `id`.
    async fn outgoing_ids(&mut self, id: JobId) -> Result<Vec<JobId>>;

    async fn count_retry_jobs(&mut self, id: JobId) -> Result<i64>;

    async fn delete_job(&mut self, id: JobId) -> Result<()>;

    /// Remove every dependency edge touching `id`, in either direction.
    async fn delete_dependencies_of(&mut self, id: JobId) -> Result<()>;

    async fn delete_retry_jobs_of(&mut self, id: JobId) -> Result<()>;

    async fn delete_related_of(&mut self, id: JobId) -> Result<()>;
}
