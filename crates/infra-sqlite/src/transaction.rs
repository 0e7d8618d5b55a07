// SQLite Transaction Implementation

use crate::queries::{self, map_sqlx_error};
use async_trait::async_trait;
use conveyor_core::domain::{Job, JobId, NewJob};
use conveyor_core::error::Result;
use conveyor_core::port::{JobStoreTransaction, Transaction};
use sqlx::{Sqlite, Transaction as SqlxTransaction};

pub struct SqliteStoreTransaction {
    tx: SqlxTransaction<'static, Sqlite>,
}

impl SqliteStoreTransaction {
    pub(crate) fn new(tx: SqlxTransaction<'static, Sqlite>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Transaction for SqliteStoreTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}

#[async_trait]
impl JobStoreTransaction for SqliteStoreTransaction {
    async fn get(&mut self, id: JobId) -> Result<Option<Job>> {
        queries::fetch_job(&mut *self.tx, id).await
    }

    async fn fetch_many(&mut self, ids: &[JobId]) -> Result<Vec<Job>> {
        queries::fetch_many(&mut *self.tx, ids).await
    }

    async fn insert(&mut self, job: &NewJob) -> Result<Job> {
        queries::insert_job(&mut *self.tx, job).await
    }

    async fn update(&mut self, job: &Job) -> Result<()> {
        queries::update_job(&mut *self.tx, job).await
    }

    async fn insert_dependency(&mut self, source: JobId, dest: JobId) -> Result<()> {
        queries::insert_dependency(&mut *self.tx, source, dest).await
    }

    async fn insert_related(
        &mut self,
        job_id: JobId,
        class: &str,
        identifier_json: &str,
    ) -> Result<()> {
        queries::insert_related(&mut *self.tx, job_id, class, identifier_json).await
    }

    async fn outgoing_ids(&mut self, id: JobId) -> Result<Vec<JobId>> {
        queries::outgoing_ids(&mut *self.tx, id).await
    }

    async fn count_retry_jobs(&mut self, id: JobId) -> Result<i64> {
        queries::count_retry_jobs(&mut *self.tx, id).await
    }

    async fn delete_job(&mut self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn delete_dependencies_of(&mut self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM job_dependencies WHERE source_job_id = ? OR dest_job_id = ?")
            .bind(id.0)
            .bind(id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn delete_retry_jobs_of(&mut self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE original_job_id = ?")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn delete_related_of(&mut self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM job_related_entities WHERE job_id = ?")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}
