// Dependency graph queries

use crate::domain::{Job, JobId};
use crate::error::Result;
use crate::port::JobStore;
use std::sync::Arc;

/// Read-side view of the job dependency DAG.
///
/// Edges are stored as (source, dest) pairs meaning "source must finish
/// before dest may run". Nothing is cached: every call fetches fresh rows,
/// and callers traversing a closure carry their own visited set.
pub struct DependencyGraph {
    store: Arc<dyn JobStore>,
}

impl DependencyGraph {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Jobs that must reach FINISHED before `job` may run.
    pub async fn incoming(&self, job: &Job) -> Result<Vec<Job>> {
        self.fetch(self.store.incoming_ids(job.id).await?).await
    }

    /// Jobs waiting on `job`.
    pub async fn outgoing(&self, job: &Job) -> Result<Vec<Job>> {
        self.fetch(self.store.outgoing_ids(job.id).await?).await
    }

    async fn fetch(&self, ids: Vec<JobId>) -> Result<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store.fetch_many(&ids).await
    }
}
