// Cleanup - stale-running detection and retention-based pruning

use crate::application::manager::JobManager;
use crate::domain::{state, Job, JobId, JobState};
use crate::error::{AppError, Result};
use crate::port::{JobStore, JobStoreTransaction, TimeProvider, Transaction};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A RUNNING job whose heartbeat is older than this is considered stale.
pub const STALE_RUNNING_THRESHOLD_MS: i64 = 5 * 60 * 1_000;

/// Upper bound per retention query; pruning pages through batches.
const RETENTION_BATCH_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How long closed jobs are kept.
    pub max_retention_ms: i64,
    /// How long successfully finished jobs are kept.
    pub max_retention_succeeded_ms: i64,
    /// Maximum number of jobs deleted per invocation.
    pub per_call: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_retention_ms: 7 * 24 * 60 * 60 * 1_000,
            max_retention_succeeded_ms: 60 * 60 * 1_000,
            per_call: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    /// Stale RUNNING jobs closed as INCOMPLETE.
    pub swept_stale: usize,
    /// Expired jobs deleted.
    pub deleted: usize,
}

enum RetentionPass {
    Succeeded,
    Closed,
    CanceledUnstarted,
}

/// Periodic maintenance over the job tables.
///
/// Each run first reaps jobs whose worker stopped heartbeating, then deletes
/// jobs past their retention. Both phases page with an exclusion-list cursor
/// so a candidate that cannot be processed is skipped, not retried forever.
pub struct Cleanup {
    store: Arc<dyn JobStore>,
    manager: Arc<JobManager>,
    time_provider: Arc<dyn TimeProvider>,
    config: CleanupConfig,
}

impl Cleanup {
    pub fn new(
        store: Arc<dyn JobStore>,
        manager: Arc<JobManager>,
        time_provider: Arc<dyn TimeProvider>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            store,
            manager,
            time_provider,
            config,
        }
    }

    pub async fn run(&self) -> Result<CleanupReport> {
        let swept_stale = self.sweep_stale_running().await?;
        let deleted = self.prune_expired().await?;
        info!(swept_stale, deleted, "cleanup pass finished");
        Ok(CleanupReport {
            swept_stale,
            deleted,
        })
    }

    /// Close abandoned RUNNING jobs as INCOMPLETE.
    ///
    /// Jobs already awaiting a retry are left alone; their outcome is the
    /// retry child's to decide.
    async fn sweep_stale_running(&self) -> Result<usize> {
        let mut excluded: Vec<JobId> = Vec::new();
        let mut swept = 0;

        loop {
            let cutoff = self.time_provider.now_millis() - STALE_RUNNING_THRESHOLD_MS;
            let Some(job) = self.store.next_stale_running(cutoff, &excluded).await? else {
                break;
            };
            excluded.push(job.id);

            if self.store.has_live_retry(job.id).await? {
                debug!(job_id = %job.id, "stale job already awaiting retry, skipping");
                continue;
            }

            warn!(
                job_id = %job.id,
                worker = job.worker_name.as_deref().unwrap_or("<none>"),
                checked_at = ?job.checked_at,
                "closing stale running job as incomplete"
            );
            match self.manager.close(&job, JobState::Incomplete).await {
                Ok(_) => swept += 1,
                Err(AppError::Storage(e)) => {
                    warn!(job_id = %job.id, error = %e, "failed to close stale job, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(swept)
    }

    /// Delete jobs past their retention, at most `per_call` per invocation.
    ///
    /// Retry jobs are never selected directly; they are removed together with
    /// their original.
    async fn prune_expired(&self) -> Result<usize> {
        let now = self.time_provider.now_millis();
        let succeeded_cutoff = now - self.config.max_retention_succeeded_ms;
        let retention_cutoff = now - self.config.max_retention_ms;

        let mut excluded: Vec<JobId> = Vec::new();
        let mut remaining = self.config.per_call;
        let mut deleted = 0;

        for (pass, cutoff) in [
            (RetentionPass::Succeeded, succeeded_cutoff),
            (RetentionPass::Closed, retention_cutoff),
            (RetentionPass::CanceledUnstarted, retention_cutoff),
        ] {
            deleted += self
                .prune_pass(&pass, cutoff, &mut excluded, &mut remaining)
                .await?;
            if remaining == 0 {
                break;
            }
        }

        Ok(deleted)
    }

    async fn prune_pass(
        &self,
        pass: &RetentionPass,
        cutoff: i64,
        excluded: &mut Vec<JobId>,
        remaining: &mut usize,
    ) -> Result<usize> {
        let mut deleted = 0;

        while *remaining > 0 {
            let limit = RETENTION_BATCH_SIZE.min(*remaining as i64);
            let batch = match pass {
                RetentionPass::Succeeded => {
                    self.store
                        .finished_closed_before(cutoff, excluded.as_slice(), limit)
                        .await?
                }
                RetentionPass::Closed => {
                    self.store
                        .closed_before(cutoff, excluded.as_slice(), limit)
                        .await?
                }
                RetentionPass::CanceledUnstarted => {
                    self.store
                        .canceled_created_before(cutoff, excluded.as_slice(), limit)
                        .await?
                }
            };
            if batch.is_empty() {
                break;
            }

            for job in batch {
                if *remaining == 0 {
                    break;
                }
                excluded.push(job.id);
                match self.delete_with_dependents(&job).await {
                    Ok(()) => {
                        deleted += 1;
                        *remaining -= 1;
                        debug!(job_id = %job.id, "expired job deleted");
                    }
                    Err(AppError::Storage(e)) => {
                        warn!(job_id = %job.id, error = %e, "failed to delete job, skipping");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(deleted)
    }

    /// Delete one job in its own transaction.
    ///
    /// Jobs still waiting on the candidate can never run once it is gone, so
    /// they are closed first: FAILED if the candidate was RUNNING, CANCELED
    /// otherwise. Edge rows, retry children, and related-entity rows go with
    /// the job.
    async fn delete_with_dependents(&self, job: &Job) -> Result<()> {
        let mut tx = self.store.begin_transaction().await?;
        let outcome = async {
            let dependent_ids = tx.outgoing_ids(job.id).await?;
            if !dependent_ids.is_empty() {
                let close_state = if job.state == JobState::Running {
                    JobState::Failed
                } else {
                    JobState::Canceled
                };
                let dependents = tx.fetch_many(&dependent_ids).await?;
                let mut visited: HashSet<JobId> = HashSet::from([job.id]);
                for dependent in dependents {
                    if !state::is_final(dependent.state) {
                        self.manager
                            .close_cascade(tx.as_mut(), dependent, close_state, &mut visited)
                            .await?;
                    }
                }
            }

            tx.delete_dependencies_of(job.id).await?;
            tx.delete_retry_jobs_of(job.id).await?;
            tx.delete_related_of(job.id).await?;
            tx.delete_job(job.id).await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }
}
