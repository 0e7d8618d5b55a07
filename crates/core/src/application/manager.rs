// Job Manager - submission, deduplication, claiming, and terminal-state
// cascades over the dependency graph.

use crate::application::graph::DependencyGraph;
use crate::application::retry::RetryScheduler;
use crate::domain::{state, Job, JobId, JobState, NewJob, RelatedEntity, DEFAULT_QUEUE};
use crate::error::{AppError, Result};
use crate::port::{
    EventDispatcher, JobStore, JobStoreTransaction, StateChangeEvent, TimeProvider, Transaction,
    JOB_STATE_CHANGE,
};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options accepted by [`JobManager::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub queue: Option<String>,
    pub priority: i32,
    pub max_retries: i32,
    /// Jobs that must finish before the new job may run.
    pub dependencies: Vec<JobId>,
    pub execute_after: Option<i64>,
    pub max_runtime_ms: i64,
    pub related_entities: Vec<RelatedEntity>,
}

/// Orchestration core of the queue.
///
/// Thread-agnostic: every method runs on the caller and performs synchronous
/// database I/O through the store port. Concurrent workers are serialized by
/// the database, not by in-process locks.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    graph: DependencyGraph,
    retry_scheduler: Arc<dyn RetryScheduler>,
    events: Arc<dyn EventDispatcher>,
    time_provider: Arc<dyn TimeProvider>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        retry_scheduler: Arc<dyn RetryScheduler>,
        events: Arc<dyn EventDispatcher>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let graph = DependencyGraph::new(store.clone());
        Self {
            store,
            graph,
            retry_scheduler,
            events,
            time_provider,
        }
    }

    /// Persist a new PENDING job, its dependency edges, and its related
    /// entities in one transaction.
    pub async fn submit(
        &self,
        command: &str,
        args: Vec<String>,
        opts: SubmitOptions,
    ) -> Result<Job> {
        if command.is_empty() {
            return Err(AppError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }

        let now = self.time_provider.now_millis();
        let new = NewJob {
            command: command.to_string(),
            args,
            state: JobState::Pending,
            queue: opts
                .queue
                .clone()
                .unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            priority: opts.priority,
            created_at: now,
            execute_after: opts.execute_after.unwrap_or(now),
            max_runtime_ms: opts.max_runtime_ms,
            max_retries: opts.max_retries,
            is_retry_job: false,
            original_job_id: None,
        };

        let mut tx = self.store.begin_transaction().await?;
        let outcome = async {
            for dependency in &opts.dependencies {
                if tx.get(*dependency).await?.is_none() {
                    return Err(AppError::NotFound(format!(
                        "dependency job {dependency} does not exist"
                    )));
                }
            }

            let job = tx.insert(&new).await?;
            for dependency in &opts.dependencies {
                tx.insert_dependency(*dependency, job.id).await?;
            }
            for entity in &opts.related_entities {
                tx.insert_related(job.id, entity.class(), &entity.identifier_json())
                    .await?;
            }
            Ok(job)
        }
        .await;

        match outcome {
            Ok(job) => {
                tx.commit().await?;
                info!(job_id = %job.id, command = %job.command, queue = %job.queue, "job submitted");
                Ok(job)
            }
            Err(e) => {
                rollback_logged(tx).await;
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {id} does not exist")))
    }

    /// First job with this exact invocation, oldest first.
    pub async fn find(&self, command: &str, args: &[String]) -> Result<Option<Job>> {
        self.store.find_by_invocation(command, args).await
    }

    /// Return the job for this invocation, creating it if absent.
    ///
    /// Concurrency-safe without a unique index: every caller speculatively
    /// inserts a NEW row, then re-queries oldest-first. The caller whose row
    /// won promotes it to PENDING; everyone else deletes their own row and
    /// adopts the winner. NEW rows are invisible to claiming, so the losers'
    /// rows are never handed to a worker.
    pub async fn get_or_create(&self, command: &str, args: Vec<String>) -> Result<Job> {
        if command.is_empty() {
            return Err(AppError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }

        let now = self.time_provider.now_millis();
        let speculative = NewJob {
            command: command.to_string(),
            args: args.clone(),
            state: JobState::New,
            queue: DEFAULT_QUEUE.to_string(),
            priority: 0,
            created_at: now,
            execute_after: now,
            max_runtime_ms: 0,
            max_retries: 0,
            is_retry_job: false,
            original_job_id: None,
        };
        let inserted = self.store.insert(&speculative).await?;

        let winner = self
            .store
            .find_by_invocation(command, &args)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!(
                    "job {} for command '{command}' vanished during deduplication",
                    inserted.id
                ))
            })?;

        if winner.id == inserted.id {
            let mut job = inserted;
            job.state = JobState::Pending;
            self.store.update(&job).await?;
            debug!(job_id = %job.id, command = %command, "deduplication won, job promoted");
            Ok(job)
        } else {
            self.store.delete(inserted.id).await?;
            debug!(
                job_id = %winner.id,
                discarded_id = %inserted.id,
                command = %command,
                "deduplication lost, adopting existing job"
            );
            Ok(winner)
        }
    }

    /// Next claimable candidate without claiming it.
    pub async fn find_pending(
        &self,
        excluded_ids: &[JobId],
        excluded_queues: &[String],
        restricted_queues: &[String],
    ) -> Result<Option<Job>> {
        let now = self.time_provider.now_millis();
        self.store
            .find_pending(now, excluded_ids, excluded_queues, restricted_queues)
            .await
    }

    /// Claim the next runnable job for `worker_name`.
    ///
    /// Candidates that are not startable or that another worker claims first
    /// are appended to `excluded_ids`, so a caller looping over several claim
    /// attempts does not re-examine them. Reset the list between unrelated
    /// attempts.
    pub async fn claim_next(
        &self,
        worker_name: &str,
        excluded_ids: &mut Vec<JobId>,
        excluded_queues: &[String],
        restricted_queues: &[String],
    ) -> Result<Option<Job>> {
        loop {
            let now = self.time_provider.now_millis();
            let candidate = self
                .store
                .find_pending(now, excluded_ids.as_slice(), excluded_queues, restricted_queues)
                .await?;
            let Some(candidate) = candidate else {
                return Ok(None);
            };

            if self.is_startable(&candidate).await?
                && self.store.claim(candidate.id, worker_name).await? == 1
            {
                let job = self.get(candidate.id).await?;
                info!(job_id = %job.id, worker = %worker_name, "job claimed");
                return Ok(Some(job));
            }

            debug!(job_id = %candidate.id, "claim candidate skipped");
            excluded_ids.push(candidate.id);
        }
    }

    /// PENDING with every dependency finished.
    pub async fn is_startable(&self, job: &Job) -> Result<bool> {
        if job.state != JobState::Pending {
            return Ok(false);
        }
        let prerequisites = self.graph.incoming(job).await?;
        Ok(state::is_startable(job, &prerequisites))
    }

    /// Transition a claimed PENDING job to RUNNING.
    pub async fn start(&self, job: &Job) -> Result<Job> {
        let mut job = self.get(job.id).await?;
        if job.state != JobState::Pending || job.worker_name.is_none() {
            return Err(AppError::InvalidState(format!(
                "job {} cannot start: state {} (worker: {:?})",
                job.id, job.state, job.worker_name
            )));
        }
        let now = self.time_provider.now_millis();
        job.state = JobState::Running;
        job.started_at = Some(now);
        job.checked_at = Some(now);
        self.store.update(&job).await?;
        info!(job_id = %job.id, worker = ?job.worker_name, "job started");
        Ok(job)
    }

    /// Refresh the heartbeat of a RUNNING job so the stale sweep leaves it
    /// alone.
    pub async fn heartbeat(&self, job: &Job) -> Result<Job> {
        let mut job = self.get(job.id).await?;
        if job.state != JobState::Running {
            return Err(AppError::InvalidState(format!(
                "job {} is not running (state {})",
                job.id, job.state
            )));
        }
        job.checked_at = Some(self.time_provider.now_millis());
        self.store.update(&job).await?;
        Ok(job)
    }

    /// Close `job` with a final state and cascade the outcome.
    ///
    /// The whole cascade runs in one transaction: retry creation, original-job
    /// propagation, and dependent cancellation either all commit or none do.
    /// Closing an already-final job is a no-op. The result fields of the
    /// caller's view (`output`, `error_output`, `exit_code`) are persisted
    /// with the close.
    pub async fn close(&self, job: &Job, final_state: JobState) -> Result<Job> {
        if !state::is_final(final_state) {
            return Err(AppError::InvalidState(format!(
                "{final_state} is not a close state"
            )));
        }

        let mut tx = self.store.begin_transaction().await?;
        let outcome = async {
            let mut subject = tx.get(job.id).await?.ok_or_else(|| {
                AppError::NotFound(format!("job {} does not exist", job.id))
            })?;
            subject.output = job.output.clone();
            subject.error_output = job.error_output.clone();
            subject.exit_code = job.exit_code;

            let mut visited = HashSet::new();
            self.close_cascade(tx.as_mut(), subject, final_state, &mut visited)
                .await
        }
        .await;

        match outcome {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                rollback_logged(tx).await;
                return Err(e);
            }
        }
        self.get(job.id).await
    }

    /// One frame of the close recursion. `visited` is keyed by job id and
    /// shared across the whole cascade, so cycles and diamonds are touched at
    /// most once.
    pub(crate) fn close_cascade<'a>(
        &'a self,
        tx: &'a mut dyn JobStoreTransaction,
        job: Job,
        final_state: JobState,
        visited: &'a mut HashSet<JobId>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !visited.insert(job.id) {
                return Ok(());
            }
            if state::is_final(job.state) {
                debug!(job_id = %job.id, state = %job.state, "already closed");
                return Ok(());
            }

            let retry_count = tx.count_retry_jobs(job.id).await?;

            // A job whose outcome is determined by a retry child does not
            // announce the change itself; listeners may substitute the state
            // that is actually applied.
            let mut final_state = final_state;
            if job.is_retry_job || retry_count == 0 {
                let mut event = StateChangeEvent {
                    job: job.clone(),
                    new_state: final_state,
                };
                self.events.dispatch(JOB_STATE_CHANGE, &mut event);
                final_state = event.new_state;
            }

            let now = self.time_provider.now_millis();
            let mut job = job;
            match final_state {
                JobState::Canceled => {
                    job.state = JobState::Canceled;
                    job.closed_at = Some(now);
                    tx.update(&job).await?;
                    info!(job_id = %job.id, "job canceled");

                    if job.is_retry_job {
                        if let Some(original_id) = job.original_job_id {
                            if let Some(original) = tx.get(original_id).await? {
                                self.close_cascade(
                                    &mut *tx,
                                    original,
                                    JobState::Canceled,
                                    &mut *visited,
                                )
                                .await?;
                            }
                        }
                        return Ok(());
                    }

                    let dependent_ids = tx.outgoing_ids(job.id).await?;
                    let dependents = tx.fetch_many(&dependent_ids).await?;
                    for dependent in dependents {
                        self.close_cascade(&mut *tx, dependent, JobState::Canceled, &mut *visited)
                            .await?;
                    }
                }

                JobState::Failed | JobState::Terminated | JobState::Incomplete => {
                    if job.is_retry_job {
                        job.state = final_state;
                        job.closed_at = Some(now);
                        tx.update(&job).await?;
                        if let Some(original_id) = job.original_job_id {
                            if let Some(original) = tx.get(original_id).await? {
                                self.close_cascade(&mut *tx, original, final_state, &mut *visited)
                                    .await?;
                            }
                        }
                        return Ok(());
                    }

                    if retry_count < i64::from(job.max_retries) {
                        // The job stays open, observable as awaiting its
                        // retry; only the retry child is written.
                        let retry = NewJob {
                            command: job.command.clone(),
                            args: job.args.clone(),
                            state: JobState::Pending,
                            queue: job.queue.clone(),
                            priority: job.priority,
                            created_at: now,
                            execute_after: self
                                .retry_scheduler
                                .schedule_next_retry(&job, retry_count as u32),
                            max_runtime_ms: job.max_runtime_ms,
                            max_retries: 0,
                            is_retry_job: true,
                            original_job_id: Some(job.id),
                        };
                        let retry = tx.insert(&retry).await?;
                        tx.update(&job).await?;
                        info!(
                            job_id = %job.id,
                            retry_id = %retry.id,
                            attempt = retry_count + 1,
                            max_retries = job.max_retries,
                            "retry job created"
                        );
                    } else {
                        job.state = final_state;
                        job.closed_at = Some(now);
                        tx.update(&job).await?;
                        warn!(job_id = %job.id, state = %final_state, "job closed without success");

                        let dependent_ids = tx.outgoing_ids(job.id).await?;
                        let dependents = tx.fetch_many(&dependent_ids).await?;
                        for dependent in dependents {
                            if matches!(dependent.state, JobState::Pending | JobState::New) {
                                self.close_cascade(
                                    &mut *tx,
                                    dependent,
                                    JobState::Canceled,
                                    &mut *visited,
                                )
                                .await?;
                            }
                        }
                    }
                }

                JobState::Finished => {
                    if job.is_retry_job {
                        if let Some(original_id) = job.original_job_id {
                            if let Some(mut original) = tx.get(original_id).await? {
                                if !state::is_final(original.state) {
                                    original.state = JobState::Finished;
                                    original.closed_at = Some(now);
                                    tx.update(&original).await?;
                                }
                            }
                        }
                    }
                    job.state = JobState::Finished;
                    job.closed_at = Some(now);
                    tx.update(&job).await?;
                    info!(job_id = %job.id, "job finished");
                }

                other => {
                    return Err(AppError::InvalidState(format!(
                        "{other} is not a valid close state for job {}",
                        job.id
                    )));
                }
            }
            Ok(())
        })
    }

    /// Jobs that must finish before `job` may run.
    pub async fn incoming(&self, job: &Job) -> Result<Vec<Job>> {
        self.graph.incoming(job).await
    }

    /// Jobs waiting on `job`.
    pub async fn outgoing(&self, job: &Job) -> Result<Vec<Job>> {
        self.graph.outgoing(job).await
    }

    pub async fn find_for_related_entity(
        &self,
        command: &str,
        entity: &RelatedEntity,
        states: &[JobState],
    ) -> Result<Option<Job>> {
        self.store
            .find_for_related(command, entity.class(), &entity.identifier_json(), states)
            .await
    }

    pub async fn find_all_for_related_entity(&self, entity: &RelatedEntity) -> Result<Vec<Job>> {
        self.store
            .find_all_for_related(entity.class(), &entity.identifier_json())
            .await
    }

    /// Most recently closed non-successful jobs.
    pub async fn find_last_errored(&self, limit: i64) -> Result<Vec<Job>> {
        self.store.last_errored(limit).await
    }

    pub async fn list_queues(&self) -> Result<Vec<String>> {
        self.store.list_queues().await
    }

    /// Number of jobs in `queue` a worker could claim right now.
    pub async fn available_count(&self, queue: &str) -> Result<i64> {
        let now = self.time_provider.now_millis();
        self.store.available_count(queue, now).await
    }
}

async fn rollback_logged(tx: Box<dyn JobStoreTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "transaction rollback failed");
    }
}
