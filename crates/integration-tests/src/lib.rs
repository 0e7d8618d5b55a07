// Shared fixtures for end-to-end tests

use conveyor_core::application::{ExponentialRetryScheduler, JobManager, SubmitOptions};
use conveyor_core::domain::{Job, JobId};
use conveyor_core::port::{EventDispatcher, ListenerDispatcher, ManualTimeProvider, TimeProvider};
use conveyor_infra_sqlite::{create_pool, run_migrations, SqliteJobStore};
use std::sync::Arc;

/// Fixed test epoch; the manual clock starts here.
pub const START_MS: i64 = 1_000_000;

pub struct TestContext {
    pub store: Arc<SqliteJobStore>,
    pub manager: Arc<JobManager>,
    pub clock: Arc<ManualTimeProvider>,
}

pub async fn context() -> TestContext {
    context_with_events(Arc::new(ListenerDispatcher::new())).await
}

pub async fn context_with_events(events: Arc<dyn EventDispatcher>) -> TestContext {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();

    let clock = Arc::new(ManualTimeProvider::new(START_MS));
    let time_provider: Arc<dyn TimeProvider> = clock.clone();
    let store = Arc::new(SqliteJobStore::new(pool));
    let manager = Arc::new(JobManager::new(
        store.clone(),
        Arc::new(ExponentialRetryScheduler::new(time_provider.clone(), 5_000)),
        events,
        time_provider,
    ));

    TestContext {
        store,
        manager,
        clock,
    }
}

impl TestContext {
    /// Submit a job with default options.
    pub async fn submit(&self, command: &str) -> Job {
        self.manager
            .submit(command, vec![], SubmitOptions::default())
            .await
            .unwrap()
    }

    /// Submit a job depending on the given prerequisites.
    pub async fn submit_depending(&self, command: &str, dependencies: Vec<JobId>) -> Job {
        self.manager
            .submit(
                command,
                vec![],
                SubmitOptions {
                    dependencies,
                    ..SubmitOptions::default()
                },
            )
            .await
            .unwrap()
    }

    /// Advance past `execute_after` and claim the next job for `worker`.
    pub async fn claim(&self, worker: &str) -> Option<Job> {
        self.clock.advance(1);
        let mut excluded = Vec::new();
        self.manager
            .claim_next(worker, &mut excluded, &[], &[])
            .await
            .unwrap()
    }
}
