// Retry scheduling

use crate::domain::Job;
use crate::port::TimeProvider;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_RETRY_BASE_DELAY_MS: i64 = 5_000;

/// Computes when the next retry attempt of a failed job may run.
pub trait RetryScheduler: Send + Sync {
    /// `attempt` is the number of retry jobs already created for the
    /// original; the first retry is attempt 0.
    fn schedule_next_retry(&self, job: &Job, attempt: u32) -> i64;
}

/// Doubling backoff: `now + base_delay * 2^attempt`. No jitter, so the
/// result is a pure function of (now, attempt, base_delay).
pub struct ExponentialRetryScheduler {
    time_provider: Arc<dyn TimeProvider>,
    base_delay_ms: i64,
}

impl ExponentialRetryScheduler {
    pub fn new(time_provider: Arc<dyn TimeProvider>, base_delay_ms: i64) -> Self {
        Self {
            time_provider,
            base_delay_ms,
        }
    }
}

impl RetryScheduler for ExponentialRetryScheduler {
    fn schedule_next_retry(&self, job: &Job, attempt: u32) -> i64 {
        let factor = 1_i64.checked_shl(attempt).unwrap_or(i64::MAX);
        let delay_ms = self.base_delay_ms.saturating_mul(factor);
        let next = self.time_provider.now_millis().saturating_add(delay_ms);

        info!(
            job_id = %job.id,
            attempt = attempt,
            delay_ms = delay_ms,
            "scheduling retry"
        );

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, JobState, DEFAULT_QUEUE};
    use crate::port::ManualTimeProvider;

    fn test_job() -> Job {
        Job {
            id: JobId(1),
            command: "flaky".to_string(),
            args: vec![],
            state: JobState::Running,
            queue: DEFAULT_QUEUE.to_string(),
            priority: 0,
            created_at: 0,
            execute_after: 0,
            started_at: None,
            checked_at: None,
            closed_at: None,
            max_runtime_ms: 0,
            worker_name: None,
            output: None,
            error_output: None,
            exit_code: None,
            is_retry_job: false,
            original_job_id: None,
            max_retries: 3,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let clock = Arc::new(ManualTimeProvider::new(100_000));
        let scheduler = ExponentialRetryScheduler::new(clock, 5_000);
        let job = test_job();

        assert_eq!(scheduler.schedule_next_retry(&job, 0), 105_000);
        assert_eq!(scheduler.schedule_next_retry(&job, 1), 110_000);
        assert_eq!(scheduler.schedule_next_retry(&job, 2), 120_000);
        assert_eq!(scheduler.schedule_next_retry(&job, 3), 140_000);
    }

    #[test]
    fn deterministic_for_fixed_inputs() {
        let clock = Arc::new(ManualTimeProvider::new(42));
        let scheduler = ExponentialRetryScheduler::new(clock, 1_000);
        let job = test_job();

        assert_eq!(
            scheduler.schedule_next_retry(&job, 4),
            scheduler.schedule_next_retry(&job, 4)
        );
    }

    #[test]
    fn huge_attempt_counts_saturate_instead_of_overflowing() {
        let clock = Arc::new(ManualTimeProvider::new(0));
        let scheduler = ExponentialRetryScheduler::new(clock, 5_000);
        let job = test_job();

        assert_eq!(scheduler.schedule_next_retry(&job, 200), i64::MAX);
    }
}
