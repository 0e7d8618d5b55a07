// Job Domain Model

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Queue a job lands on when the submitter does not pick one.
pub const DEFAULT_QUEUE: &str = "default";

/// Job identifier, assigned by the store on first persist.
///
/// Identifiers are monotonically increasing, which makes `ORDER BY id` a
/// submission-order tiebreak and lets deduplication elect the oldest row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    New,
    Pending,
    Running,
    Finished,
    Failed,
    Terminated,
    Incomplete,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
            JobState::Terminated => "TERMINATED",
            JobState::Incomplete => "INCOMPLETE",
            JobState::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(JobState::New),
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "FINISHED" => Ok(JobState::Finished),
            "FAILED" => Ok(JobState::Failed),
            "TERMINATED" => Ok(JobState::Terminated),
            "INCOMPLETE" => Ok(JobState::Incomplete),
            "CANCELED" => Ok(JobState::Canceled),
            other => Err(AppError::Serialization(format!(
                "unknown job state '{other}'"
            ))),
        }
    }
}

/// A persisted command invocation.
///
/// Instances are short-lived views of a database row. A view is stale once
/// another transaction commits; re-fetch instead of holding on to it.
///
/// Timestamps are epoch milliseconds. `max_runtime_ms == 0` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub args: Vec<String>,
    pub state: JobState,
    pub queue: String,
    /// Lower value wins; ties break on id (submission order).
    pub priority: i32,
    pub created_at: i64,
    /// Earliest instant the job may be handed to a worker.
    pub execute_after: i64,
    pub started_at: Option<i64>,
    /// Last worker heartbeat; drives stale-running detection.
    pub checked_at: Option<i64>,
    pub closed_at: Option<i64>,
    pub max_runtime_ms: i64,
    /// Set by the atomic claim; `None` means unclaimed.
    pub worker_name: Option<String>,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i32>,
    pub is_retry_job: bool,
    /// Set iff `is_retry_job`. Retry chains do not nest: the original of a
    /// retry job is never itself a retry job.
    pub original_job_id: Option<JobId>,
    pub max_retries: i32,
}

/// Field set for a job that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub command: String,
    pub args: Vec<String>,
    pub state: JobState,
    pub queue: String,
    pub priority: i32,
    pub created_at: i64,
    pub execute_after: i64,
    pub max_runtime_ms: i64,
    pub max_retries: i32,
    pub is_retry_job: bool,
    pub original_job_id: Option<JobId>,
}
