// Job state classification
//
// Free functions over the Job record rather than methods, so the rules can
// be read in one place and used from both the manager and the store layer.

use super::job::{Job, JobState};

/// States a job never leaves.
pub const FINAL_STATES: [JobState; 5] = [
    JobState::Finished,
    JobState::Failed,
    JobState::Terminated,
    JobState::Incomplete,
    JobState::Canceled,
];

/// Final states other than [`JobState::Finished`].
pub const CLOSED_NON_SUCCESSFUL_STATES: [JobState; 4] = [
    JobState::Failed,
    JobState::Terminated,
    JobState::Incomplete,
    JobState::Canceled,
];

pub fn is_final(state: JobState) -> bool {
    matches!(
        state,
        JobState::Finished
            | JobState::Failed
            | JobState::Terminated
            | JobState::Incomplete
            | JobState::Canceled
    )
}

pub fn is_closed_non_successful(state: JobState) -> bool {
    is_final(state) && state != JobState::Finished
}

/// A job may be handed to a worker once it is PENDING and every job it
/// depends on has finished successfully.
pub fn is_startable(job: &Job, prerequisites: &[Job]) -> bool {
    job.state == JobState::Pending
        && prerequisites.iter().all(|p| p.state == JobState::Finished)
}
