// Retry creation, original-job propagation, and state-change events

use conveyor_core::application::SubmitOptions;
use conveyor_core::domain::{JobState, JobId};
use conveyor_core::error::AppError;
use conveyor_core::port::{JobStore, ListenerDispatcher, TimeProvider, JOB_STATE_CHANGE};
use conveyor_integration_tests::{context, context_with_events};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn failed_job_with_retries_left_spawns_a_pending_retry() {
    let ctx = context().await;

    let job = ctx
        .manager
        .submit(
            "flaky",
            vec![],
            SubmitOptions {
                max_retries: 2,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();

    let claimed = ctx.claim("w1").await.unwrap();
    let close_time = ctx.clock.now_millis();
    let after_fail = ctx.manager.close(&claimed, JobState::Failed).await.unwrap();

    // The original stays open, observable as awaiting its retry.
    assert_eq!(after_fail.state, JobState::Pending);
    assert!(after_fail.closed_at.is_none());

    let retries = ctx.store.retry_jobs(job.id).await.unwrap();
    assert_eq!(retries.len(), 1);
    let retry = &retries[0];
    assert!(retry.is_retry_job);
    assert_eq!(retry.original_job_id, Some(job.id));
    assert_eq!(retry.state, JobState::Pending);
    assert_eq!(retry.command, "flaky");
    assert_eq!(retry.queue, job.queue);
    assert_eq!(retry.priority, job.priority);
    assert_eq!(retry.execute_after, close_time + 5_000);

    // Not claimable until the backoff elapses.
    assert!(ctx.claim("w1").await.is_none());

    ctx.clock.advance(5_000);
    let claimed_retry = ctx.claim("w1").await.unwrap();
    assert_eq!(claimed_retry.id, retry.id);

    let finished_retry = ctx
        .manager
        .close(&claimed_retry, JobState::Finished)
        .await
        .unwrap();
    assert_eq!(finished_retry.state, JobState::Finished);

    let original = ctx.manager.get(job.id).await.unwrap();
    assert_eq!(original.state, JobState::Finished);
    assert!(original.closed_at.is_some());
}

#[tokio::test]
async fn second_failure_schedules_a_longer_backoff() {
    let ctx = context().await;

    let job = ctx
        .manager
        .submit(
            "flaky",
            vec![],
            SubmitOptions {
                max_retries: 2,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();

    let claimed = ctx.claim("w1").await.unwrap();
    ctx.manager.close(&claimed, JobState::Failed).await.unwrap();

    ctx.clock.advance(5_001);
    let first_retry = ctx.claim("w1").await.unwrap();
    let second_close_time = ctx.clock.now_millis();
    let closed_retry = ctx
        .manager
        .close(&first_retry, JobState::Failed)
        .await
        .unwrap();
    assert_eq!(closed_retry.state, JobState::Failed);
    assert!(closed_retry.closed_at.is_some());

    let retries = ctx.store.retry_jobs(job.id).await.unwrap();
    assert_eq!(retries.len(), 2);
    let second_retry = retries.iter().find(|r| r.id != first_retry.id).unwrap();
    assert_eq!(second_retry.state, JobState::Pending);
    // Second attempt backs off twice as long.
    assert_eq!(second_retry.execute_after, second_close_time + 10_000);

    // Retry count never exceeds max_retries.
    assert!(ctx.store.count_retry_jobs(job.id).await.unwrap() <= i64::from(job.max_retries));

    let original = ctx.manager.get(job.id).await.unwrap();
    assert_eq!(original.state, JobState::Pending);
}

#[tokio::test]
async fn exhausted_retries_close_the_original_and_cancel_dependents() {
    let ctx = context().await;

    let job = ctx
        .manager
        .submit(
            "flaky",
            vec![],
            SubmitOptions {
                max_retries: 1,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();
    let dependent = ctx.submit_depending("dependent", vec![job.id]).await;

    let claimed = ctx.claim("w1").await.unwrap();
    assert_eq!(claimed.id, job.id);
    ctx.manager.close(&claimed, JobState::Failed).await.unwrap();

    ctx.clock.advance(5_001);
    let retry = ctx.claim("w1").await.unwrap();
    assert!(retry.is_retry_job);
    ctx.manager.close(&retry, JobState::Failed).await.unwrap();

    let original = ctx.manager.get(job.id).await.unwrap();
    assert_eq!(original.state, JobState::Failed);
    assert!(original.closed_at.is_some());

    let dependent = ctx.manager.get(dependent.id).await.unwrap();
    assert_eq!(dependent.state, JobState::Canceled);
    assert!(dependent.closed_at.is_some());
}

#[tokio::test]
async fn canceling_a_retry_cancels_the_original() {
    let ctx = context().await;

    let job = ctx
        .manager
        .submit(
            "flaky",
            vec![],
            SubmitOptions {
                max_retries: 3,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();

    let claimed = ctx.claim("w1").await.unwrap();
    ctx.manager.close(&claimed, JobState::Failed).await.unwrap();
    let retries = ctx.store.retry_jobs(job.id).await.unwrap();
    let retry = &retries[0];

    ctx.manager.close(retry, JobState::Canceled).await.unwrap();

    let retry = ctx.manager.get(retry.id).await.unwrap();
    assert_eq!(retry.state, JobState::Canceled);
    let original = ctx.manager.get(job.id).await.unwrap();
    assert_eq!(original.state, JobState::Canceled);
}

#[tokio::test]
async fn events_are_dispatched_for_determining_closes_only() {
    let recorded: Arc<Mutex<Vec<(i64, String, JobState)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    let dispatcher = ListenerDispatcher::new().with_listener(move |channel, event| {
        sink.lock()
            .unwrap()
            .push((event.job.id.0, channel.to_string(), event.new_state));
    });
    let ctx = context_with_events(Arc::new(dispatcher)).await;

    let job = ctx
        .manager
        .submit(
            "flaky",
            vec![],
            SubmitOptions {
                max_retries: 1,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();

    let claimed = ctx.claim("w1").await.unwrap();
    ctx.manager.close(&claimed, JobState::Failed).await.unwrap();

    ctx.clock.advance(5_001);
    let retry = ctx.claim("w1").await.unwrap();
    ctx.manager.close(&retry, JobState::Finished).await.unwrap();

    let events = recorded.lock().unwrap();
    // First failure announces the original; the retry announces itself. The
    // original's final close is determined by the retry child and stays
    // silent.
    let ids_and_states: Vec<(i64, JobState)> =
        events.iter().map(|(id, _, state)| (*id, *state)).collect();
    assert_eq!(
        ids_and_states,
        vec![(job.id.0, JobState::Failed), (retry.id.0, JobState::Finished)]
    );
    assert!(events.iter().all(|(_, channel, _)| channel == JOB_STATE_CHANGE));
}

#[tokio::test]
async fn listeners_may_substitute_the_final_state() {
    let dispatcher = ListenerDispatcher::new().with_listener(|_, event| {
        if event.new_state == JobState::Failed {
            event.new_state = JobState::Terminated;
        }
    });
    let ctx = context_with_events(Arc::new(dispatcher)).await;

    ctx.submit("doomed").await;
    let claimed = ctx.claim("w1").await.unwrap();
    let closed = ctx.manager.close(&claimed, JobState::Failed).await.unwrap();

    assert_eq!(closed.state, JobState::Terminated);
}

#[tokio::test]
async fn substituting_a_non_final_state_rolls_the_close_back() {
    let dispatcher = ListenerDispatcher::new().with_listener(|_, event| {
        event.new_state = JobState::Pending;
    });
    let ctx = context_with_events(Arc::new(dispatcher)).await;

    let job = ctx.submit("doomed").await;
    let claimed = ctx.claim("w1").await.unwrap();
    let err = ctx
        .manager
        .close(&claimed, JobState::Failed)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    // Nothing committed: state unchanged, no retry created.
    let fetched = ctx.manager.get(job.id).await.unwrap();
    assert_eq!(fetched.state, JobState::Pending);
    assert_eq!(ctx.store.count_retry_jobs(job.id).await.unwrap(), 0);
}

#[tokio::test]
async fn retry_jobs_never_nest() {
    let ctx = context().await;

    let job = ctx
        .manager
        .submit(
            "flaky",
            vec![],
            SubmitOptions {
                max_retries: 2,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();

    let claimed = ctx.claim("w1").await.unwrap();
    ctx.manager.close(&claimed, JobState::Failed).await.unwrap();

    ctx.clock.advance(5_001);
    let retry = ctx.claim("w1").await.unwrap();
    ctx.manager.close(&retry, JobState::Failed).await.unwrap();

    // The second retry chains off the original, not off the failed retry.
    assert_eq!(ctx.store.count_retry_jobs(retry.id).await.unwrap(), 0);
    let retries = ctx.store.retry_jobs(job.id).await.unwrap();
    assert_eq!(retries.len(), 2);
    assert!(retries
        .iter()
        .all(|r| r.original_job_id == Some(JobId(job.id.0))));
}
