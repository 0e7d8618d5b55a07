// Invocation lookup and concurrent deduplication

use conveyor_core::domain::JobState;
use conveyor_integration_tests::context;
use tokio::task::JoinSet;

#[tokio::test]
async fn find_matches_on_exact_invocation() {
    let ctx = context().await;

    let first = ctx
        .manager
        .submit("sync", vec!["users".to_string()], Default::default())
        .await
        .unwrap();
    ctx.manager
        .submit("sync", vec!["users".to_string()], Default::default())
        .await
        .unwrap();

    let found = ctx
        .manager
        .find("sync", &["users".to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.id);

    assert!(ctx
        .manager
        .find("sync", &["accounts".to_string()])
        .await
        .unwrap()
        .is_none());
    assert!(ctx.manager.find("sync", &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn get_or_create_creates_once() {
    let ctx = context().await;

    let created = ctx
        .manager
        .get_or_create("reindex", vec!["all".to_string()])
        .await
        .unwrap();
    assert_eq!(created.state, JobState::Pending);

    let reused = ctx
        .manager
        .get_or_create("reindex", vec!["all".to_string()])
        .await
        .unwrap();
    assert_eq!(reused.id, created.id);

    // The loser's speculative row is gone: one claimable job.
    ctx.clock.advance(1);
    assert_eq!(ctx.manager.available_count("default").await.unwrap(), 1);
}

#[tokio::test]
async fn get_or_create_under_contention_elects_one_job() {
    let ctx = context().await;

    let mut tasks = JoinSet::new();
    for _ in 0..4 {
        let manager = ctx.manager.clone();
        tasks.spawn(async move { manager.get_or_create("burst", vec![]).await.unwrap() });
    }

    let mut ids = Vec::new();
    while let Some(result) = tasks.join_next().await {
        ids.push(result.unwrap().id);
    }

    ids.dedup();
    assert_eq!(ids.len(), 1, "all callers must adopt the same job");

    let winner = ctx.manager.get(ids[0]).await.unwrap();
    assert_eq!(winner.state, JobState::Pending);

    ctx.clock.advance(1);
    assert_eq!(ctx.manager.available_count("default").await.unwrap(), 1);
}

#[tokio::test]
async fn distinct_invocations_do_not_collide() {
    let ctx = context().await;

    let a = ctx
        .manager
        .get_or_create("export", vec!["csv".to_string()])
        .await
        .unwrap();
    let b = ctx
        .manager
        .get_or_create("export", vec!["json".to_string()])
        .await
        .unwrap();

    assert_ne!(a.id, b.id);
}
