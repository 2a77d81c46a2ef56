//! Single-user delivery paths: success, dedup, classification, coalescing.

use std::time::Duration;

use futures::future::join_all;
use scrobble_core::{Clock, PlaybackAction, Store};
use scrobble_delivery::{DeliveryError, DeliveryOutcome};
use scrobble_testing::{PlaybackEventBuilder, TestEnv, UserBuilder};

async fn env_with_user() -> (TestEnv, scrobble_core::User) {
    let env = TestEnv::new().unwrap();
    let user = env.insert_user(UserBuilder::new("alice", env.clock.now_utc()).build()).await.unwrap();
    (env, user)
}

#[tokio::test]
async fn successful_delivery_is_cached() {
    let (env, user) = env_with_user().await;
    let engine = env.engine();
    let event = PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).build();

    let outcome = engine.handle_event(event.clone()).await.unwrap();

    assert!(matches!(outcome, DeliveryOutcome::Delivered { status_code: 201 }));
    assert_eq!(env.api.scrobble_calls_for("access-alice"), 1);
    let cached = env.store.get_scrobble_body("player-1", "1001").await.unwrap().unwrap();
    assert_eq!(cached.action, PlaybackAction::Start);
    assert_eq!(engine.stats().await.delivered, 1);
}

#[tokio::test]
async fn repeated_event_is_suppressed() {
    let (env, user) = env_with_user().await;
    let engine = env.engine();
    let event = PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).progress(40.0).build();

    engine.handle_event(event.clone()).await.unwrap();
    let repeat = PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).progress(40.3).build();
    let outcome = engine.handle_event(repeat).await.unwrap();

    assert!(matches!(outcome, DeliveryOutcome::Duplicate));
    assert_eq!(env.api.scrobble_calls(), 1);
    assert_eq!(engine.stats().await.duplicates, 1);
}

#[tokio::test]
async fn changed_action_or_progress_is_forwarded() {
    let (env, user) = env_with_user().await;
    let engine = env.engine();
    let builder = || PlaybackEventBuilder::for_user(&user, env.clock.now_utc());

    engine.handle_event(builder().progress(10.0).build()).await.unwrap();
    let moved = engine.handle_event(builder().progress(11.0).build()).await.unwrap();
    let paused = engine
        .handle_event(builder().progress(11.0).action(PlaybackAction::Pause).build())
        .await
        .unwrap();

    assert!(matches!(moved, DeliveryOutcome::Delivered { .. }));
    assert!(matches!(paused, DeliveryOutcome::Delivered { .. }));
    assert_eq!(env.api.scrobble_calls(), 3);
}

#[tokio::test]
async fn dedup_expires_after_window() {
    let (env, user) = env_with_user().await;
    let engine = env.engine();

    engine.handle_event(PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).build()).await.unwrap();
    env.clock.advance(Duration::from_secs(3 * 60 * 60 + 1));
    let outcome = engine
        .handle_event(PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).build())
        .await
        .unwrap();

    assert!(matches!(outcome, DeliveryOutcome::Delivered { .. }));
    assert_eq!(env.api.scrobble_calls(), 2);
}

#[tokio::test]
async fn retryable_failure_is_queued() {
    for status in [429, 502, 503, 504] {
        let (env, user) = env_with_user().await;
        env.api.script_scrobbles("access-alice", &[status]);
        let event = PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).build();

        let outcome = env.engine().handle_event(event.clone()).await.unwrap();

        let DeliveryOutcome::Queued { entry_id, error } = outcome else {
            panic!("status {status} was not queued");
        };
        assert_eq!(error.status(), Some(status));

        let queued = env.store.dequeue_scrobbles(&user.id, 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, entry_id);
        assert_eq!(queued[0].retry_count, 0);
        assert_eq!(queued[0].payload.event, event);
        assert!(queued[0].payload.member.is_none());
    }
}

#[tokio::test]
async fn network_failure_is_queued() {
    let (env, user) = env_with_user().await;
    env.api.script_network_error("access-alice");

    let outcome = env
        .engine()
        .handle_event(PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).build())
        .await
        .unwrap();

    assert!(matches!(outcome, DeliveryOutcome::Queued { .. }));
    assert_eq!(env.store.get_queue_size(&user.id).await.unwrap(), 1);
}

#[tokio::test]
async fn fatal_statuses_never_enqueue() {
    for status in [400, 401, 404, 409, 422, 500] {
        let (env, user) = env_with_user().await;
        env.api.script_scrobbles("access-alice", &[status]);
        let engine = env.engine();

        let outcome = engine
            .handle_event(PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).build())
            .await
            .unwrap();

        assert!(matches!(outcome, DeliveryOutcome::Dropped { .. }), "status {status} not dropped");
        assert_eq!(env.store.get_queue_size(&user.id).await.unwrap(), 0);
        assert_eq!(engine.stats().await.dropped, 1);
        assert!(env.store.get_scrobble_body("player-1", "1001").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn unknown_user_is_an_error() {
    let env = TestEnv::new().unwrap();
    let ghost = UserBuilder::new("ghost", env.clock.now_utc()).build();

    let err = env
        .engine()
        .handle_event(PlaybackEventBuilder::for_user(&ghost, env.clock.now_utc()).build())
        .await
        .unwrap_err();

    assert!(matches!(err, DeliveryError::UnknownUser { .. }));
    assert_eq!(env.api.scrobble_calls(), 0);
}

#[tokio::test]
async fn other_accounts_are_ignored() {
    let (env, user) = env_with_user().await;

    let outcome = env
        .engine()
        .handle_event(PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).account("bob").build())
        .await
        .unwrap();

    assert!(matches!(outcome, DeliveryOutcome::Ignored { .. }));
    assert_eq!(env.api.scrobble_calls(), 0);
}

#[tokio::test]
async fn account_match_ignores_case() {
    let (env, user) = env_with_user().await;

    let outcome = env
        .engine()
        .handle_event(PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).account(" Alice").build())
        .await
        .unwrap();

    assert!(matches!(outcome, DeliveryOutcome::Delivered { .. }));
}

#[tokio::test]
async fn stale_token_is_refreshed_before_delivery() {
    let env = TestEnv::new().unwrap();
    let issued = env.clock.now_utc();
    let user = env.insert_user(UserBuilder::new("alice", issued).build()).await.unwrap();
    env.clock.advance(Duration::from_secs(24 * 60 * 60));

    env.engine()
        .handle_event(PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).build())
        .await
        .unwrap();

    assert_eq!(env.api.refresh_calls(), 1);
    assert_eq!(env.api.scrobble_calls_for("refreshed-access-1"), 1);
    let stored = env.store.get_user(&user.id).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "refreshed-access-1");
    assert_eq!(stored.updated, env.clock.now_utc());
}

#[tokio::test]
async fn failed_refresh_removes_user() {
    let env = TestEnv::new().unwrap();
    let user = env.insert_user(UserBuilder::new("alice", env.clock.now_utc()).build()).await.unwrap();
    env.clock.advance(Duration::from_secs(24 * 60 * 60));
    env.api.fail_refresh(401);
    let engine = env.engine();

    let err = engine
        .handle_event(PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).build())
        .await
        .unwrap_err();

    assert!(matches!(err, DeliveryError::Unauthorized { .. }));
    assert!(env.store.get_user(&user.id).await.unwrap().is_none());
    assert!(env.store.get_user_by_name("alice").await.unwrap().is_none());
    assert_eq!(env.api.scrobble_calls(), 0);
    assert_eq!(engine.stats().await.unauthorized, 1);
}

#[tokio::test]
async fn concurrent_identical_events_share_one_execution() {
    let (env, user) = env_with_user().await;
    env.api.set_scrobble_delay(Duration::from_millis(50));
    let engine = env.engine();
    let event = PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).build();

    let results = join_all((0..5).map(|_| engine.handle_event(event.clone()))).await;

    assert_eq!(env.api.scrobble_calls(), 1);
    assert_eq!(results.len(), 5);
    for result in results {
        assert!(matches!(result.unwrap(), DeliveryOutcome::Delivered { status_code: 201 }));
    }
}

#[tokio::test]
async fn coalescing_can_be_disabled() {
    let (env, user) = env_with_user().await;
    env.api.set_scrobble_delay(Duration::from_millis(20));
    let engine = env.engine_with(scrobble_delivery::DeliveryConfig {
        coalesce: false,
        ..Default::default()
    });
    let event = PlaybackEventBuilder::for_user(&user, env.clock.now_utc()).build();

    let results = join_all((0..3).map(|_| engine.handle_event(event.clone()))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(env.api.scrobble_calls(), 3);
}
