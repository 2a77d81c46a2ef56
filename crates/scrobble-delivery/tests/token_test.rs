//! Token staleness boundary and refresh serialization.

use std::time::Duration;

use futures::future::join_all;
use scrobble_core::{Clock, Store};
use scrobble_delivery::DeliveryError;
use scrobble_testing::{TestEnv, UserBuilder};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

#[tokio::test]
async fn token_younger_than_threshold_is_used_as_is() {
    let env = TestEnv::new().unwrap();
    let user = env.insert_user(UserBuilder::new("alice", env.clock.now_utc()).build()).await.unwrap();
    env.clock.advance(Duration::from_secs(22 * HOUR + 59 * MINUTE));

    let lease = env.engine().tokens().lease(&user.id).await.unwrap().unwrap();

    assert_eq!(lease.user.access_token, "access-alice");
    assert_eq!(env.api.refresh_calls(), 0);
}

#[tokio::test]
async fn token_just_past_threshold_is_refreshed() {
    let env = TestEnv::new().unwrap();
    let user = env.insert_user(UserBuilder::new("alice", env.clock.now_utc()).build()).await.unwrap();
    env.clock.advance(Duration::from_secs(23 * HOUR + 1));

    let lease = env.engine().tokens().lease(&user.id).await.unwrap().unwrap();

    assert_eq!(lease.user.access_token, "refreshed-access-1");
    assert_eq!(lease.user.refresh_token, "refresh-alice-1");
    assert_eq!(lease.user.updated, env.clock.now_utc());
    assert_eq!(env.api.refresh_calls(), 1);
}

#[tokio::test]
async fn token_exactly_at_threshold_is_still_fresh() {
    let env = TestEnv::new().unwrap();
    let user = env.insert_user(UserBuilder::new("alice", env.clock.now_utc()).build()).await.unwrap();
    env.clock.advance(Duration::from_secs(23 * HOUR));

    env.engine().tokens().lease(&user.id).await.unwrap().unwrap();

    assert_eq!(env.api.refresh_calls(), 0);
}

#[tokio::test]
async fn concurrent_leases_refresh_once() {
    let env = TestEnv::new().unwrap();
    let user = env.insert_user(UserBuilder::new("alice", env.clock.now_utc()).build()).await.unwrap();
    env.clock.advance(Duration::from_secs(24 * HOUR));
    let engine = env.engine();

    let tokens = join_all((0..4).map(|_| async {
        let lease = engine.tokens().lease(&user.id).await.unwrap().unwrap();
        lease.user.access_token.clone()
    }))
    .await;

    assert_eq!(env.api.refresh_calls(), 1);
    assert!(tokens.iter().all(|t| t == "refreshed-access-1"));
}

#[tokio::test]
async fn refresh_failure_deletes_user() {
    let env = TestEnv::new().unwrap();
    let user = env.insert_user(UserBuilder::new("alice", env.clock.now_utc()).build()).await.unwrap();
    env.clock.advance(Duration::from_secs(24 * HOUR));
    env.api.fail_refresh(400);

    let err = env.engine().tokens().lease(&user.id).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Unauthorized { .. }));
    assert!(env.store.get_user(&user.id).await.unwrap().is_none());
}

#[tokio::test]
async fn lease_of_unknown_user_is_none() {
    let env = TestEnv::new().unwrap();
    let ghost = UserBuilder::new("ghost", env.clock.now_utc()).build();

    assert!(env.engine().tokens().lease(&ghost.id).await.unwrap().is_none());
}
