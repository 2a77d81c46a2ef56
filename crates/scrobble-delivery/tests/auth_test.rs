//! Authorization completion: create, renew, and state validation.

use std::time::Duration;

use scrobble_core::{Clock, GroupMember, Store, MAX_DISPLAY_NAME_CHARS};
use scrobble_delivery::{AuthMode, DeliveryError, MultipleLock};
use scrobble_testing::{TestEnv, UserBuilder};

#[tokio::test]
async fn first_authorization_creates_user() {
    let env = TestEnv::new().unwrap();
    env.api.set_display_name("Alice Liddell");
    let auth = env.authorizer();

    let state = auth.begin(AuthMode::First, " Alice ", None).await;
    let user = auth.complete(&state, "code-1").await.unwrap();

    assert_eq!(user.username, "alice");
    assert_eq!(user.access_token, "access-code-1");
    assert_eq!(user.refresh_token, "refresh-code-1");
    assert_eq!(user.display_name.as_deref(), Some("Alice Liddell"));
    assert_eq!(user.updated, env.clock.now_utc());
    assert_eq!(env.store.get_user(&user.id).await.unwrap(), Some(user.clone()));
    assert_eq!(env.store.get_user_by_name("alice").await.unwrap().map(|u| u.id), Some(user.id));
}

#[tokio::test]
async fn state_token_is_single_use() {
    let env = TestEnv::new().unwrap();
    let auth = env.authorizer();

    let state = auth.begin(AuthMode::First, "alice", None).await;
    auth.complete(&state, "code-1").await.unwrap();
    let err = auth.complete(&state, "code-2").await.unwrap_err();

    assert!(matches!(err, DeliveryError::InvalidAuthState { .. }));
    assert_eq!(env.api.exchange_calls(), 1);
}

#[tokio::test]
async fn expired_state_is_rejected_before_exchange() {
    let env = TestEnv::new().unwrap();
    let auth = env.authorizer();

    let state = auth.begin(AuthMode::First, "alice", None).await;
    env.clock.advance(Duration::from_secs(15 * 60));
    let err = auth.complete(&state, "code-1").await.unwrap_err();

    assert!(matches!(err, DeliveryError::InvalidAuthState { .. }));
    assert_eq!(env.api.exchange_calls(), 0);
}

#[tokio::test]
async fn renewal_by_username_keeps_identity_and_members() {
    let env = TestEnv::new().unwrap();
    let start = env.clock.now_utc();
    let member = env.insert_user(UserBuilder::new("bob", start).build()).await.unwrap();
    let existing = env
        .insert_user(UserBuilder::new("alice", start).member("bob", member.id).build())
        .await
        .unwrap();
    env.clock.advance(Duration::from_secs(3600));
    let auth = env.authorizer();

    let state = auth.begin(AuthMode::Renew, "ALICE", None).await;
    let renewed = auth.complete(&state, "code-9").await.unwrap();

    assert_eq!(renewed.id, existing.id);
    assert_eq!(renewed.access_token, "access-code-9");
    assert_eq!(renewed.group_members, existing.group_members);
    assert_eq!(renewed.updated, env.clock.now_utc());
    assert_eq!(env.store.list_users().await.unwrap().len(), 2);
}

#[tokio::test]
async fn renewal_prefers_selected_user() {
    let env = TestEnv::new().unwrap();
    let now = env.clock.now_utc();
    let older = env.insert_user(UserBuilder::new("alice", now).build()).await.unwrap();
    env.insert_user(UserBuilder::new("alice", now).build()).await.unwrap();
    let auth = env.authorizer();

    let state = auth.begin(AuthMode::Renew, "alice", Some(older.id)).await;
    let renewed = auth.complete(&state, "code-3").await.unwrap();

    assert_eq!(renewed.id, older.id);
}

#[tokio::test]
async fn renewal_without_existing_user_creates_one() {
    let env = TestEnv::new().unwrap();
    let auth = env.authorizer();

    let state = auth.begin(AuthMode::Renew, "newcomer", None).await;
    let user = auth.complete(&state, "code-4").await.unwrap();

    assert_eq!(env.store.get_user(&user.id).await.unwrap().map(|u| u.username), Some("newcomer".into()));
}

#[tokio::test]
async fn display_name_failure_is_not_fatal() {
    let env = TestEnv::new().unwrap();
    env.api.fail_display_name();
    let auth = env.authorizer();

    let state = auth.begin(AuthMode::First, "alice", None).await;
    let user = auth.complete(&state, "code-1").await.unwrap();

    assert!(user.display_name.is_none());
    assert!(env.store.get_user(&user.id).await.unwrap().is_some());
}

#[tokio::test]
async fn long_display_name_is_truncated_and_flagged() {
    let env = TestEnv::new().unwrap();
    env.api.set_display_name("x".repeat(MAX_DISPLAY_NAME_CHARS + 10));
    let auth = env.authorizer();

    let state = auth.begin(AuthMode::First, "alice", None).await;
    let user = auth.complete(&state, "code-1").await.unwrap();

    assert_eq!(user.display_name.unwrap().chars().count(), MAX_DISPLAY_NAME_CHARS);
    assert!(user.display_name_truncated);
}

#[tokio::test]
async fn renewal_keeps_members_added_while_waiting_for_the_lock() {
    let env = TestEnv::new().unwrap();
    let start = env.clock.now_utc();
    let member = env.insert_user(UserBuilder::new("bob", start).build()).await.unwrap();
    let existing = env.insert_user(UserBuilder::new("alice", start).build()).await.unwrap();
    let auth = env.authorizer();
    let state = auth.begin(AuthMode::Renew, "alice", None).await;

    let guard = env.locks.lock(&MultipleLock::lock_key(&existing.username, &existing.id)).await;
    let renewal = {
        let auth = auth.clone();
        tokio::spawn(async move { auth.complete(&state, "code-3").await })
    };
    while env.api.exchange_calls() == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut edited = existing.clone();
    edited.group_members.push(GroupMember::new("bob", member.id));
    env.store.write_user(&edited).await.unwrap();
    drop(guard);

    let renewed = renewal.await.unwrap().unwrap();
    assert_eq!(renewed.access_token, "access-code-3");
    assert_eq!(renewed.group_members, edited.group_members);
    assert_eq!(env.store.get_user(&existing.id).await.unwrap(), Some(renewed));
}
