//! Store backend conformance and concurrency tests.
//!
//! The embedded backend always runs. Redis and Postgres run only when
//! `TEST_REDIS_URL` / `TEST_DATABASE_URL` point at a live server.

use std::sync::Arc;

use chrono::Utc;
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use scrobble_core::{
    storage::{EmbeddedStore, PostgresStore, RedisStore},
    QueuedScrobbleEvent, Store, User,
};
use scrobble_testing::{exercise_store, PlaybackEventBuilder, UserBuilder};

#[tokio::test]
async fn embedded_store_conforms() {
    let store = EmbeddedStore::open_in_memory().unwrap();
    exercise_store(&store).await.unwrap();
}

#[tokio::test]
async fn embedded_file_store_conforms() {
    let dir = tempfile::tempdir().unwrap();
    let store = EmbeddedStore::open(dir.path().join("relay.db")).unwrap();
    exercise_store(&store).await.unwrap();
}

#[tokio::test]
async fn redis_store_conforms() {
    let Ok(url) = std::env::var("TEST_REDIS_URL") else {
        eprintln!("TEST_REDIS_URL not set, skipping");
        return;
    };
    let prefix = format!("scrobble-test-{}", uuid::Uuid::new_v4().simple());
    let store = RedisStore::connect_with_prefix(&url, &prefix).await.unwrap();
    exercise_store(&store).await.unwrap();
}

#[tokio::test]
async fn postgres_store_conforms() {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let store = PostgresStore::connect(&url, 5).await.unwrap();
    store.migrate().await.unwrap();
    exercise_store(&store).await.unwrap();
    store.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_queue_index_survives_concurrent_delete_and_enqueue() {
    let Ok(url) = std::env::var("TEST_REDIS_URL") else {
        eprintln!("TEST_REDIS_URL not set, skipping");
        return;
    };
    let prefix = format!("scrobble-test-{}", uuid::Uuid::new_v4().simple());
    let store: Arc<dyn Store> =
        Arc::new(RedisStore::connect_with_prefix(&url, &prefix).await.unwrap());
    let owner = UserBuilder::new("ivan", Utc::now()).build();

    for round in 0..50 {
        let event = PlaybackEventBuilder::for_user(&owner, Utc::now())
            .rating_key(format!("old-{round}"))
            .build();
        let old = QueuedScrobbleEvent::new(owner.id, event, None, "HTTP 503", Utc::now());
        store.enqueue_scrobble(&old).await.unwrap();

        let event = PlaybackEventBuilder::for_user(&owner, Utc::now())
            .rating_key(format!("new-{round}"))
            .build();
        let new = QueuedScrobbleEvent::new(owner.id, event, None, "HTTP 503", Utc::now());

        let deleter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.delete_queued_scrobble(&old.id).await })
        };
        let enqueuer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.enqueue_scrobble(&new).await })
        };
        assert!(deleter.await.unwrap().unwrap());
        enqueuer.await.unwrap().unwrap();

        let listed = store.list_users_with_queued_events().await.unwrap().contains(&owner.id);
        assert_eq!(store.get_queue_size(&owner.id).await.unwrap(), 1, "round {round}");
        assert!(listed, "owner with a pending entry dropped from the index in round {round}");

        store.purge_queue_for_user(&owner.id).await.unwrap();
    }
}

#[tokio::test]
async fn redis_connection_failure_is_unavailable() {
    let err = RedisStore::connect("redis://127.0.0.1:1").await.unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_and_reads_never_observe_torn_users() {
    let store: Arc<dyn Store> = Arc::new(EmbeddedStore::open_in_memory().unwrap());
    let base = UserBuilder::new("alice", Utc::now()).build();
    store.write_user(&base).await.unwrap();

    let versions: Vec<User> = (0..16)
        .map(|i| {
            let mut user = base.clone();
            user.rotate_tokens(format!("access-{i}"), format!("refresh-{i}"), Utc::now());
            user
        })
        .collect();

    let mut handles = Vec::new();
    for version in versions.clone() {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move { store.write_user(&version).await }));
    }
    for _ in 0..16 {
        let store = Arc::clone(&store);
        let id = base.id;
        handles.push(tokio::spawn(async move { store.get_user(&id).await.map(|_| ()) }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let last = store.get_user(&base.id).await.unwrap().unwrap();
    assert!(versions.contains(&last), "final state is not one of the writes");
    let suffix = last.access_token.trim_start_matches("access-");
    assert_eq!(last.refresh_token, format!("refresh-{suffix}"), "token pair torn");
    assert_eq!(store.list_users().await.unwrap().len(), 1);
}

#[tokio::test]
async fn sequential_writes_last_write_wins() {
    let store = EmbeddedStore::open_in_memory().unwrap();
    let mut user = UserBuilder::new("bob", Utc::now()).build();
    for i in 0..5 {
        user.rotate_tokens(format!("access-{i}"), format!("refresh-{i}"), Utc::now());
        store.write_user(&user).await.unwrap();
    }
    let stored = store.get_user(&user.id).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "access-4");
}

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 32, fork: false, ..ProptestConfig::default() }
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Dequeue returns entries in enqueue order and deleted entries never come back.
    #[test]
    fn queue_preserves_enqueue_order(count in 1usize..20, deletions in prop::collection::vec(any::<prop::sample::Index>(), 0..5)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = EmbeddedStore::open_in_memory().unwrap();
            let owner = UserBuilder::new("dave", Utc::now()).build();

            let mut expected = Vec::new();
            for i in 0..count {
                let event = PlaybackEventBuilder::for_user(&owner, Utc::now())
                    .rating_key(format!("k{i}"))
                    .build();
                let entry = QueuedScrobbleEvent::new(owner.id, event, None, "HTTP 503", Utc::now());
                store.enqueue_scrobble(&entry).await.unwrap();
                expected.push(entry.id);
            }

            for index in deletions {
                if expected.is_empty() {
                    break;
                }
                let id = expected.remove(index.index(expected.len()));
                assert!(store.delete_queued_scrobble(&id).await.unwrap());
            }

            let dequeued: Vec<_> = store
                .dequeue_scrobbles(&owner.id, count)
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.id)
                .collect();
            assert_eq!(dequeued, expected);
        });
    }
}
