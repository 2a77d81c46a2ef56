//! Behavioural checks every [`Store`] backend must pass.
//!
//! Usernames carry a random suffix so the suite can run repeatedly against a
//! shared Redis or Postgres instance.

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use scrobble_core::{
    CacheItem, PlaybackAction, QueuedScrobbleEvent, Store, StoreError, User, UserId,
};
use uuid::Uuid;

use crate::fixtures::{PlaybackEventBuilder, UserBuilder};

// Whole seconds, so backends with coarser timestamp precision compare equal.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

fn unique(name: &str) -> String {
    format!("{name}-{}", Uuid::new_v4().simple())
}

/// Runs the full conformance suite against `store`.
pub async fn exercise_store(store: &dyn Store) -> Result<()> {
    users_round_trip(store).await.context("users")?;
    lookup_by_name_prefers_latest(store).await.context("username index")?;
    dedup_cache(store).await.context("dedup cache")?;
    queue_is_fifo_per_user(store).await.context("queue order")?;
    retry_updates(store).await.context("retry updates")?;
    purge(store).await.context("purge")?;
    queue_index_follows_contents(store).await.context("queue index")?;
    store.ping().await.context("ping")?;
    Ok(())
}

async fn users_round_trip(store: &dyn Store) -> Result<()> {
    let now = now();
    let mut user = UserBuilder::new(&unique("alice"), now).display_name("Alice").build();

    store.write_user(&user).await?;
    store.write_user(&user).await?;
    ensure!(store.get_user(&user.id).await? == Some(user.clone()), "user not read back");

    user.rotate_tokens("access-2", "refresh-2", now + Duration::hours(1));
    store.write_user(&user).await?;
    let stored = store.get_user(&user.id).await?.context("user vanished")?;
    ensure!(stored.access_token == "access-2", "last write did not win");

    let listed = store.list_users().await?;
    ensure!(
        listed.iter().filter(|u| u.id == user.id).count() == 1,
        "upsert duplicated the user"
    );

    ensure!(store.delete_user(&user.id, &user.username).await?, "delete reported absent");
    ensure!(store.get_user(&user.id).await?.is_none(), "deleted user still readable");
    ensure!(
        store.get_user_by_name(&user.username).await?.is_none(),
        "deleted user still indexed"
    );
    ensure!(!store.delete_user(&user.id, &user.username).await?, "second delete reported present");
    ensure!(store.get_user(&UserId::new()).await?.is_none(), "unknown id returned a user");
    Ok(())
}

async fn lookup_by_name_prefers_latest(store: &dyn Store) -> Result<()> {
    let name = unique("bob");
    let first = UserBuilder::new(&name, now()).access_token("first").build();
    let second = UserBuilder::new(&name, now()).access_token("second").build();

    store.write_user(&first).await?;
    store.write_user(&second).await?;

    let found = store.get_user_by_name(&name.to_uppercase()).await?.context("name not indexed")?;
    ensure!(found.id == second.id, "lookup did not return the latest write");

    store.delete_user(&first.id, &first.username).await?;
    store.delete_user(&second.id, &second.username).await?;
    Ok(())
}

async fn dedup_cache(store: &dyn Store) -> Result<()> {
    let user = UserBuilder::new(&unique("carol"), now()).build();
    let player = unique("player");
    let event = PlaybackEventBuilder::for_user(&user, now())
        .player(player.clone())
        .action(PlaybackAction::Pause)
        .progress(42.0)
        .build();

    ensure!(store.get_scrobble_body(&player, "1001").await?.is_none(), "cache not empty");

    let item = CacheItem::from_event(&event, now());
    store.write_scrobble_body(&item).await?;
    let cached = store.get_scrobble_body(&player, "1001").await?.context("cache miss")?;
    ensure!(cached.action == PlaybackAction::Pause, "wrong cached action");
    ensure!((cached.progress - 42.0).abs() < f64::EPSILON, "wrong cached progress");
    Ok(())
}

fn entry(user: &User, rating_key: &str, enqueued_offset_secs: i64) -> QueuedScrobbleEvent {
    let at = now() + Duration::seconds(enqueued_offset_secs);
    let event = PlaybackEventBuilder::for_user(user, at).rating_key(rating_key).build();
    QueuedScrobbleEvent::new(user.id, event, None, "HTTP 503", at)
}

async fn queue_is_fifo_per_user(store: &dyn Store) -> Result<()> {
    let owner = UserBuilder::new(&unique("dave"), now()).build();
    let other = UserBuilder::new(&unique("erin"), now()).build();

    let entries: Vec<_> = (0..4).map(|i| entry(&owner, &format!("k{i}"), i)).collect();
    let foreign = entry(&other, "foreign", 0);

    for (i, e) in entries.iter().enumerate() {
        store.enqueue_scrobble(e).await?;
        if i == 1 {
            store.enqueue_scrobble(&foreign).await?;
        }
    }

    let dequeued = store.dequeue_scrobbles(&owner.id, 10).await?;
    let ids: Vec<_> = dequeued.iter().map(|e| e.id).collect();
    let expected: Vec<_> = entries.iter().map(|e| e.id).collect();
    ensure!(ids == expected, "entries not returned in enqueue order");
    ensure!(dequeued[0] == entries[0], "entry not read back intact");

    let limited = store.dequeue_scrobbles(&owner.id, 2).await?;
    ensure!(limited.len() == 2 && limited[0].id == entries[0].id, "limit not applied to oldest");
    ensure!(store.get_queue_size(&owner.id).await? == 4, "dequeue removed entries");

    ensure!(store.delete_queued_scrobble(&entries[1].id).await?, "delete reported absent");
    ensure!(!store.delete_queued_scrobble(&entries[1].id).await?, "second delete reported present");
    let remaining = store.dequeue_scrobbles(&owner.id, 10).await?;
    ensure!(
        remaining.iter().all(|e| e.id != entries[1].id),
        "deleted entry still visible"
    );
    ensure!(remaining.len() == 3, "unexpected queue size after delete");

    let users = store.list_users_with_queued_events().await?;
    ensure!(users.contains(&owner.id) && users.contains(&other.id), "queued users not listed");

    store.purge_queue_for_user(&owner.id).await?;
    store.purge_queue_for_user(&other.id).await?;
    Ok(())
}

async fn retry_updates(store: &dyn Store) -> Result<()> {
    let owner = UserBuilder::new(&unique("frank"), now()).build();
    let queued = entry(&owner, "r1", 0);
    store.enqueue_scrobble(&queued).await?;

    let attempted_at = now() + Duration::minutes(5);
    let next_attempt_at = attempted_at + Duration::minutes(10);
    store
        .update_queued_scrobble_retry(&queued.id, 2, Some("HTTP 502"), attempted_at, next_attempt_at)
        .await?;

    let stored = store.dequeue_scrobbles(&owner.id, 1).await?;
    let stored = stored.first().context("entry vanished after update")?;
    ensure!(stored.retry_count == 2, "retry count not persisted");
    ensure!(stored.last_error.as_deref() == Some("HTTP 502"), "last error not persisted");
    ensure!(stored.last_attempt_at == Some(attempted_at), "attempt time not persisted");
    ensure!(stored.next_attempt_at == Some(next_attempt_at), "schedule not persisted");

    let status = store.get_queue_status(&owner.id).await?;
    ensure!(status.size == 1, "status size wrong");
    ensure!(status.last_error.as_deref() == Some("HTTP 502"), "status last error wrong");
    ensure!(status.oldest_enqueued_at.is_some(), "status missing oldest entry");

    let decreased = store.update_queued_scrobble_retry(&queued.id, 1, None, attempted_at, next_attempt_at).await;
    ensure!(
        matches!(decreased, Err(StoreError::InvalidInput(_))),
        "retry count was allowed to decrease"
    );

    store.delete_queued_scrobble(&queued.id).await?;
    let missing = store.update_queued_scrobble_retry(&queued.id, 3, None, attempted_at, next_attempt_at).await;
    ensure!(matches!(missing, Err(ref e) if e.is_not_found()), "update of absent entry succeeded");
    Ok(())
}

async fn purge(store: &dyn Store) -> Result<()> {
    let owner = UserBuilder::new(&unique("grace"), now()).build();
    for i in 0..3 {
        store.enqueue_scrobble(&entry(&owner, &format!("p{i}"), i)).await?;
    }

    ensure!(store.purge_queue_for_user(&owner.id).await? == 3, "purge count wrong");
    ensure!(store.get_queue_size(&owner.id).await? == 0, "purge left entries");
    ensure!(
        !store.list_users_with_queued_events().await?.contains(&owner.id),
        "purged user still listed"
    );
    ensure!(store.get_queue_status(&owner.id).await?.size == 0, "status after purge");
    Ok(())
}

async fn queue_index_follows_contents(store: &dyn Store) -> Result<()> {
    let owner = UserBuilder::new(&unique("heidi"), now()).build();
    let listed = |users: Vec<UserId>| users.contains(&owner.id);

    let first = entry(&owner, "i1", 0);
    store.enqueue_scrobble(&first).await?;
    ensure!(store.delete_queued_scrobble(&first.id).await?, "delete reported absent");
    ensure!(!listed(store.list_users_with_queued_events().await?), "emptied queue still listed");

    let second = entry(&owner, "i2", 1);
    store.enqueue_scrobble(&second).await?;
    ensure!(listed(store.list_users_with_queued_events().await?), "re-enqueued owner not listed");

    store.purge_queue_for_user(&owner.id).await?;
    let third = entry(&owner, "i3", 2);
    store.enqueue_scrobble(&third).await?;
    ensure!(listed(store.list_users_with_queued_events().await?), "owner lost after purge");
    ensure!(store.get_queue_size(&owner.id).await? == 1, "purge touched the new entry");

    store.purge_queue_for_user(&owner.id).await?;
    Ok(())
}
