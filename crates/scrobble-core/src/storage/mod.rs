//! Persistence abstraction and its backends.
//!
//! [`Store`] is the single capability consumers depend on. Each backend
//! owns its own thread-safety: callers never lock around store calls except
//! through the per-user lock registry when sequencing several calls.
//!
//! Every operation is bounded by the backend's operation timeout; an
//! elapsed timeout surfaces as [`StoreError::Unavailable`]. Dropping the
//! returned future abandons the operation.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::{Result, StoreError},
    models::{CacheItem, QueueEntryId, QueueStatus, QueuedScrobbleEvent, User, UserId},
};

pub mod embedded;
pub mod postgres;
pub mod redis;

pub use self::{embedded::EmbeddedStore, postgres::PostgresStore, redis::RedisStore};

/// Default bound on a single store operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifetime of dedup cache entries in backends with native expiry.
pub const DEDUP_CACHE_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Persistence operations shared by every backend.
///
/// Lookups return `Ok(None)` for absent records. Queue operations keep
/// per-user FIFO order: entries are dequeued oldest first and are only
/// visible to their owning user.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Short backend name for logs and health reports.
    fn backend(&self) -> &'static str;

    /// Inserts or replaces a user by id and updates the username index.
    async fn write_user(&self, user: &User) -> Result<()>;

    /// Fetches a user by id.
    async fn get_user(&self, id: &UserId) -> Result<Option<User>>;

    /// Fetches the most recently written user with this normalized name.
    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>>;

    /// Removes a user and its index entry. Returns whether it existed.
    async fn delete_user(&self, id: &UserId, username: &str) -> Result<bool>;

    /// Returns every stored user.
    async fn list_users(&self) -> Result<Vec<User>>;

    /// Reads the dedup cache entry for a player and content key.
    async fn get_scrobble_body(&self, player_uuid: &str, rating_key: &str)
        -> Result<Option<CacheItem>>;

    /// Writes a dedup cache entry.
    async fn write_scrobble_body(&self, item: &CacheItem) -> Result<()>;

    /// Appends an entry to its owner's retry queue.
    async fn enqueue_scrobble(&self, entry: &QueuedScrobbleEvent) -> Result<()>;

    /// Returns up to `limit` of the user's oldest entries without removing them.
    async fn dequeue_scrobbles(&self, user_id: &UserId, limit: usize)
        -> Result<Vec<QueuedScrobbleEvent>>;

    /// Removes a queue entry. Returns whether it existed.
    async fn delete_queued_scrobble(&self, id: &QueueEntryId) -> Result<bool>;

    /// Records a failed redelivery attempt on an entry and schedules the
    /// next one at `next_attempt_at`.
    ///
    /// Fails with [`StoreError::NotFound`] when the entry is gone and with
    /// [`StoreError::InvalidInput`] when `retry_count` would decrease.
    async fn update_queued_scrobble_retry(
        &self,
        id: &QueueEntryId,
        retry_count: u32,
        last_error: Option<&str>,
        attempted_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Number of pending entries for a user.
    async fn get_queue_size(&self, user_id: &UserId) -> Result<usize>;

    /// Size, oldest entry, and last error for a user's queue.
    async fn get_queue_status(&self, user_id: &UserId) -> Result<QueueStatus>;

    /// Users that currently have pending entries.
    async fn list_users_with_queued_events(&self) -> Result<Vec<UserId>>;

    /// Removes every entry for a user. Returns how many were removed.
    async fn purge_queue_for_user(&self, user_id: &UserId) -> Result<usize>;

    /// Side-effect free liveness probe.
    async fn ping(&self) -> Result<()>;
}

/// Runs a backend operation under the operation timeout.
pub(crate) async fn bounded<T, F>(backend: &'static str, timeout: Duration, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::unavailable(
            backend,
            format!("operation timed out after {}ms", timeout.as_millis()),
        )),
    }
}

/// Rejects retry updates that would move the count backwards.
pub(crate) fn check_retry_monotonic(id: &QueueEntryId, current: u32, requested: u32) -> Result<()> {
    if requested < current {
        return Err(StoreError::InvalidInput(format!(
            "retry count for {id} cannot decrease from {current} to {requested}"
        )));
    }
    Ok(())
}
