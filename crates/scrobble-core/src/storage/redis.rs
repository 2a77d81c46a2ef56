//! Remote key/value store backed by Redis.
//!
//! Key layout under a configurable prefix:
//! - `user:{id}` JSON user record, `username:{name}` id index, `users` id set
//! - `scrobble:{player}:{rating_key}` dedup entry with a native TTL
//! - `queue:seq` global counter scoring entries in `queue:user:{id}` sorted
//!   sets, `queue:entry:{id}` JSON entries, `queue:users` owners with
//!   pending entries
//!
//! Multi-key writes go through `MULTI` pipelines. Removals that also decide
//! whether an owner leaves `queue:users` run as Lua scripts, so the emptiness
//! check and the `SREM` cannot interleave with a concurrent enqueue. The
//! multiplexed connection is cheap to clone and safe to share across tasks.

use std::time::Duration;

use ::redis::{aio::MultiplexedConnection, Client, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{bounded, check_retry_monotonic, Store, DEDUP_CACHE_TTL, DEFAULT_OPERATION_TIMEOUT};
use crate::{
    error::{Result, StoreError},
    models::{CacheItem, QueueEntryId, QueueStatus, QueuedScrobbleEvent, User, UserId},
};

const BACKEND: &str = "redis";

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "scrobble";

/// KEYS: entry, owner queue, `queue:users`. ARGV: entry id, owner id.
const DELETE_ENTRY_SCRIPT: &str = r"
local removed = redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
if redis.call('ZCARD', KEYS[2]) == 0 then
    redis.call('SREM', KEYS[3], ARGV[2])
end
return removed
";

/// KEYS: owner queue, `queue:users`. ARGV: entry key prefix, owner id.
const PURGE_QUEUE_SCRIPT: &str = r"
local ids = redis.call('ZRANGE', KEYS[1], 0, -1)
for _, id in ipairs(ids) do
    redis.call('DEL', ARGV[1] .. id)
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[2])
return #ids
";

/// Redis-backed [`Store`].
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
    timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to Redis at `url` using the default key prefix.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_prefix(url, DEFAULT_KEY_PREFIX).await
    }

    /// Connects to Redis at `url`, namespacing every key under `prefix`.
    pub async fn connect_with_prefix(url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = bounded(BACKEND, DEFAULT_OPERATION_TIMEOUT, async {
            Ok(client.get_multiplexed_async_connection().await?)
        })
        .await?;

        info!(prefix, "connected to redis store");
        Ok(Self { conn, prefix: prefix.to_string(), timeout: DEFAULT_OPERATION_TIMEOUT })
    }

    /// Overrides the per-operation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    fn user_key(&self, id: &str) -> String {
        self.key(&format!("user:{id}"))
    }

    fn username_key(&self, username: &str) -> String {
        self.key(&format!("username:{username}"))
    }

    fn queue_key(&self, user_id: &str) -> String {
        self.key(&format!("queue:user:{user_id}"))
    }

    fn entry_key(&self, id: &str) -> String {
        self.key(&format!("queue:entry:{id}"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from)).transpose()
    }

    async fn get_many<T: serde::de::DeserializeOwned>(&self, keys: &[String]) -> Result<Vec<T>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = ::redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;

        raw.into_iter()
            .flatten()
            .map(|value| serde_json::from_str(&value).map_err(StoreError::from))
            .collect()
    }

    async fn queue_ids(&self, user_id: &str, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = i64::try_from(limit).map(|l| l - 1).unwrap_or(-1);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = ::redis::cmd("ZRANGE")
            .arg(self.queue_key(user_id))
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn queue_entries(&self, user_id: &str, limit: usize) -> Result<Vec<QueuedScrobbleEvent>> {
        let ids = self.queue_ids(user_id, limit).await?;
        let keys: Vec<String> = ids.iter().map(|id| self.entry_key(id)).collect();
        self.get_many(&keys).await
    }
}

#[async_trait]
impl Store for RedisStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn write_user(&self, user: &User) -> Result<()> {
        bounded(BACKEND, self.timeout, async {
            let id = user.id.to_string();
            let mut conn = self.conn.clone();

            let previous: Option<User> = self.get_json(&self.user_key(&id)).await?;
            let mut stale_index = None;
            if let Some(previous) = previous.filter(|p| p.username != user.username) {
                let indexed: Option<String> = ::redis::cmd("GET")
                    .arg(self.username_key(&previous.username))
                    .query_async(&mut conn)
                    .await?;
                if indexed.as_deref() == Some(id.as_str()) {
                    stale_index = Some(self.username_key(&previous.username));
                }
            }

            let mut pipe = ::redis::pipe();
            pipe.atomic()
                .cmd("SET")
                .arg(self.user_key(&id))
                .arg(serde_json::to_string(user)?)
                .ignore()
                .cmd("SET")
                .arg(self.username_key(&user.username))
                .arg(&id)
                .ignore()
                .cmd("SADD")
                .arg(self.key("users"))
                .arg(&id)
                .ignore();
            if let Some(stale) = stale_index {
                pipe.cmd("DEL").arg(stale).ignore();
            }

            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        bounded(BACKEND, self.timeout, self.get_json(&self.user_key(&id.to_string()))).await
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        bounded(BACKEND, self.timeout, async {
            let mut conn = self.conn.clone();
            let id: Option<String> =
                ::redis::cmd("GET").arg(self.username_key(username)).query_async(&mut conn).await?;
            match id {
                Some(id) => self.get_json(&self.user_key(&id)).await,
                None => Ok(None),
            }
        })
        .await
    }

    async fn delete_user(&self, id: &UserId, username: &str) -> Result<bool> {
        bounded(BACKEND, self.timeout, async {
            let id = id.to_string();
            let mut conn = self.conn.clone();

            let indexed: Option<String> =
                ::redis::cmd("GET").arg(self.username_key(username)).query_async(&mut conn).await?;

            let mut pipe = ::redis::pipe();
            pipe.atomic()
                .cmd("DEL")
                .arg(self.user_key(&id))
                .cmd("SREM")
                .arg(self.key("users"))
                .arg(&id)
                .ignore();
            if indexed.as_deref() == Some(id.as_str()) {
                pipe.cmd("DEL").arg(self.username_key(username)).ignore();
            }

            let (removed,): (i64,) = pipe.query_async(&mut conn).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        bounded(BACKEND, self.timeout, async {
            let mut conn = self.conn.clone();
            let mut ids: Vec<String> =
                ::redis::cmd("SMEMBERS").arg(self.key("users")).query_async(&mut conn).await?;
            ids.sort();

            let keys: Vec<String> = ids.iter().map(|id| self.user_key(id)).collect();
            self.get_many(&keys).await
        })
        .await
    }

    async fn get_scrobble_body(
        &self,
        player_uuid: &str,
        rating_key: &str,
    ) -> Result<Option<CacheItem>> {
        let key = self.key(&format!("scrobble:{player_uuid}:{rating_key}"));
        bounded(BACKEND, self.timeout, self.get_json(&key)).await
    }

    async fn write_scrobble_body(&self, item: &CacheItem) -> Result<()> {
        bounded(BACKEND, self.timeout, async {
            let key = self.key(&format!("scrobble:{}:{}", item.player_uuid, item.rating_key));
            let mut conn = self.conn.clone();
            let _: () = ::redis::cmd("SET")
                .arg(key)
                .arg(serde_json::to_string(item)?)
                .arg("EX")
                .arg(DEDUP_CACHE_TTL.as_secs())
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn enqueue_scrobble(&self, entry: &QueuedScrobbleEvent) -> Result<()> {
        bounded(BACKEND, self.timeout, async {
            let id = entry.id.to_string();
            let user_id = entry.user_id.to_string();
            let mut conn = self.conn.clone();

            let seq: i64 = ::redis::cmd("INCR").arg(self.key("queue:seq")).query_async(&mut conn).await?;

            let _: () = ::redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(self.entry_key(&id))
                .arg(serde_json::to_string(entry)?)
                .ignore()
                .cmd("ZADD")
                .arg(self.queue_key(&user_id))
                .arg(seq)
                .arg(&id)
                .ignore()
                .cmd("SADD")
                .arg(self.key("queue:users"))
                .arg(&user_id)
                .ignore()
                .query_async(&mut conn)
                .await?;

            debug!(entry_id = %id, user_id = %user_id, seq, "enqueued scrobble");
            Ok(())
        })
        .await
    }

    async fn dequeue_scrobbles(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<QueuedScrobbleEvent>> {
        bounded(BACKEND, self.timeout, self.queue_entries(&user_id.to_string(), limit)).await
    }

    async fn delete_queued_scrobble(&self, id: &QueueEntryId) -> Result<bool> {
        bounded(BACKEND, self.timeout, async {
            let id = id.to_string();
            let Some(entry) = self.get_json::<QueuedScrobbleEvent>(&self.entry_key(&id)).await? else {
                return Ok(false);
            };
            let user_id = entry.user_id.to_string();
            let mut conn = self.conn.clone();

            let removed: i64 = Script::new(DELETE_ENTRY_SCRIPT)
                .key(self.entry_key(&id))
                .key(self.queue_key(&user_id))
                .key(self.key("queue:users"))
                .arg(&id)
                .arg(&user_id)
                .invoke_async(&mut conn)
                .await?;

            Ok(removed > 0)
        })
        .await
    }

    async fn update_queued_scrobble_retry(
        &self,
        id: &QueueEntryId,
        retry_count: u32,
        last_error: Option<&str>,
        attempted_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        bounded(BACKEND, self.timeout, async {
            let key = self.entry_key(&id.to_string());
            let Some(mut entry) = self.get_json::<QueuedScrobbleEvent>(&key).await? else {
                return Err(StoreError::NotFound(format!("queue entry {id}")));
            };
            check_retry_monotonic(id, entry.retry_count, retry_count)?;
            entry.record_retry(retry_count, last_error, attempted_at, next_attempt_at);

            let mut conn = self.conn.clone();
            let written: Option<String> = ::redis::cmd("SET")
                .arg(&key)
                .arg(serde_json::to_string(&entry)?)
                .arg("XX")
                .query_async(&mut conn)
                .await?;
            if written.is_none() {
                return Err(StoreError::NotFound(format!("queue entry {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn get_queue_size(&self, user_id: &UserId) -> Result<usize> {
        bounded(BACKEND, self.timeout, async {
            let mut conn = self.conn.clone();
            let size: usize = ::redis::cmd("ZCARD")
                .arg(self.queue_key(&user_id.to_string()))
                .query_async(&mut conn)
                .await?;
            Ok(size)
        })
        .await
    }

    async fn get_queue_status(&self, user_id: &UserId) -> Result<QueueStatus> {
        bounded(BACKEND, self.timeout, async {
            let entries = self.queue_entries(&user_id.to_string(), usize::MAX).await?;
            Ok(QueueStatus::from_entries(&entries))
        })
        .await
    }

    async fn list_users_with_queued_events(&self) -> Result<Vec<UserId>> {
        bounded(BACKEND, self.timeout, async {
            let mut conn = self.conn.clone();
            let mut raw: Vec<String> =
                ::redis::cmd("SMEMBERS").arg(self.key("queue:users")).query_async(&mut conn).await?;
            raw.sort();

            raw.into_iter()
                .map(|id| {
                    id.parse().map_err(|e| {
                        StoreError::Serialization(format!("invalid user id {id:?} in queue index: {e}"))
                    })
                })
                .collect()
        })
        .await
    }

    async fn purge_queue_for_user(&self, user_id: &UserId) -> Result<usize> {
        bounded(BACKEND, self.timeout, async {
            let user_id = user_id.to_string();
            let mut conn = self.conn.clone();

            let purged: usize = Script::new(PURGE_QUEUE_SCRIPT)
                .key(self.queue_key(&user_id))
                .key(self.key("queue:users"))
                .arg(self.key("queue:entry:"))
                .arg(&user_id)
                .invoke_async(&mut conn)
                .await?;
            Ok(purged)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        bounded(BACKEND, self.timeout, async {
            let mut conn = self.conn.clone();
            let pong: String = ::redis::cmd("PING").query_async(&mut conn).await?;
            if pong != "PONG" {
                return Err(StoreError::unavailable(BACKEND, format!("unexpected ping reply {pong:?}")));
            }
            Ok(())
        })
        .await
    }
}
