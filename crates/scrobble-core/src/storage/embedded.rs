//! Single-file embedded store backed by SQLite.
//!
//! Records live in named buckets of key to JSON value, mirroring a
//! bucketed key/value file store. The retry queue uses its own table with
//! an autoincrement sequence so dequeue order is FIFO per user.
//!
//! The connection sits behind a mutex and every operation runs on the
//! blocking thread pool, so concurrent callers are serialized internally.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use super::{bounded, check_retry_monotonic, Store, DEFAULT_OPERATION_TIMEOUT};
use crate::{
    error::{Result, StoreError},
    models::{CacheItem, QueueEntryId, QueueStatus, QueuedScrobbleEvent, User, UserId},
};

const BACKEND: &str = "embedded";

const USERS: &str = "users";
const USERNAMES: &str = "usernames";
const SCROBBLES: &str = "scrobbles";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS buckets (
        bucket TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (bucket, key)
    );
    CREATE TABLE IF NOT EXISTS queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        user_id TEXT NOT NULL,
        entry TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS queue_user_seq ON queue (user_id, seq);
";

/// SQLite-backed [`Store`].
#[derive(Clone)]
pub struct EmbeddedStore {
    conn: Arc<Mutex<Connection>>,
    timeout: Duration,
}

impl std::fmt::Debug for EmbeddedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedStore").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

impl EmbeddedStore {
    /// Opens or creates the store file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::unavailable(BACKEND, format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        info!(path = %path.display(), "opened embedded store");
        Self::with_connection(conn)
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), timeout: DEFAULT_OPERATION_TIMEOUT })
    }

    /// Overrides the per-operation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::unavailable(BACKEND, "connection mutex poisoned"))?;
            op(&mut guard)
        });

        bounded(BACKEND, self.timeout, async move {
            task.await.map_err(|e| StoreError::unavailable(BACKEND, format!("task failed: {e}")))?
        })
        .await
    }
}

fn bucket_get<T: DeserializeOwned>(conn: &Connection, bucket: &str, key: &str) -> Result<Option<T>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM buckets WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|value| serde_json::from_str(&value).map_err(StoreError::from)).transpose()
}

fn bucket_put<T: Serialize>(conn: &Connection, bucket: &str, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
        params![bucket, key, value],
    )?;
    Ok(())
}

fn bucket_delete(conn: &Connection, bucket: &str, key: &str) -> Result<bool> {
    let removed =
        conn.execute("DELETE FROM buckets WHERE bucket = ?1 AND key = ?2", params![bucket, key])?;
    Ok(removed > 0)
}

fn queue_entries(conn: &Connection, user_id: &str, limit: i64) -> Result<Vec<QueuedScrobbleEvent>> {
    let mut stmt =
        conn.prepare("SELECT entry FROM queue WHERE user_id = ?1 ORDER BY seq ASC LIMIT ?2")?;
    let rows = stmt.query_map(params![user_id, limit], |row| row.get::<_, String>(0))?;

    let mut entries = Vec::new();
    for raw in rows {
        entries.push(serde_json::from_str(&raw?)?);
    }
    Ok(entries)
}

fn cache_key(player_uuid: &str, rating_key: &str) -> String {
    format!("{player_uuid}:{rating_key}")
}

#[async_trait]
impl Store for EmbeddedStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn write_user(&self, user: &User) -> Result<()> {
        let user = user.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let id = user.id.to_string();

            let previous: Option<User> = bucket_get(&tx, USERS, &id)?;
            if let Some(previous) = previous.filter(|p| p.username != user.username) {
                let indexed: Option<String> = bucket_get(&tx, USERNAMES, &previous.username)?;
                if indexed.as_deref() == Some(id.as_str()) {
                    bucket_delete(&tx, USERNAMES, &previous.username)?;
                }
            }

            bucket_put(&tx, USERS, &id, &user)?;
            bucket_put(&tx, USERNAMES, &user.username, &id)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        let id = id.to_string();
        self.run(move |conn| bucket_get(conn, USERS, &id)).await
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        let username = username.to_string();
        self.run(move |conn| {
            let Some(id) = bucket_get::<String>(conn, USERNAMES, &username)? else {
                return Ok(None);
            };
            bucket_get(conn, USERS, &id)
        })
        .await
    }

    async fn delete_user(&self, id: &UserId, username: &str) -> Result<bool> {
        let id = id.to_string();
        let username = username.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let existed = bucket_delete(&tx, USERS, &id)?;

            let indexed: Option<String> = bucket_get(&tx, USERNAMES, &username)?;
            if indexed.as_deref() == Some(id.as_str()) {
                bucket_delete(&tx, USERNAMES, &username)?;
            }
            tx.commit()?;
            Ok(existed)
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT value FROM buckets WHERE bucket = ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![USERS], |row| row.get::<_, String>(0))?;

            let mut users = Vec::new();
            for raw in rows {
                users.push(serde_json::from_str(&raw?)?);
            }
            Ok(users)
        })
        .await
    }

    async fn get_scrobble_body(
        &self,
        player_uuid: &str,
        rating_key: &str,
    ) -> Result<Option<CacheItem>> {
        let key = cache_key(player_uuid, rating_key);
        self.run(move |conn| bucket_get(conn, SCROBBLES, &key)).await
    }

    async fn write_scrobble_body(&self, item: &CacheItem) -> Result<()> {
        let item = item.clone();
        self.run(move |conn| {
            bucket_put(conn, SCROBBLES, &cache_key(&item.player_uuid, &item.rating_key), &item)
        })
        .await
    }

    async fn enqueue_scrobble(&self, entry: &QueuedScrobbleEvent) -> Result<()> {
        let id = entry.id.to_string();
        let user_id = entry.user_id.to_string();
        let raw = serde_json::to_string(entry)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO queue (id, user_id, entry) VALUES (?1, ?2, ?3)",
                params![id, user_id, raw],
            )?;
            debug!(entry_id = %id, user_id = %user_id, "enqueued scrobble");
            Ok(())
        })
        .await
    }

    async fn dequeue_scrobbles(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<QueuedScrobbleEvent>> {
        let user_id = user_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| queue_entries(conn, &user_id, limit)).await
    }

    async fn delete_queued_scrobble(&self, id: &QueueEntryId) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn| {
            let removed = conn.execute("DELETE FROM queue WHERE id = ?1", params![id])?;
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
        let entry_id = *id;
        let last_error = last_error.map(str::to_string);
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let raw: Option<String> = tx
                .query_row(
                    "SELECT entry FROM queue WHERE id = ?1",
                    params![entry_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = raw else {
                return Err(StoreError::NotFound(format!("queue entry {entry_id}")));
            };

            let mut entry: QueuedScrobbleEvent = serde_json::from_str(&raw)?;
            check_retry_monotonic(&entry_id, entry.retry_count, retry_count)?;
            entry.record_retry(retry_count, last_error.as_deref(), attempted_at, next_attempt_at);

            tx.execute(
                "UPDATE queue SET entry = ?2 WHERE id = ?1",
                params![entry_id.to_string(), serde_json::to_string(&entry)?],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_queue_size(&self, user_id: &UserId) -> Result<usize> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queue WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn get_queue_status(&self, user_id: &UserId) -> Result<QueueStatus> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let entries = queue_entries(conn, &user_id, i64::MAX)?;
            Ok(QueueStatus::from_entries(&entries))
        })
        .await
    }

    async fn list_users_with_queued_events(&self) -> Result<Vec<UserId>> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare("SELECT user_id FROM queue GROUP BY user_id ORDER BY MIN(seq) ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut users = Vec::new();
            for raw in rows {
                let raw = raw?;
                let id = raw.parse().map_err(|e| {
                    StoreError::Serialization(format!("invalid user id {raw:?} in queue: {e}"))
                })?;
                users.push(id);
            }
            Ok(users)
        })
        .await
    }

    async fn purge_queue_for_user(&self, user_id: &UserId) -> Result<usize> {
        let user_id = user_id.to_string();
        self.run(move |conn| Ok(conn.execute("DELETE FROM queue WHERE user_id = ?1", params![user_id])?))
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.run(|conn| {
            let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reopening_a_file_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");
        let user = User::new("neil", "access", "refresh", Utc::now());

        {
            let store = EmbeddedStore::open(&path).unwrap();
            store.write_user(&user).await.unwrap();
        }

        let reopened = EmbeddedStore::open(&path).unwrap();
        assert_eq!(reopened.get_user(&user.id).await.unwrap(), Some(user));
    }

    #[tokio::test]
    async fn renaming_a_user_moves_the_index() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let mut user = User::new("neil", "access", "refresh", Utc::now());
        store.write_user(&user).await.unwrap();

        user.username = "mccauley".to_string();
        store.write_user(&user).await.unwrap();

        assert_eq!(store.get_user_by_name("neil").await.unwrap(), None);
        assert_eq!(store.get_user_by_name("mccauley").await.unwrap().map(|u| u.id), Some(user.id));
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_store() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        store.ping().await.unwrap();
        assert_eq!(store.backend(), "embedded");
    }
}
