//! Relational store backed by PostgreSQL.
//!
//! Owns its schema: [`PostgresStore::migrate`] creates the tables on first
//! start and adds columns introduced later. Every statement is idempotent so
//! the migration can run on every boot.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use super::{bounded, check_retry_monotonic, Store, DEFAULT_OPERATION_TIMEOUT};
use crate::{
    error::{Result, StoreError},
    models::{
        CacheItem, GroupMember, QueueEntryId, QueueStatus, QueuedScrobble, QueuedScrobbleEvent,
        User, UserId,
    },
};

const BACKEND: &str = "postgres";

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        username TEXT NOT NULL,
        access_token TEXT NOT NULL,
        refresh_token TEXT NOT NULL,
        group_members JSONB NOT NULL DEFAULT '[]'::jsonb,
        updated TIMESTAMPTZ NOT NULL,
        written_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_users_username ON users (username, written_at DESC)",
    "ALTER TABLE users ADD COLUMN IF NOT EXISTS display_name TEXT",
    "ALTER TABLE users ADD COLUMN IF NOT EXISTS display_name_truncated BOOLEAN NOT NULL DEFAULT FALSE",
    "CREATE TABLE IF NOT EXISTS scrobble_cache (
        player_uuid TEXT NOT NULL,
        rating_key TEXT NOT NULL,
        body JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (player_uuid, rating_key)
    )",
    "CREATE TABLE IF NOT EXISTS scrobble_queue (
        seq BIGSERIAL,
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        payload JSONB NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        enqueued_at TIMESTAMPTZ NOT NULL,
        last_attempt_at TIMESTAMPTZ,
        last_error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_scrobble_queue_user_seq ON scrobble_queue (user_id, seq)",
    "ALTER TABLE scrobble_queue ADD COLUMN IF NOT EXISTS next_attempt_at TIMESTAMPTZ",
];

const USER_COLUMNS: &str = "id, username, access_token, refresh_token, display_name, \
                            display_name_truncated, updated, group_members";

const QUEUE_COLUMNS: &str =
    "id, user_id, payload, retry_count, enqueued_at, last_attempt_at, next_attempt_at, last_error";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    access_token: String,
    refresh_token: String,
    display_name: Option<String>,
    display_name_truncated: bool,
    updated: DateTime<Utc>,
    group_members: Json<Vec<GroupMember>>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: UserId(row.id),
            username: row.username,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            display_name: row.display_name,
            display_name_truncated: row.display_name_truncated,
            updated: row.updated,
            group_members: row.group_members.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    user_id: Uuid,
    payload: Json<QueuedScrobble>,
    retry_count: i32,
    enqueued_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl From<QueueRow> for QueuedScrobbleEvent {
    fn from(row: QueueRow) -> Self {
        Self {
            id: QueueEntryId(row.id),
            user_id: UserId(row.user_id),
            payload: row.payload.0,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            enqueued_at: row.enqueued_at,
            last_attempt_at: row.last_attempt_at,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
        }
    }
}

fn retry_count_param(count: u32) -> Result<i32> {
    i32::try_from(count)
        .map_err(|_| StoreError::InvalidInput(format!("retry count {count} out of range")))
}

/// PostgreSQL-backed [`Store`].
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    timeout: Duration,
}

impl PostgresStore {
    /// Wraps an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool, timeout: DEFAULT_OPERATION_TIMEOUT }
    }

    /// Connects a pool of at most `max_connections` to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(DEFAULT_OPERATION_TIMEOUT)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Overrides the per-operation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Brings the schema up to date. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Migration(format!("{e}: {statement}")))?;
        }
        tx.commit().await?;

        info!(statements = MIGRATIONS.len(), "postgres schema up to date");
        Ok(())
    }

    /// Closes the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn write_user(&self, user: &User) -> Result<()> {
        bounded(BACKEND, self.timeout, async {
            sqlx::query(
                "INSERT INTO users (id, username, access_token, refresh_token, display_name,
                                    display_name_truncated, updated, group_members, written_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, clock_timestamp())
                 ON CONFLICT (id) DO UPDATE SET
                    username = EXCLUDED.username,
                    access_token = EXCLUDED.access_token,
                    refresh_token = EXCLUDED.refresh_token,
                    display_name = EXCLUDED.display_name,
                    display_name_truncated = EXCLUDED.display_name_truncated,
                    updated = EXCLUDED.updated,
                    group_members = EXCLUDED.group_members,
                    written_at = EXCLUDED.written_at",
            )
            .bind(user.id.0)
            .bind(&user.username)
            .bind(&user.access_token)
            .bind(&user.refresh_token)
            .bind(&user.display_name)
            .bind(user.display_name_truncated)
            .bind(user.updated)
            .bind(Json(&user.group_members))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        bounded(BACKEND, self.timeout, async {
            let row: Option<UserRow> =
                sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(User::from))
        })
        .await
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        bounded(BACKEND, self.timeout, async {
            let row: Option<UserRow> = sqlx::query_as(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE username = $1
                 ORDER BY written_at DESC LIMIT 1"
            ))
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(User::from))
        })
        .await
    }

    async fn delete_user(&self, id: &UserId, username: &str) -> Result<bool> {
        bounded(BACKEND, self.timeout, async {
            let result = sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(id.0)
                .execute(&self.pool)
                .await?;
            debug!(user_id = %id, username, removed = result.rows_affected(), "deleted user");
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        bounded(BACKEND, self.timeout, async {
            let rows: Vec<UserRow> =
                sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(User::from).collect())
        })
        .await
    }

    async fn get_scrobble_body(
        &self,
        player_uuid: &str,
        rating_key: &str,
    ) -> Result<Option<CacheItem>> {
        bounded(BACKEND, self.timeout, async {
            let body: Option<Json<CacheItem>> = sqlx::query_scalar(
                "SELECT body FROM scrobble_cache WHERE player_uuid = $1 AND rating_key = $2",
            )
            .bind(player_uuid)
            .bind(rating_key)
            .fetch_optional(&self.pool)
            .await?;
            Ok(body.map(|b| b.0))
        })
        .await
    }

    async fn write_scrobble_body(&self, item: &CacheItem) -> Result<()> {
        bounded(BACKEND, self.timeout, async {
            sqlx::query(
                "INSERT INTO scrobble_cache (player_uuid, rating_key, body, updated_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (player_uuid, rating_key)
                 DO UPDATE SET body = EXCLUDED.body, updated_at = EXCLUDED.updated_at",
            )
            .bind(&item.player_uuid)
            .bind(&item.rating_key)
            .bind(Json(item))
            .bind(item.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn enqueue_scrobble(&self, entry: &QueuedScrobbleEvent) -> Result<()> {
        bounded(BACKEND, self.timeout, async {
            sqlx::query(
                "INSERT INTO scrobble_queue
                    (id, user_id, payload, retry_count, enqueued_at, last_attempt_at,
                     next_attempt_at, last_error)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(entry.id.0)
            .bind(entry.user_id.0)
            .bind(Json(&entry.payload))
            .bind(retry_count_param(entry.retry_count)?)
            .bind(entry.enqueued_at)
            .bind(entry.last_attempt_at)
            .bind(entry.next_attempt_at)
            .bind(&entry.last_error)
            .execute(&self.pool)
            .await?;

            debug!(entry_id = %entry.id, user_id = %entry.user_id, "enqueued scrobble");
            Ok(())
        })
        .await
    }

    async fn dequeue_scrobbles(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<QueuedScrobbleEvent>> {
        bounded(BACKEND, self.timeout, async {
            let rows: Vec<QueueRow> = sqlx::query_as(&format!(
                "SELECT {QUEUE_COLUMNS} FROM scrobble_queue
                 WHERE user_id = $1 ORDER BY seq ASC LIMIT $2"
            ))
            .bind(user_id.0)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(QueuedScrobbleEvent::from).collect())
        })
        .await
    }

    async fn delete_queued_scrobble(&self, id: &QueueEntryId) -> Result<bool> {
        bounded(BACKEND, self.timeout, async {
            let result = sqlx::query("DELETE FROM scrobble_queue WHERE id = $1")
                .bind(id.0)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
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
            let mut tx = self.pool.begin().await?;

            let current: Option<i32> =
                sqlx::query_scalar("SELECT retry_count FROM scrobble_queue WHERE id = $1 FOR UPDATE")
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(current) = current else {
                return Err(StoreError::NotFound(format!("queue entry {id}")));
            };
            check_retry_monotonic(id, u32::try_from(current).unwrap_or(0), retry_count)?;

            sqlx::query(
                "UPDATE scrobble_queue
                 SET retry_count = $2, last_attempt_at = $3, next_attempt_at = $4,
                     last_error = COALESCE($5, last_error)
                 WHERE id = $1",
            )
            .bind(id.0)
            .bind(retry_count_param(retry_count)?)
            .bind(attempted_at)
            .bind(next_attempt_at)
            .bind(last_error)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn get_queue_size(&self, user_id: &UserId) -> Result<usize> {
        bounded(BACKEND, self.timeout, async {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM scrobble_queue WHERE user_id = $1")
                    .bind(user_id.0)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn get_queue_status(&self, user_id: &UserId) -> Result<QueueStatus> {
        bounded(BACKEND, self.timeout, async {
            let (size, oldest_enqueued_at): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
                "SELECT COUNT(*), MIN(enqueued_at) FROM scrobble_queue WHERE user_id = $1",
            )
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;

            let last_error: Option<String> = sqlx::query_scalar(
                "SELECT last_error FROM scrobble_queue
                 WHERE user_id = $1 AND last_error IS NOT NULL
                 ORDER BY COALESCE(last_attempt_at, enqueued_at) DESC LIMIT 1",
            )
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;

            Ok(QueueStatus {
                size: usize::try_from(size).unwrap_or(0),
                oldest_enqueued_at,
                last_error,
            })
        })
        .await
    }

    async fn list_users_with_queued_events(&self) -> Result<Vec<UserId>> {
        bounded(BACKEND, self.timeout, async {
            let ids: Vec<Uuid> = sqlx::query_scalar(
                "SELECT user_id FROM scrobble_queue GROUP BY user_id ORDER BY MIN(seq) ASC",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(ids.into_iter().map(UserId).collect())
        })
        .await
    }

    async fn purge_queue_for_user(&self, user_id: &UserId) -> Result<usize> {
        bounded(BACKEND, self.timeout, async {
            let result = sqlx::query("DELETE FROM scrobble_queue WHERE user_id = $1")
                .bind(user_id.0)
                .execute(&self.pool)
                .await?;
            Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        bounded(BACKEND, self.timeout, async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
        .await
    }
}
