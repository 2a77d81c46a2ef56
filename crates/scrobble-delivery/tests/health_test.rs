//! Health probe against live and failing stores.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scrobble_core::{
    CacheItem, Clock, QueueEntryId, QueueStatus, QueuedScrobbleEvent, Result, Store, StoreError,
    User, UserId,
};
use scrobble_delivery::{health::ComponentStatus, HealthService, HealthStatus};
use scrobble_testing::TestEnv;

/// Store whose backend is unreachable.
struct DownStore;

fn down<T>() -> Result<T> {
    Err(StoreError::unavailable("redis", "connection refused"))
}

#[async_trait]
impl Store for DownStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn write_user(&self, _: &User) -> Result<()> {
        down()
    }

    async fn get_user(&self, _: &UserId) -> Result<Option<User>> {
        down()
    }

    async fn get_user_by_name(&self, _: &str) -> Result<Option<User>> {
        down()
    }

    async fn delete_user(&self, _: &UserId, _: &str) -> Result<bool> {
        down()
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        down()
    }

    async fn get_scrobble_body(&self, _: &str, _: &str) -> Result<Option<CacheItem>> {
        down()
    }

    async fn write_scrobble_body(&self, _: &CacheItem) -> Result<()> {
        down()
    }

    async fn enqueue_scrobble(&self, _: &QueuedScrobbleEvent) -> Result<()> {
        down()
    }

    async fn dequeue_scrobbles(&self, _: &UserId, _: usize) -> Result<Vec<QueuedScrobbleEvent>> {
        down()
    }

    async fn delete_queued_scrobble(&self, _: &QueueEntryId) -> Result<bool> {
        down()
    }

    async fn update_queued_scrobble_retry(
        &self,
        _: &QueueEntryId,
        _: u32,
        _: Option<&str>,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
    ) -> Result<()> {
        down()
    }

    async fn get_queue_size(&self, _: &UserId) -> Result<usize> {
        down()
    }

    async fn get_queue_status(&self, _: &UserId) -> Result<QueueStatus> {
        down()
    }

    async fn list_users_with_queued_events(&self) -> Result<Vec<UserId>> {
        down()
    }

    async fn purge_queue_for_user(&self, _: &UserId) -> Result<usize> {
        down()
    }

    async fn ping(&self) -> Result<()> {
        down()
    }
}

#[tokio::test]
async fn healthy_store_reports_up() {
    let env = TestEnv::new().unwrap();
    let health = HealthService::new(env.clock());

    let report = health.check(env.store.as_ref()).await;

    assert!(report.is_healthy());
    assert_eq!(report.checks.store.status, ComponentStatus::Up);
    assert_eq!(report.checks.store.backend, "embedded");
    assert!(report.checks.store.message.is_none());
    assert_eq!(report.timestamp, env.clock.now_utc());
}

#[tokio::test]
async fn failing_store_reports_down() {
    let env = TestEnv::new().unwrap();
    let health = HealthService::new(env.clock());

    let report = health.check(&DownStore).await;

    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert_eq!(report.checks.store.status, ComponentStatus::Down);
    assert!(report.checks.store.message.as_deref().unwrap_or_default().contains("connection refused"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "unhealthy");
    assert_eq!(json["checks"]["store"]["status"], "down");
}

#[tokio::test]
async fn failing_store_fails_live_delivery_with_storage_error() {
    let env = TestEnv::new().unwrap();
    let engine = scrobble_delivery::DeliveryEngine::new(
        Arc::new(DownStore),
        env.api.clone(),
        env.locks.clone(),
        env.clock(),
        scrobble_delivery::DeliveryConfig::default(),
    );
    let user = scrobble_testing::UserBuilder::new("alice", Utc::now()).build();
    let event = scrobble_testing::PlaybackEventBuilder::for_user(&user, Utc::now()).build();

    let err = engine.handle_event(event).await.unwrap_err();

    assert!(matches!(err, scrobble_delivery::DeliveryError::Storage(ref e) if e.is_unavailable()));
    assert_eq!(err.category(), scrobble_delivery::ErrorCategory::StorageUnavailable);
}
