//! Background redelivery of queued scrobbles.
//!
//! The drainer sweeps the retry queue on a fixed interval and can also be
//! driven on demand through [`QueueDrainer::drain_once`]. Sweeps never
//! overlap. Entries are redelivered in enqueue order per user, through the
//! same path as live events; a user's sweep stops at the first entry that is
//! not yet due or fails again, so newer entries never overtake older ones. Each entry ends in one of three ways: deleted on success,
//! persisted with an incremented retry count, or deleted once the retry
//! budget is spent or the failure is permanent.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use scrobble_core::{Clock, QueuedScrobbleEvent, Store, UserId};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::DeliveryEngine,
    error::{DeliveryError, Result},
    retry::{RetryContext, RetryDecision, RetryPolicy},
};

/// Configuration for the queue drainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainerConfig {
    /// Time between sweeps.
    pub interval: Duration,

    /// Maximum entries redelivered per user in one sweep.
    pub batch_size: usize,

    /// Backoff and retry budget applied to failed redeliveries.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for an in-flight sweep on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::DEFAULT_DRAIN_INTERVAL_SECONDS),
            batch_size: crate::DEFAULT_DRAIN_BATCH_SIZE,
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Users with pending entries.
    pub users: usize,
    /// Redeliveries attempted.
    pub attempted: usize,
    /// Entries delivered and removed.
    pub delivered: usize,
    /// Entries kept with an incremented retry count.
    pub retried: usize,
    /// Entries removed without delivery.
    pub dropped: usize,
    /// Head entries still inside their backoff delay.
    pub skipped_not_due: usize,
    /// Entries removed because their owner no longer exists.
    pub purged: usize,
}

impl DrainReport {
    fn merge(&mut self, other: Self) {
        self.users += other.users;
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.dropped += other.dropped;
        self.skipped_not_due += other.skipped_not_due;
        self.purged += other.purged;
    }
}

/// Sweeps the retry queue and redelivers due entries.
pub struct QueueDrainer {
    store: Arc<dyn Store>,
    engine: DeliveryEngine,
    clock: Arc<dyn Clock>,
    config: DrainerConfig,
    sweep_lock: Arc<Mutex<()>>,
    cancellation_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl QueueDrainer {
    /// Creates a drainer that redelivers through `engine`.
    pub fn new(
        store: Arc<dyn Store>,
        engine: DeliveryEngine,
        clock: Arc<dyn Clock>,
        config: DrainerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            clock,
            config,
            sweep_lock: Arc::new(Mutex::new(())),
            cancellation_token: CancellationToken::new(),
            handle: None,
        }
    }

    /// Drainer configuration.
    pub fn config(&self) -> &DrainerConfig {
        &self.config
    }

    /// Returns true while the background sweep task is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawns the periodic sweep task.
    ///
    /// Calling `start` on a running drainer is a no-op.
    pub fn start(&mut self) {
        if self.is_running() {
            debug!("queue drainer already running");
            return;
        }

        info!(
            interval_seconds = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            max_retries = self.config.retry_policy.max_retries,
            "starting queue drainer"
        );

        let sweeper = self.sweeper();
        let token = self.cancellation_token.clone();

        self.handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = sweeper.drain_once() => {
                        if let Err(error) = result {
                            error!(error = %error, "queue sweep failed");
                        }
                    }
                    () = token.cancelled() => break,
                }

                tokio::select! {
                    () = sweeper.clock.sleep(sweeper.config.interval) => {}
                    () = token.cancelled() => break,
                }
            }
            info!("queue drainer stopped");
        }));
    }

    /// Runs a single sweep over every user with pending entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the set of users with pending entries cannot be
    /// read. Per-entry failures are handled and counted instead.
    /// Waits for a sweep already in progress before starting.
    pub async fn drain_once(&self) -> Result<DrainReport> {
        self.sweeper().drain_once().await
    }

    fn sweeper(&self) -> Sweeper {
        Sweeper {
            store: Arc::clone(&self.store),
            engine: self.engine.clone(),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            sweep_lock: Arc::clone(&self.sweep_lock),
        }
    }

    /// Stops the sweep task, waiting up to `timeout` for it to finish.
    pub async fn shutdown(mut self, timeout: Duration) {
        self.cancellation_token.cancel();

        let Some(mut handle) = self.handle.take() else {
            debug!("queue drainer was not started");
            return;
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => info!("queue drainer shut down"),
            Ok(Err(join_error)) => error!(error = %join_error, "queue drainer task panicked"),
            Err(_) => {
                warn!(timeout_seconds = timeout.as_secs(), "queue drainer shutdown timed out");
                handle.abort();
            },
        }
    }
}

impl Drop for QueueDrainer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancellation_token.cancel();
            handle.abort();
        }
    }
}

struct Sweeper {
    store: Arc<dyn Store>,
    engine: DeliveryEngine,
    clock: Arc<dyn Clock>,
    config: DrainerConfig,
    sweep_lock: Arc<Mutex<()>>,
}

enum EntryResult {
    Delivered,
    Retried,
    Dropped,
    NotDue,
    OwnerMissing,
}

impl Sweeper {
    async fn drain_once(&self) -> Result<DrainReport> {
        let _sweep = self.sweep_lock.lock().await;

        let users = self.store.list_users_with_queued_events().await?;
        if users.is_empty() {
            return Ok(DrainReport::default());
        }

        let reports = join_all(users.iter().map(|user_id| self.drain_user(*user_id))).await;

        let mut report = DrainReport { users: users.len(), ..DrainReport::default() };
        for (user_id, result) in users.iter().zip(reports) {
            match result {
                Ok(user_report) => report.merge(user_report),
                Err(error) => {
                    warn!(user_id = %user_id, error = %error, "failed to drain user queue");
                },
            }
        }

        if report.attempted > 0 || report.purged > 0 {
            info!(
                users = report.users,
                attempted = report.attempted,
                delivered = report.delivered,
                retried = report.retried,
                dropped = report.dropped,
                purged = report.purged,
                "queue sweep finished"
            );
        }
        Ok(report)
    }

    async fn drain_user(&self, user_id: UserId) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        if self.store.get_user(&user_id).await?.is_none() {
            report.purged = self.store.purge_queue_for_user(&user_id).await?;
            warn!(user_id = %user_id, purged = report.purged, "purged queue of deleted user");
            return Ok(report);
        }

        let entries = self.store.dequeue_scrobbles(&user_id, self.config.batch_size).await?;
        for entry in entries {
            match self.process_entry(&entry).await? {
                EntryResult::Delivered => {
                    report.attempted += 1;
                    report.delivered += 1;
                },
                EntryResult::Retried => {
                    report.attempted += 1;
                    report.retried += 1;
                    break;
                },
                EntryResult::Dropped => {
                    report.attempted += 1;
                    report.dropped += 1;
                },
                EntryResult::NotDue => {
                    report.skipped_not_due += 1;
                    break;
                },
                EntryResult::OwnerMissing => {
                    report.attempted += 1;
                    report.purged += self.store.purge_queue_for_user(&user_id).await?;
                    break;
                },
            }
        }

        Ok(report)
    }

    async fn process_entry(&self, entry: &QueuedScrobbleEvent) -> Result<EntryResult> {
        let now = self.clock.now_utc();
        if !self.config.retry_policy.is_due(entry, now) {
            return Ok(EntryResult::NotDue);
        }

        let error = match self.engine.redeliver(entry).await {
            Ok(_) => {
                self.store.delete_queued_scrobble(&entry.id).await?;
                return Ok(EntryResult::Delivered);
            },
            Err(error) => error,
        };

        match &error {
            DeliveryError::UnknownUser { .. } => return Ok(EntryResult::OwnerMissing),
            DeliveryError::Unauthorized { .. } if entry.payload.member.is_none() => {
                return Ok(EntryResult::OwnerMissing);
            },
            DeliveryError::Storage(_) => return Err(error),
            _ => {},
        }

        let failed_at = self.clock.now_utc();
        let decision = RetryContext::new(
            entry.retry_count,
            error.clone(),
            failed_at,
            self.config.retry_policy.clone(),
        )
        .decide_retry();

        match decision {
            RetryDecision::Retry { next_attempt_at, retry_count } => {
                let message = error.to_string();
                self.store
                    .update_queued_scrobble_retry(
                        &entry.id,
                        retry_count,
                        Some(&message),
                        failed_at,
                        next_attempt_at,
                    )
                    .await?;
                warn!(
                    entry_id = %entry.id,
                    retry_count,
                    next_attempt_at = %next_attempt_at,
                    error = %error,
                    "redelivery failed, will retry"
                );
                Ok(EntryResult::Retried)
            },
            RetryDecision::GiveUp { reason } => {
                self.store.delete_queued_scrobble(&entry.id).await?;
                error!(
                    entry_id = %entry.id,
                    user_id = %entry.user_id,
                    event_id = %entry.payload.event.event_id,
                    member_id = ?entry.payload.member,
                    retry_count = entry.retry_count,
                    title = %entry.payload.event.media.display_title(),
                    status = ?error.status(),
                    error = %error,
                    reason = %reason,
                    "scrobble permanently dropped"
                );
                Ok(EntryResult::Dropped)
            },
        }
    }
}
