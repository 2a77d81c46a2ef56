//! Scrobble delivery engine.
//!
//! Turns a normalized playback event into upstream scrobble calls:
//!
//! ```text
//! event ─▶ Coalescer ─▶ dedup cache ─▶ TokenManager ─▶ TrackerApi
//!                                                          │
//!                                  retryable failure ◀─────┘
//!                                          │
//!                                          ▼
//!                                   Store retry queue
//! ```
//!
//! Users with group members broadcast: every member is delivered to
//! independently and the result enumerates each member's outcome. Each
//! retryable failure becomes one queue entry scoped to the owning user.
//! Fatal failures are logged with full context and dropped.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use scrobble_core::{
    normalize_username, CacheItem, Clock, GroupMember, MemberId, PlaybackEvent, QueueEntryId,
    QueuedScrobbleEvent, Store, User, UserId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    client::{ScrobbleReceipt, TrackerApi},
    coalesce::Coalescer,
    error::{Classification, DeliveryError, Result},
    lock::MultipleLock,
    token::{TokenManager, DEFAULT_REFRESH_AFTER},
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Window in which a repeated event for the same player and content is
    /// suppressed.
    pub dedup_window: Duration,

    /// Collapse concurrent identical events into one execution.
    pub coalesce: bool,

    /// Age after which access tokens are refreshed before use.
    pub token_refresh_after: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            dedup_window: scrobble_core::storage::DEDUP_CACHE_TTL,
            coalesce: true,
            token_refresh_after: DEFAULT_REFRESH_AFTER,
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Events handed to the engine since startup.
    pub events_received: u64,
    /// Successful upstream submissions, including redeliveries.
    pub delivered: u64,
    /// Events suppressed by the dedup cache.
    pub duplicates: u64,
    /// Failures enrolled in the retry queue.
    pub queued: u64,
    /// Failures dropped as fatal.
    pub dropped: u64,
    /// Users removed after a failed refresh.
    pub unauthorized: u64,
}

/// Failure of one group member during a broadcast.
#[derive(Debug, Clone)]
pub struct MemberFailure {
    /// Member that failed
    pub member_id: MemberId,
    /// Member's external username
    pub username: String,
    /// Underlying error
    pub error: DeliveryError,
    /// HTTP status, when the upstream answered
    pub status: Option<u16>,
    /// Correlating event id
    pub event_id: Uuid,
    /// Human-readable media title
    pub title: String,
    /// Retry queue entry created for this failure
    pub queued_entry: Option<QueueEntryId>,
}

/// Result of delivering to one group member.
#[derive(Debug, Clone)]
pub enum MemberOutcome {
    /// The member received the scrobble.
    Delivered {
        /// Member that received it
        member_id: MemberId,
        /// Member's external username
        username: String,
        /// Upstream status
        status_code: u16,
    },
    /// Delivery to the member failed.
    Failed(MemberFailure),
}

impl MemberOutcome {
    /// Member this outcome belongs to.
    pub fn member_id(&self) -> MemberId {
        match self {
            Self::Delivered { member_id, .. } => *member_id,
            Self::Failed(failure) => failure.member_id,
        }
    }

    /// Returns true when the member received the scrobble.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Per-member outcomes of a broadcast, in group order.
#[derive(Debug, Clone)]
pub struct BroadcastReport {
    /// Correlating event id
    pub event_id: Uuid,
    /// Human-readable media title
    pub title: String,
    /// One outcome per group member
    pub outcomes: Vec<MemberOutcome>,
}

impl BroadcastReport {
    /// Members that failed.
    pub fn failures(&self) -> impl Iterator<Item = &MemberFailure> {
        self.outcomes.iter().filter_map(|o| match o {
            MemberOutcome::Failed(failure) => Some(failure),
            MemberOutcome::Delivered { .. } => None,
        })
    }

    /// Number of members that received the scrobble.
    pub fn delivered_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_delivered()).count()
    }

    /// Number of queue entries enrolled for retry.
    pub fn queued_count(&self) -> usize {
        self.failures().filter(|f| f.queued_entry.is_some()).count()
    }
}

/// What happened to an inbound event.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Submitted to the upstream.
    Delivered {
        /// Upstream status
        status_code: u16,
    },
    /// Failed transiently and enrolled for retry.
    Queued {
        /// Retry queue entry
        entry_id: QueueEntryId,
        /// Error that caused the retry
        error: DeliveryError,
    },
    /// Rejected permanently by the upstream and dropped.
    Dropped {
        /// Rejection
        error: DeliveryError,
    },
    /// Fanned out to group members.
    Broadcast(BroadcastReport),
    /// Already forwarded recently for this player and content.
    Duplicate,
    /// Not relevant to this user.
    Ignored {
        /// Why the event was ignored
        reason: String,
    },
}

/// Coordinates token refresh, upstream submission, dedup, and retry
/// enrollment for playback events.
#[derive(Clone)]
pub struct DeliveryEngine {
    store: Arc<dyn Store>,
    api: Arc<dyn TrackerApi>,
    tokens: TokenManager,
    clock: Arc<dyn Clock>,
    coalescer: Arc<Coalescer<DeliveryOutcome>>,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("backend", &self.store.backend())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    /// Creates an engine over the given store and upstream client.
    pub fn new(
        store: Arc<dyn Store>,
        api: Arc<dyn TrackerApi>,
        locks: Arc<MultipleLock>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        let tokens =
            TokenManager::new(Arc::clone(&store), Arc::clone(&api), locks, Arc::clone(&clock))
                .with_refresh_after(config.token_refresh_after);

        Self {
            store,
            api,
            tokens,
            clock,
            coalescer: Arc::new(Coalescer::new(config.coalesce)),
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
        }
    }

    /// Token manager shared with the engine.
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Handles an inbound playback event.
    ///
    /// Concurrent calls for the same account and target share one execution.
    ///
    /// # Errors
    ///
    /// Returns `UnknownUser` when the addressed user does not exist,
    /// `Unauthorized` when its token refresh failed, and `Storage` when the
    /// store is unavailable. Upstream failures are reported through the
    /// outcome instead.
    pub async fn handle_event(&self, event: PlaybackEvent) -> Result<DeliveryOutcome> {
        let key = Coalescer::<DeliveryOutcome>::key(&event.account, &event.target_id());
        let engine = self.clone();
        self.coalescer.run(&key, async move { engine.process(event).await }).await
    }

    async fn process(&self, event: PlaybackEvent) -> Result<DeliveryOutcome> {
        let span = info_span!(
            "handle_event",
            event_id = %event.event_id,
            user_id = %event.user_id,
            action = %event.action,
            rating_key = %event.rating_key
        );

        async move {
            self.stats.write().await.events_received += 1;

            let Some(owner) = self.store.get_user(&event.user_id).await? else {
                warn!("event addressed to unknown user");
                return Err(DeliveryError::unknown_user(event.user_id));
            };

            if normalize_username(&event.account) != owner.username {
                debug!(account = %event.account, "event from another account ignored");
                return Ok(DeliveryOutcome::Ignored {
                    reason: format!("account {} does not belong to this user", event.account),
                });
            }

            if self.is_duplicate(&event).await {
                self.stats.write().await.duplicates += 1;
                debug!("duplicate event suppressed");
                return Ok(DeliveryOutcome::Duplicate);
            }

            if owner.is_group() {
                let report = self.broadcast(&owner, &event).await;
                if report.delivered_count() > 0 {
                    self.remember(&event).await;
                }
                return Ok(DeliveryOutcome::Broadcast(report));
            }

            self.deliver_single(&event).await
        }
        .instrument(span)
        .await
    }

    async fn deliver_single(&self, event: &PlaybackEvent) -> Result<DeliveryOutcome> {
        let result = self.send_as_user(&event.user_id, event).await;

        match result {
            Ok(receipt) => {
                self.record_success(event, receipt.status_code).await;
                self.remember(event).await;
                Ok(DeliveryOutcome::Delivered { status_code: receipt.status_code })
            },
            Err(error) => match error.classification() {
                Some(Classification::Retryable) => {
                    let entry_id = self.enqueue(event.user_id, event, None, &error).await?;
                    Ok(DeliveryOutcome::Queued { entry_id, error })
                },
                Some(Classification::Fatal) => {
                    self.record_drop(event, None, &error).await;
                    Ok(DeliveryOutcome::Dropped { error })
                },
                None => {
                    if matches!(error, DeliveryError::Unauthorized { .. }) {
                        self.stats.write().await.unauthorized += 1;
                    }
                    Err(error)
                },
            },
        }
    }

    /// Delivers to every member of `owner`'s group independently.
    ///
    /// A failing member never blocks the others. Retryable member failures
    /// are enrolled as queue entries owned by `owner` and carrying the
    /// member id.
    pub async fn broadcast(&self, owner: &User, event: &PlaybackEvent) -> BroadcastReport {
        let title = event.media.display_title();
        let sends = owner.group_members.iter().map(|member| self.send_to_member(member, event));
        let results = join_all(sends).await;

        let mut outcomes = Vec::with_capacity(results.len());
        for (member, result) in owner.group_members.iter().zip(results) {
            let outcome = match result {
                Ok(receipt) => {
                    self.record_success(event, receipt.status_code).await;
                    MemberOutcome::Delivered {
                        member_id: member.id,
                        username: member.username.clone(),
                        status_code: receipt.status_code,
                    }
                },
                Err(error) => {
                    let queued_entry = self.handle_member_failure(owner, member, event, &error).await;
                    MemberOutcome::Failed(MemberFailure {
                        member_id: member.id,
                        username: member.username.clone(),
                        status: error.status(),
                        error,
                        event_id: event.event_id,
                        title: title.clone(),
                        queued_entry,
                    })
                },
            };
            outcomes.push(outcome);
        }

        let report = BroadcastReport { event_id: event.event_id, title, outcomes };
        info!(
            members = report.outcomes.len(),
            delivered = report.delivered_count(),
            queued = report.queued_count(),
            "broadcast finished"
        );
        report
    }

    async fn handle_member_failure(
        &self,
        owner: &User,
        member: &GroupMember,
        event: &PlaybackEvent,
        error: &DeliveryError,
    ) -> Option<QueueEntryId> {
        if !error.is_retryable() {
            if matches!(error, DeliveryError::Unauthorized { .. }) {
                self.stats.write().await.unauthorized += 1;
            }
            self.record_drop(event, Some(member), error).await;
            return None;
        }

        match self.enqueue(owner.id, event, Some(member), error).await {
            Ok(entry_id) => Some(entry_id),
            Err(enqueue_error) => {
                error!(
                    member_id = %member.id,
                    member = %member.username,
                    error = %enqueue_error,
                    "failed to enqueue member retry, scrobble lost"
                );
                None
            },
        }
    }

    /// Redelivers a queued entry through the live delivery path.
    ///
    /// Nothing is enqueued on failure; the caller owns the entry's fate.
    pub async fn redeliver(&self, entry: &QueuedScrobbleEvent) -> Result<ScrobbleReceipt> {
        let event = &entry.payload.event;
        let span = info_span!(
            "redeliver",
            entry_id = %entry.id,
            event_id = %event.event_id,
            user_id = %entry.user_id,
            retry_count = entry.retry_count
        );

        async move {
            let receipt = match entry.payload.member {
                None => self.send_as_user(&entry.user_id, event).await?,
                Some(member_id) => {
                    let Some(owner) = self.store.get_user(&entry.user_id).await? else {
                        return Err(DeliveryError::unknown_user(entry.user_id));
                    };
                    let Some(member) = owner.member(member_id) else {
                        return Err(DeliveryError::MissingCredentials { member: member_id.to_string() });
                    };
                    self.send_to_member(member, event).await?
                },
            };

            self.record_success(event, receipt.status_code).await;
            self.remember(event).await;
            Ok(receipt)
        }
        .instrument(span)
        .await
    }

    async fn send_as_user(&self, user_id: &UserId, event: &PlaybackEvent) -> Result<ScrobbleReceipt> {
        let Some(lease) = self.tokens.lease(user_id).await? else {
            return Err(DeliveryError::unknown_user(user_id));
        };
        self.api.scrobble(&lease.user.access_token, event).await
    }

    async fn send_to_member(
        &self,
        member: &GroupMember,
        event: &PlaybackEvent,
    ) -> Result<ScrobbleReceipt> {
        let Some(lease) = self.tokens.lease(&member.credentials).await? else {
            return Err(DeliveryError::MissingCredentials { member: member.username.clone() });
        };
        self.api.scrobble(&lease.user.access_token, event).await
    }

    async fn enqueue(
        &self,
        owner: UserId,
        event: &PlaybackEvent,
        member: Option<&GroupMember>,
        error: &DeliveryError,
    ) -> Result<QueueEntryId> {
        let now = self.clock.now_utc();
        let mut entry =
            QueuedScrobbleEvent::new(owner, event.clone(), member.map(|m| m.id), error.to_string(), now);
        // Upstream rate limits schedule the first redelivery.
        entry.next_attempt_at = error
            .retry_after_seconds()
            .and_then(|seconds| i64::try_from(seconds).ok())
            .map(|seconds| now + chrono::Duration::seconds(seconds));
        self.store.enqueue_scrobble(&entry).await?;

        self.stats.write().await.queued += 1;
        warn!(
            entry_id = %entry.id,
            user_id = %owner,
            member = member.map(|m| m.username.as_str()),
            status = ?error.status(),
            error = %error,
            "delivery failed transiently, queued for retry"
        );
        Ok(entry.id)
    }

    async fn record_success(&self, event: &PlaybackEvent, status_code: u16) {
        self.stats.write().await.delivered += 1;
        info!(
            event_id = %event.event_id,
            action = %event.action,
            status = status_code,
            title = %event.media.display_title(),
            "scrobble delivered"
        );
    }

    async fn record_drop(
        &self,
        event: &PlaybackEvent,
        member: Option<&GroupMember>,
        error: &DeliveryError,
    ) {
        self.stats.write().await.dropped += 1;
        error!(
            event_id = %event.event_id,
            user_id = %event.user_id,
            member = member.map(|m| m.username.as_str()),
            status = ?error.status(),
            code = ?error.upstream_code(),
            category = %error.category(),
            title = %event.media.display_title(),
            error = %error,
            "scrobble rejected, dropping"
        );
    }

    async fn is_duplicate(&self, event: &PlaybackEvent) -> bool {
        match self.store.get_scrobble_body(&event.player_uuid, &event.rating_key).await {
            Ok(Some(item)) => item.suppresses(event, self.clock.now_utc(), self.config.dedup_window),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "dedup cache read failed, delivering anyway");
                false
            },
        }
    }

    async fn remember(&self, event: &PlaybackEvent) {
        let item = CacheItem::from_event(event, self.clock.now_utc());
        if let Err(e) = self.store.write_scrobble_body(&item).await {
            warn!(error = %e, "dedup cache write failed");
        }
    }
}
