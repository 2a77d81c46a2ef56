//! Domain models and strongly-typed identifiers.
//!
//! Covers the user aggregate (tokens plus linked group members), the
//! normalized playback event handed over by the webhook decoder, the
//! dedup cache entry, and the durable retry queue entry.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest display name stored on a user record, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Opaque user identifier, stable across token renewals.
    UserId
);

uuid_id!(
    /// Identifier of a durable retry queue entry.
    QueueEntryId
);

uuid_id!(
    /// Identifier of a group member within its owning user.
    MemberId
);

/// Lowercases and trims an external account name for index lookups.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// A linked tracking account that receives broadcast copies of a scrobble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Member identifier
    pub id: MemberId,
    /// External username of the linked account
    pub username: String,
    /// User record holding this account's tokens
    pub credentials: UserId,
}

impl GroupMember {
    /// Creates a member pointing at the given credentials record.
    pub fn new(username: impl Into<String>, credentials: UserId) -> Self {
        Self { id: MemberId::new(), username: normalize_username(&username.into()), credentials }
    }
}

/// A relay user with its upstream OAuth credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Opaque identifier
    pub id: UserId,
    /// Normalized external username
    pub username: String,
    /// Upstream access token
    pub access_token: String,
    /// Upstream refresh token
    pub refresh_token: String,
    /// Optional display name, at most [`MAX_DISPLAY_NAME_CHARS`] characters
    #[serde(default)]
    pub display_name: Option<String>,
    /// Set when the display name was cut to fit the bound
    #[serde(default)]
    pub display_name_truncated: bool,
    /// When the token pair was last issued
    pub updated: DateTime<Utc>,
    /// Accounts receiving broadcast copies of this user's scrobbles
    #[serde(default)]
    pub group_members: Vec<GroupMember>,
}

impl User {
    /// Creates a user with a fresh identifier.
    pub fn new(
        username: &str,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        updated: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UserId::new(),
            username: normalize_username(username),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            display_name: None,
            display_name_truncated: false,
            updated,
            group_members: Vec::new(),
        }
    }

    /// Stores a display name, truncating it to the bound.
    ///
    /// Blank names clear the field.
    pub fn set_display_name(&mut self, raw: &str) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            self.display_name = None;
            self.display_name_truncated = false;
            return;
        }

        let truncated = trimmed.chars().count() > MAX_DISPLAY_NAME_CHARS;
        self.display_name = Some(trimmed.chars().take(MAX_DISPLAY_NAME_CHARS).collect());
        self.display_name_truncated = truncated;
    }

    /// Replaces the token pair and bumps the updated timestamp.
    pub fn rotate_tokens(
        &mut self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.access_token = access_token.into();
        self.refresh_token = refresh_token.into();
        self.updated = now;
    }

    /// Returns true when the access token is older than `max_age`.
    pub fn is_token_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return false;
        };
        now.signed_duration_since(self.updated) > max_age
    }

    /// Returns true when scrobbles fan out to linked accounts.
    pub fn is_group(&self) -> bool {
        !self.group_members.is_empty()
    }

    /// Finds a group member by identifier.
    pub fn member(&self, id: MemberId) -> Option<&GroupMember> {
        self.group_members.iter().find(|m| m.id == id)
    }
}

/// Playback state transitions reported by the media server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackAction {
    /// Playback started or resumed
    Start,
    /// Playback paused
    Pause,
    /// Playback stopped or finished
    Stop,
}

impl PlaybackAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for PlaybackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of media being played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Feature film
    Movie,
    /// Episode of a show
    Episode,
}

/// External catalogue identifiers for a media item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    /// Tracking service id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trakt: Option<u64>,
    /// IMDb id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb: Option<String>,
    /// TMDB id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmdb: Option<u64>,
    /// TVDB id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tvdb: Option<u64>,
}

/// Show metadata attached to an episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowInfo {
    /// Show title
    pub title: String,
    /// First-air year
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    /// Show identifiers
    #[serde(default)]
    pub ids: ExternalIds,
}

/// The content a playback event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    /// Movie or episode
    pub kind: MediaKind,
    /// Movie or episode title
    pub title: String,
    /// Release year
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    /// Item identifiers
    #[serde(default)]
    pub ids: ExternalIds,
    /// Parent show, for episodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show: Option<ShowInfo>,
    /// Season number, for episodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    /// Episode number within the season
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
}

impl MediaItem {
    /// Human-readable title used in logs and failure reports.
    pub fn display_title(&self) -> String {
        match (self.kind, &self.show) {
            (MediaKind::Episode, Some(show)) => format!(
                "{} S{:02}E{:02} - {}",
                show.title,
                self.season.unwrap_or(0),
                self.number.unwrap_or(0),
                self.title
            ),
            (_, _) => match self.year {
                Some(year) => format!("{} ({year})", self.title),
                None => self.title.clone(),
            },
        }
    }
}

/// Normalized playback event produced by the webhook decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    /// Correlation id carried through logs and failure reports
    pub event_id: Uuid,
    /// Relay user the webhook was addressed to
    pub user_id: UserId,
    /// Media-server account that produced the event
    pub account: String,
    /// Player instance identifier
    pub player_uuid: String,
    /// Media-server content rating key
    pub rating_key: String,
    /// Playback transition
    pub action: PlaybackAction,
    /// Playback position as a percentage
    pub progress: f64,
    /// Content being played
    pub media: MediaItem,
    /// When the decoder produced the event
    pub received_at: DateTime<Utc>,
}

impl PlaybackEvent {
    /// Identifier used to coalesce duplicate deliveries of this event.
    pub fn target_id(&self) -> String {
        format!("{}:{}:{}", self.user_id, self.rating_key, self.action)
    }
}

/// Dedup cache entry for one (player, content) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheItem {
    /// Player instance identifier
    pub player_uuid: String,
    /// Content rating key
    pub rating_key: String,
    /// Last forwarded action
    pub action: PlaybackAction,
    /// Last forwarded progress
    pub progress: f64,
    /// When the entry was written
    pub updated_at: DateTime<Utc>,
}

impl CacheItem {
    /// Records the event as forwarded at `now`.
    pub fn from_event(event: &PlaybackEvent, now: DateTime<Utc>) -> Self {
        Self {
            player_uuid: event.player_uuid.clone(),
            rating_key: event.rating_key.clone(),
            action: event.action,
            progress: event.progress,
            updated_at: now,
        }
    }

    /// Returns true when `event` repeats this entry within `window`.
    pub fn suppresses(&self, event: &PlaybackEvent, now: DateTime<Utc>, window: Duration) -> bool {
        let fresh = chrono::Duration::from_std(window)
            .map(|window| now.signed_duration_since(self.updated_at) < window)
            .unwrap_or(true);

        fresh && self.action == event.action && (self.progress - event.progress).abs() < 0.5
    }
}

/// Serialized payload of a retry queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedScrobble {
    /// The event to redeliver
    pub event: PlaybackEvent,
    /// Group member the retry targets; `None` for the owning user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<MemberId>,
}

/// Durable retry queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedScrobbleEvent {
    /// Unique entry identifier
    pub id: QueueEntryId,
    /// Owning user; the entry is only dequeued for this user
    pub user_id: UserId,
    /// Event and target to redeliver
    pub payload: QueuedScrobble,
    /// Failed redelivery attempts so far
    pub retry_count: u32,
    /// When the entry was enrolled
    pub enqueued_at: DateTime<Utc>,
    /// When redelivery was last attempted
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time of the next redelivery, once scheduled
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Error from the most recent failed attempt
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedScrobbleEvent {
    /// Creates a fresh entry for a failed delivery.
    pub fn new(
        user_id: UserId,
        event: PlaybackEvent,
        member: Option<MemberId>,
        last_error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: QueueEntryId::new(),
            user_id,
            payload: QueuedScrobble { event, member },
            retry_count: 0,
            enqueued_at: now,
            last_attempt_at: Some(now),
            next_attempt_at: None,
            last_error: Some(last_error.into()),
        }
    }

    /// Applies a failed retry, keeping the count monotonic.
    pub fn record_retry(
        &mut self,
        retry_count: u32,
        last_error: Option<&str>,
        at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) {
        self.retry_count = self.retry_count.max(retry_count);
        self.last_attempt_at = Some(at);
        self.next_attempt_at = Some(next_attempt_at);
        if let Some(error) = last_error {
            self.last_error = Some(error.to_string());
        }
    }
}

/// Aggregate view of one user's retry queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Number of pending entries
    pub size: usize,
    /// Enqueue time of the oldest pending entry
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
    /// Most recent failure recorded across entries
    pub last_error: Option<String>,
}

impl QueueStatus {
    /// Summarizes a user's pending entries.
    pub fn from_entries(entries: &[QueuedScrobbleEvent]) -> Self {
        let oldest_enqueued_at = entries.iter().map(|e| e.enqueued_at).min();
        let last_error = entries
            .iter()
            .filter(|e| e.last_error.is_some())
            .max_by_key(|e| e.last_attempt_at.unwrap_or(e.enqueued_at))
            .and_then(|e| e.last_error.clone());

        Self { size: entries.len(), oldest_enqueued_at, last_error }
    }

    /// Age of the oldest pending entry at `now`.
    pub fn oldest_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.oldest_enqueued_at.map(|oldest| now.signed_duration_since(oldest))
    }
}
