//! Builders for users and playback events with sensible defaults.

use chrono::{DateTime, Utc};
use scrobble_core::{
    ExternalIds, GroupMember, MediaItem, MediaKind, PlaybackAction, PlaybackEvent, ShowInfo,
    User, UserId,
};
use uuid::Uuid;

/// Builder for test users.
pub struct UserBuilder {
    username: String,
    access_token: String,
    refresh_token: String,
    display_name: Option<String>,
    updated: DateTime<Utc>,
    members: Vec<GroupMember>,
}

impl UserBuilder {
    /// Starts a user whose tokens were issued at `updated`.
    pub fn new(username: &str, updated: DateTime<Utc>) -> Self {
        Self {
            username: username.to_string(),
            access_token: format!("access-{username}"),
            refresh_token: format!("refresh-{username}"),
            display_name: None,
            updated,
            members: Vec::new(),
        }
    }

    /// Sets the access token.
    #[must_use]
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = token.into();
        self
    }

    /// Sets the refresh token.
    #[must_use]
    pub fn refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = token.into();
        self
    }

    /// Sets the display name, applying the usual truncation.
    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Links a group member backed by the credentials of `credentials`.
    #[must_use]
    pub fn member(mut self, username: &str, credentials: UserId) -> Self {
        self.members.push(GroupMember::new(username, credentials));
        self
    }

    /// Builds the user.
    pub fn build(self) -> User {
        let mut user =
            User::new(&self.username, self.access_token, self.refresh_token, self.updated);
        if let Some(name) = self.display_name {
            user.set_display_name(&name);
        }
        user.group_members = self.members;
        user
    }
}

/// Builder for normalized playback events.
///
/// Defaults to a movie at 50% progress on a fixed player.
pub struct PlaybackEventBuilder {
    user_id: UserId,
    account: String,
    player_uuid: String,
    rating_key: String,
    action: PlaybackAction,
    progress: f64,
    media: MediaItem,
    received_at: DateTime<Utc>,
}

impl PlaybackEventBuilder {
    /// Starts an event addressed to `user`.
    pub fn for_user(user: &User, received_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id,
            account: user.username.clone(),
            player_uuid: "player-1".to_string(),
            rating_key: "1001".to_string(),
            action: PlaybackAction::Start,
            progress: 50.0,
            media: MediaItem {
                kind: MediaKind::Movie,
                title: "Heat".to_string(),
                year: Some(1995),
                ids: ExternalIds { imdb: Some("tt0113277".to_string()), ..Default::default() },
                show: None,
                season: None,
                number: None,
            },
            received_at,
        }
    }

    /// Sets the media-server account name.
    #[must_use]
    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    /// Sets the player identifier.
    #[must_use]
    pub fn player(mut self, player_uuid: impl Into<String>) -> Self {
        self.player_uuid = player_uuid.into();
        self
    }

    /// Sets the content rating key.
    #[must_use]
    pub fn rating_key(mut self, rating_key: impl Into<String>) -> Self {
        self.rating_key = rating_key.into();
        self
    }

    /// Sets the action.
    #[must_use]
    pub fn action(mut self, action: PlaybackAction) -> Self {
        self.action = action;
        self
    }

    /// Sets the progress percentage.
    #[must_use]
    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    /// Switches the media to an episode.
    #[must_use]
    pub fn episode(mut self, show: &str, season: u32, number: u32, title: &str) -> Self {
        self.media = MediaItem {
            kind: MediaKind::Episode,
            title: title.to_string(),
            year: None,
            ids: ExternalIds::default(),
            show: Some(ShowInfo { title: show.to_string(), year: None, ids: ExternalIds::default() }),
            season: Some(season),
            number: Some(number),
        };
        self
    }

    /// Builds the event with a fresh correlation id.
    pub fn build(self) -> PlaybackEvent {
        PlaybackEvent {
            event_id: Uuid::new_v4(),
            user_id: self.user_id,
            account: self.account,
            player_uuid: self.player_uuid,
            rating_key: self.rating_key,
            action: self.action,
            progress: self.progress,
            media: self.media,
            received_at: self.received_at,
        }
    }
}
