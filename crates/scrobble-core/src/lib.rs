//! Core domain models, time source, and pluggable persistence.
//!
//! Every other crate in the relay depends on these types: user records,
//! playback events, retry queue entries, the [`Clock`] abstraction, and the
//! [`Store`] capability trait with its embedded, Redis, and PostgreSQL
//! backends.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{Result, StoreError};
pub use models::{
    normalize_username, CacheItem, ExternalIds, GroupMember, MediaItem, MediaKind, MemberId,
    PlaybackAction, PlaybackEvent, QueueEntryId, QueueStatus, QueuedScrobble, QueuedScrobbleEvent,
    ShowInfo, User, UserId, MAX_DISPLAY_NAME_CHARS,
};
pub use storage::Store;
pub use time::{Clock, RealClock, TestClock};
