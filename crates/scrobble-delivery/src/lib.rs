//! Scrobble delivery for the relay.
//!
//! Takes normalized playback events, resolves the addressed user, keeps its
//! upstream OAuth token fresh, and submits the scrobble. Transient upstream
//! failures are enrolled in the durable retry queue and redelivered by the
//! [`QueueDrainer`]; permanent rejections are logged and dropped.
//!
//! # Architecture
//!
//! 1. **Coalesce** - concurrent identical events share one execution
//! 2. **Dedup** - repeats of the last forwarded action are suppressed
//! 3. **Lease** - the user is locked and its token refreshed if stale
//! 4. **Submit** - one upstream call, or one per member for group users
//! 5. **Classify** - 429/502/503/504 and network failures are retried
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use scrobble_core::{storage::EmbeddedStore, RealClock};
//! use scrobble_delivery::{
//!     ClientConfig, DeliveryConfig, DeliveryEngine, DeliveryError, MultipleLock, TraktClient,
//! };
//!
//! # fn example() -> Result<(), DeliveryError> {
//! let store = Arc::new(EmbeddedStore::open_in_memory()?);
//! let api = Arc::new(TraktClient::new(ClientConfig::default())?);
//! let engine = DeliveryEngine::new(
//!     store,
//!     api,
//!     Arc::new(MultipleLock::new()),
//!     Arc::new(RealClock::new()),
//!     DeliveryConfig::default(),
//! );
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod client;
pub mod coalesce;
pub mod drainer;
pub mod engine;
pub mod error;
pub mod health;
pub mod lock;
pub mod retry;
pub mod token;

pub use auth::{AuthMode, AuthState, AuthStateRegistry, Authorizer};
pub use client::{ClientConfig, ScrobbleReceipt, TokenGrant, TrackerApi, TraktClient};
pub use coalesce::Coalescer;
pub use drainer::{DrainReport, DrainerConfig, QueueDrainer};
pub use engine::{
    BroadcastReport, DeliveryConfig, DeliveryEngine, DeliveryOutcome, EngineStats, MemberFailure,
    MemberOutcome,
};
pub use error::{classify, Classification, DeliveryError, ErrorCategory, Result};
pub use health::{HealthReport, HealthService, HealthStatus};
pub use lock::MultipleLock;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use token::TokenManager;

/// Default interval between queue sweeps.
pub const DEFAULT_DRAIN_INTERVAL_SECONDS: u64 = 60;

/// Default entries redelivered per user per sweep.
pub const DEFAULT_DRAIN_BATCH_SIZE: usize = 50;

/// Default upstream request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
