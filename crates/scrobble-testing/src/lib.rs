//! Test infrastructure for the scrobble relay.
//!
//! Provides fixture builders, a scriptable in-process upstream, a store
//! conformance suite shared by every backend, and a [`TestEnv`] that wires
//! an in-memory store, a manual clock and the fake upstream together.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod conformance;
pub mod fake;
pub mod fixtures;

mod env;

pub use conformance::exercise_store;
pub use env::TestEnv;
pub use fake::FakeTrackerApi;
pub use fixtures::{PlaybackEventBuilder, UserBuilder};
pub use scrobble_core::TestClock;
