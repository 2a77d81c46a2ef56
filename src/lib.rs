//! Scrobble relay service.
//!
//! Loads [`Config`], opens the configured store, and runs the delivery
//! engine and retry-queue drainer until shutdown.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod runtime;

pub use config::{Config, StoreBackend};
pub use runtime::{open_store, OpenedStore, Relay};
