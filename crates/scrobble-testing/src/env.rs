use std::{sync::Arc, time::Duration};

use anyhow::Result;
use scrobble_core::{storage::EmbeddedStore, Clock, Store, TestClock, User};
use scrobble_delivery::{
    AuthStateRegistry, Authorizer, DeliveryConfig, DeliveryEngine, DrainerConfig, MultipleLock,
    QueueDrainer, RetryPolicy,
};

use crate::fake::FakeTrackerApi;

/// In-memory store, manual clock and fake upstream wired together.
pub struct TestEnv {
    /// Manual clock shared by every component
    pub clock: TestClock,
    /// In-memory embedded store
    pub store: Arc<EmbeddedStore>,
    /// Scriptable upstream
    pub api: Arc<FakeTrackerApi>,
    /// Lock registry shared by engine and authorizer
    pub locks: Arc<MultipleLock>,
}

impl TestEnv {
    /// Creates a fresh environment.
    pub fn new() -> Result<Self> {
        Ok(Self {
            clock: TestClock::new(),
            store: Arc::new(EmbeddedStore::open_in_memory()?),
            api: Arc::new(FakeTrackerApi::new()),
            locks: Arc::new(MultipleLock::new()),
        })
    }

    /// Store as a trait object.
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Clock as a trait object.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// Engine with default configuration.
    pub fn engine(&self) -> DeliveryEngine {
        self.engine_with(DeliveryConfig::default())
    }

    /// Engine with a custom configuration.
    pub fn engine_with(&self, config: DeliveryConfig) -> DeliveryEngine {
        DeliveryEngine::new(self.store(), self.api.clone(), self.locks.clone(), self.clock(), config)
    }

    /// Drainer with deterministic backoff: fixed `base_delay`, no jitter.
    pub fn drainer(&self, max_retries: u32, base_delay: Duration) -> QueueDrainer {
        let config = DrainerConfig {
            retry_policy: RetryPolicy {
                max_retries,
                base_delay,
                max_delay: base_delay,
                jitter_factor: 0.0,
                ..RetryPolicy::default()
            },
            ..DrainerConfig::default()
        };
        QueueDrainer::new(self.store(), self.engine(), self.clock(), config)
    }

    /// Authorizer with a fresh state registry.
    pub fn authorizer(&self) -> Authorizer {
        Authorizer::new(
            self.store(),
            self.api.clone(),
            self.locks.clone(),
            Arc::new(AuthStateRegistry::new(self.clock())),
            self.clock(),
        )
    }

    /// Persists `user` and returns it.
    pub async fn insert_user(&self, user: User) -> Result<User> {
        self.store.write_user(&user).await?;
        Ok(user)
    }
}
