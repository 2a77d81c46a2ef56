//! Wiring of store, upstream client, engine, and background tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use scrobble_core::{
    storage::{EmbeddedStore, PostgresStore, RedisStore},
    Clock, RealClock, Store,
};
use scrobble_delivery::{
    AuthStateRegistry, Authorizer, DeliveryEngine, HealthReport, HealthService, MultipleLock,
    QueueDrainer, TrackerApi, TraktClient,
};
use tracing::info;

use crate::config::{Config, StoreBackend};

/// An opened store plus the handle needed to release it on shutdown.
pub struct OpenedStore {
    /// Store shared by every component
    pub store: Arc<dyn Store>,
    postgres: Option<PostgresStore>,
}

impl OpenedStore {
    /// Wraps an already opened store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, postgres: None }
    }
}

/// Opens the configured backend, running migrations for Postgres.
pub async fn open_store(config: &Config) -> Result<OpenedStore> {
    let timeout = config.store_timeout();

    let opened = match config.store_backend {
        StoreBackend::Embedded => {
            let store = EmbeddedStore::open(&config.embedded_path)
                .with_context(|| format!("failed to open {}", config.embedded_path))?
                .with_timeout(timeout);
            OpenedStore::new(Arc::new(store))
        },
        StoreBackend::Redis => {
            let url = config.redis_url.as_deref().context("redis_url is not set")?;
            let store = RedisStore::connect_with_prefix(url, &config.redis_prefix)
                .await
                .context("failed to connect to redis")?
                .with_timeout(timeout);
            OpenedStore::new(Arc::new(store))
        },
        StoreBackend::Postgres => {
            let url = config.database_url.as_deref().context("database_url is not set")?;
            let store = PostgresStore::connect(url, config.database_max_connections)
                .await
                .context("failed to connect to postgres")?
                .with_timeout(timeout);
            store.migrate().await.context("failed to migrate postgres schema")?;
            OpenedStore { store: Arc::new(store.clone()), postgres: Some(store) }
        },
    };

    info!(
        backend = opened.store.backend(),
        location = %config.store_url_masked(),
        "store opened"
    );
    Ok(opened)
}

/// A running relay: delivery engine, queue drainer, and authorization flow.
pub struct Relay {
    store: OpenedStore,
    engine: DeliveryEngine,
    drainer: QueueDrainer,
    authorizer: Authorizer,
    health: HealthService,
    config: Config,
}

impl Relay {
    /// Opens the configured store, builds the upstream client, and starts
    /// the queue drainer.
    pub async fn start(config: Config) -> Result<Self> {
        let store = open_store(&config).await?;
        let api = TraktClient::new(config.to_client_config())
            .context("failed to build upstream client")?;

        let mut relay = Self::assemble(config, store, Arc::new(api), Arc::new(RealClock::new()));
        relay.drainer.start();
        Ok(relay)
    }

    /// Builds a relay from explicit parts without starting background tasks.
    pub fn assemble(
        config: Config,
        store: OpenedStore,
        api: Arc<dyn TrackerApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = Arc::new(MultipleLock::new());
        let engine = DeliveryEngine::new(
            Arc::clone(&store.store),
            Arc::clone(&api),
            Arc::clone(&locks),
            Arc::clone(&clock),
            config.to_delivery_config(),
        );
        let drainer = QueueDrainer::new(
            Arc::clone(&store.store),
            engine.clone(),
            Arc::clone(&clock),
            config.to_drainer_config(),
        );
        let authorizer = Authorizer::new(
            Arc::clone(&store.store),
            api,
            locks,
            Arc::new(AuthStateRegistry::new(Arc::clone(&clock))),
            Arc::clone(&clock),
        );
        let health = HealthService::new(clock);

        Self { store, engine, drainer, authorizer, health, config }
    }

    /// Delivery engine for inbound playback events.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Retry queue drainer.
    pub fn drainer(&self) -> &QueueDrainer {
        &self.drainer
    }

    /// Authorization flow.
    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    /// Shared store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store.store
    }

    /// Probes the store.
    pub async fn health(&self) -> HealthReport {
        self.health.check(self.store.store.as_ref()).await
    }

    /// Stops background work and releases store connections.
    pub async fn shutdown(self) {
        info!("shutting down relay");

        self.drainer.shutdown(self.config.shutdown_timeout()).await;

        let expired = self.authorizer.states().sweep_expired().await;
        if expired > 0 {
            info!(expired, "discarded expired authorization states");
        }

        if let Some(postgres) = self.store.postgres {
            postgres.close().await;
            info!("postgres pool closed");
        }

        let stats = self.engine.stats().await;
        info!(
            received = stats.events_received,
            delivered = stats.delivered,
            queued = stats.queued,
            dropped = stats.dropped,
            "relay stopped"
        );
    }
}
