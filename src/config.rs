//! Relay configuration.

use std::{path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use scrobble_delivery::{
    retry::{BackoffStrategy, RetryPolicy},
    ClientConfig, DeliveryConfig, DrainerConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "relay.toml";
const ENV_PREFIX: &str = "RELAY_";

/// Store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Single-file embedded database
    Embedded,
    /// Redis server
    Redis,
    /// PostgreSQL server
    Postgres,
}

/// Complete relay configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `RELAY_` (e.g. `RELAY_STORE_BACKEND`)
/// 2. Configuration file (`relay.toml`)
/// 3. Built-in defaults
///
/// Defaults run against an embedded store in `data/relay.db`; only the
/// upstream client credentials have to be supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Store
    /// Which backend to persist to.
    pub store_backend: StoreBackend,
    /// Path of the embedded store file.
    pub embedded_path: String,
    /// Redis connection URL, required for the redis backend.
    pub redis_url: Option<String>,
    /// Key namespace inside Redis.
    pub redis_prefix: String,
    /// PostgreSQL connection URL, required for the postgres backend.
    pub database_url: Option<String>,
    /// Maximum PostgreSQL pool size.
    pub database_max_connections: u32,
    /// Per-operation store timeout in milliseconds.
    pub store_timeout_ms: u64,

    // Upstream
    /// OAuth client id.
    pub trakt_client_id: String,
    /// OAuth client secret.
    pub trakt_client_secret: String,
    /// OAuth redirect URI registered with the upstream.
    pub trakt_redirect_uri: String,
    /// Upstream API base URL.
    pub trakt_base_url: String,
    /// Upstream request timeout in seconds.
    pub upstream_timeout_secs: u64,
    /// Display-name lookup timeout in seconds.
    pub display_name_timeout_secs: u64,

    // Delivery
    /// Token age in hours after which it is refreshed before use.
    pub token_refresh_after_hours: u64,
    /// Dedup window in seconds.
    pub dedup_window_secs: u64,
    /// Collapse concurrent identical events.
    pub coalesce_requests: bool,

    // Retry queue
    /// Seconds between queue sweeps.
    pub drain_interval_secs: u64,
    /// Entries redelivered per user per sweep.
    pub drain_batch_size: usize,
    /// Failed redeliveries before an entry is dropped.
    pub retry_max: u32,
    /// Base backoff delay in seconds.
    pub retry_base_delay_secs: u64,
    /// Backoff ceiling in seconds.
    pub retry_max_delay_secs: u64,
    /// Jitter applied to backoff delays (0.0 to 1.0).
    pub retry_jitter_factor: f64,
    /// Grace period for background tasks on shutdown, in seconds.
    pub shutdown_timeout_secs: u64,

    // Logging
    /// Filter used when `RUST_LOG` is unset.
    pub rust_log: String,
}

impl Config {
    /// Loads defaults, `relay.toml` if present, then `RELAY_*` variables.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Like [`Config::load`] with an explicit configuration file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .context("failed to load configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        match self.store_backend {
            StoreBackend::Embedded if self.embedded_path.trim().is_empty() => {
                bail!("embedded_path must be set for the embedded backend")
            },
            StoreBackend::Redis if self.redis_url.as_deref().unwrap_or("").is_empty() => {
                bail!("redis_url must be set for the redis backend")
            },
            StoreBackend::Postgres if self.database_url.as_deref().unwrap_or("").is_empty() => {
                bail!("database_url must be set for the postgres backend")
            },
            _ => {},
        }

        if self.store_backend == StoreBackend::Postgres && self.database_max_connections == 0 {
            bail!("database_max_connections must be greater than 0");
        }

        if self.store_timeout_ms == 0 {
            bail!("store_timeout_ms must be greater than 0");
        }

        if self.trakt_client_id.trim().is_empty() || self.trakt_client_secret.trim().is_empty() {
            bail!("trakt_client_id and trakt_client_secret must be set");
        }

        if self.upstream_timeout_secs == 0 || self.display_name_timeout_secs == 0 {
            bail!("upstream timeouts must be greater than 0");
        }

        if self.token_refresh_after_hours == 0 || self.token_refresh_after_hours >= 24 {
            bail!("token_refresh_after_hours must be between 1 and 23");
        }

        if self.dedup_window_secs == 0 {
            bail!("dedup_window_secs must be greater than 0");
        }

        if self.drain_interval_secs == 0 {
            bail!("drain_interval_secs must be greater than 0");
        }

        if self.drain_batch_size == 0 {
            bail!("drain_batch_size must be greater than 0");
        }

        if self.retry_base_delay_secs > self.retry_max_delay_secs {
            bail!("retry_base_delay_secs cannot exceed retry_max_delay_secs");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        Ok(())
    }

    /// Per-operation store timeout.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Grace period for background tasks on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Upstream client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.trakt_base_url.clone(),
            client_id: self.trakt_client_id.clone(),
            client_secret: self.trakt_client_secret.clone(),
            redirect_uri: self.trakt_redirect_uri.clone(),
            timeout: Duration::from_secs(self.upstream_timeout_secs),
            display_name_timeout: Duration::from_secs(self.display_name_timeout_secs),
            ..ClientConfig::default()
        }
    }

    /// Delivery engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            dedup_window: Duration::from_secs(self.dedup_window_secs),
            coalesce: self.coalesce_requests,
            token_refresh_after: Duration::from_secs(self.token_refresh_after_hours * 60 * 60),
        }
    }

    /// Retry policy applied by the queue drainer.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Queue drainer configuration.
    pub fn to_drainer_config(&self) -> DrainerConfig {
        DrainerConfig {
            interval: Duration::from_secs(self.drain_interval_secs),
            batch_size: self.drain_batch_size,
            retry_policy: self.to_retry_policy(),
            shutdown_timeout: self.shutdown_timeout(),
        }
    }

    /// Store location with any password masked, for logging.
    pub fn store_url_masked(&self) -> String {
        match self.store_backend {
            StoreBackend::Embedded => format!("embedded://{}", self.embedded_path),
            StoreBackend::Redis => mask_password(self.redis_url.as_deref().unwrap_or_default()),
            StoreBackend::Postgres => {
                mask_password(self.database_url.as_deref().unwrap_or_default())
            },
        }
    }
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        let scheme_end = url.find("://").map_or(0, |i| i + 3);
        if let Some(colon_pos) = url[scheme_end..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(scheme_end + colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}

impl Default for Config {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let client = ClientConfig::default();

        Self {
            store_backend: StoreBackend::Embedded,
            embedded_path: "data/relay.db".to_string(),
            redis_url: None,
            redis_prefix: "scrobble".to_string(),
            database_url: None,
            database_max_connections: 10,
            store_timeout_ms: 5_000,
            trakt_client_id: String::new(),
            trakt_client_secret: String::new(),
            trakt_redirect_uri: String::new(),
            trakt_base_url: client.base_url,
            upstream_timeout_secs: client.timeout.as_secs(),
            display_name_timeout_secs: client.display_name_timeout.as_secs(),
            token_refresh_after_hours: 23,
            dedup_window_secs: 3 * 60 * 60,
            coalesce_requests: true,
            drain_interval_secs: scrobble_delivery::DEFAULT_DRAIN_INTERVAL_SECONDS,
            drain_batch_size: scrobble_delivery::DEFAULT_DRAIN_BATCH_SIZE,
            retry_max: retry.max_retries,
            retry_base_delay_secs: retry.base_delay.as_secs(),
            retry_max_delay_secs: retry.max_delay.as_secs(),
            retry_jitter_factor: retry.jitter_factor,
            shutdown_timeout_secs: 30,
            rust_log: "info,scrobble_delivery=debug".to_string(),
        }
    }
}
