//! Scrobble relay service.
//!
//! Main entry point. Initializes logging, opens the store, and runs the
//! relay until CTRL+C or SIGTERM.

use anyhow::{Context, Result};
use scrobble_relay::{Config, Relay};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        backend = ?config.store_backend,
        store = %config.store_url_masked(),
        drain_interval_secs = config.drain_interval_secs,
        retry_max = config.retry_max,
        "configuration loaded"
    );

    let relay = Relay::start(config).await?;

    let health = relay.health().await;
    if health.is_healthy() {
        info!(backend = health.checks.store.backend, "scrobble relay ready");
    } else {
        warn!(
            backend = health.checks.store.backend,
            message = health.checks.store.message.as_deref(),
            "store unhealthy at startup"
        );
    }

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    relay.shutdown().await;
    info!("scrobble relay shutdown complete");
    Ok(())
}

/// Initializes tracing. `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C signal");
        },
        () = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
