//! bastion daemon entry point.
//!
//! Loads configuration, wires the access layer, and runs the maintenance
//! sweep until Ctrl-C. Logs are JSON on stderr.

use anyhow::{Context, Result};
use bastion_core::AppConfig;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

mod app;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load().context("loading configuration")?;
    tracing::info!(
        db_path = %config.db_path.display(),
        egress = config.egress.enabled,
        backend = %config.session.backend,
        "starting bastion"
    );

    let app = app::build(&config).await?;

    let health = app.gateway.health_stats().await?;
    tracing::info!(
        entries = health.cache.total_entries,
        expired = health.cache.expired_entries,
        searches = health.cache.search_total,
        "cache opened"
    );

    let shutdown = Arc::new(Notify::new());
    let sweep = app.gateway.scheduler().clone().spawn(shutdown.clone());

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");

    shutdown.notify_one();
    if let Err(e) = sweep.await {
        tracing::warn!("maintenance task ended abnormally: {e}");
    }
    app.sessions.destroy_all().await;

    let stats = app.gateway.job_stats().await;
    tracing::info!(runs = stats.runs, failures = stats.failures, "bastion stopped");
    Ok(())
}
