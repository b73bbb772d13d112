//! Headless host binary for stdin/stdout JSON communication.
//!
//! Reads `CommandEnvelope` messages as newline-delimited JSON from stdin,
//! feeds them to the scheduling engine, and writes `ResponseEnvelope` and
//! `EventEnvelope` messages to stdout.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use std::sync::Arc;

use anyhow::Context;
use cadence::host::stdio::run_stdio_bridge;
use cadence::{EngineConfig, SqliteStateStore, paths};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing to stderr only (stdout is reserved for the JSON
    // protocol).
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("cadence-host starting");

    let config_path = paths::config_file();
    let config = if config_path.exists() {
        EngineConfig::from_file(&config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?
    } else {
        tracing::info!(path = %config_path.display(), "no config file; using defaults");
        EngineConfig::default()
    };

    let db_path = paths::database_file();
    let store = SqliteStateStore::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "state store opened");

    run_stdio_bridge(config, Arc::new(store))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "cadence-host exited with error");
            anyhow::anyhow!("cadence-host failed: {e}")
        })?;

    tracing::info!("cadence-host shut down cleanly");
    Ok(())
}
