//! tillsync-background - one background sync pass.
//!
//! Meant to be invoked by a scheduler whether or not a POS instance is
//! running. Exits non-zero if the pass fails.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tillsync_sync::SyncConfig;
use tillsync_sync::background::BackgroundSync;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Drain the offline mutation queue once.
#[derive(Parser, Debug)]
#[command(name = "tillsync-background")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the store database
    #[arg(long)]
    db: PathBuf,

    /// Path to a JSON sync configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_config(cli.config.as_ref())?;
    let report = BackgroundSync::new(config, Vec::new())
        .run_once(&cli.db)
        .await
        .context("background sync failed")?;

    info!(
        "delivered {} mutations ({} still pending, {} dropped)",
        report.succeeded,
        report.failed - report.dropped.len(),
        report.dropped.len()
    );
    Ok(())
}
