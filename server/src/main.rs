//! `VoiceChat` Policy Build Tool - Main Entry Point
//!
//! Rebuilds every guild's policy snapshots from source.

use anyhow::Result;
use tracing::info;

use vc_policyd::{build, config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vc_policyd=info,vc_policy=info".into()),
        )
        .json()
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        source_dir = %config.source_dir.display(),
        cache_dir = %config.cache_dir.display(),
        "Starting policy build"
    );

    let report = build::build_all(&config).await?;

    for (guild_id, error) in &report.failed {
        eprintln!("guild {guild_id}:\n{}", build::describe(error));
    }

    info!(
        built = report.built.len(),
        failed = report.failed.len(),
        "Policy build finished"
    );

    if !report.is_success() {
        anyhow::bail!(
            "{} of {} guilds failed to build",
            report.failed.len(),
            report.failed.len() + report.built.len()
        );
    }

    Ok(())
}
