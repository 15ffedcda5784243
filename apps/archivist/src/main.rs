use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{HttpTransport, LocalArchive, Orchestrator, OrchestratorConfig};

/// Drives one archiving cycle against a running archive server.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8090")]
    server_url: String,
    #[arg(long, default_value_t = 30)]
    request_timeout_seconds: u64,
    #[arg(long, default_value_t = 50)]
    max_sync_iterations: u32,
    #[arg(long, default_value_t = 100)]
    max_media_batches: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let transport = HttpTransport::new(
        &cli.server_url,
        Duration::from_secs(cli.request_timeout_seconds),
    )?;
    let config = OrchestratorConfig {
        max_sync_iterations: cli.max_sync_iterations,
        max_media_batches: cli.max_media_batches,
        ..OrchestratorConfig::default()
    };

    let orchestrator = Orchestrator::new(Arc::new(transport), config);
    let mut archive = LocalArchive::new(&cli.server_url);
    let report = orchestrator.run_cycle(&mut archive).await?;

    println!(
        "synced={} backfilled={} media_completed={} media_skipped={} media_failed={} remaining={}",
        report.synced,
        report.backfilled,
        report.media_completed,
        report.media_skipped,
        report.media_failed,
        report.media_remaining,
    );

    Ok(())
}
