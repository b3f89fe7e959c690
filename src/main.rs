use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use feed_sync::config;
use feed_sync::orchestrator::{RefreshReport, SyncOrchestrator, SyncSettings};
use feed_sync::pagination::PageError;
use feed_sync::{FeedService, HttpFeedClient, MetricsLookup, TokioScheduler};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sync a merged feed once and print it as JSON lines"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "feed-sync.yaml")]
    config: PathBuf,

    /// Older pages to load after the initial snapshot
    #[arg(long, default_value = "0")]
    pages: u32,

    /// Merge entries found by the refresh into the printed feed
    #[arg(long)]
    accept: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Ok(token) = std::env::var("FEED_SYNC_TOKEN") {
        cfg.backend.token = token;
    }

    let service: Arc<dyn FeedService> = Arc::new(HttpFeedClient::from_config(&cfg)?);
    let view = SyncOrchestrator::new(
        service,
        Arc::new(TokioScheduler),
        SyncSettings::from_config(&cfg),
    );
    info!(view_id = %view.view_id(), sources = cfg.sources.len(), "starting feed sync");

    // Known up front, so activation runs the session refresh once seeded.
    view.set_source_catalog(cfg.source_catalog()).await;
    let activation = view
        .activate_from_backend()
        .await
        .context("failed to fetch the initial snapshot")?;

    match activation.refresh.unwrap_or(RefreshReport::NotReady) {
        RefreshReport::Staged(n) => {
            info!(count = n.count, merged = n.merged, "new entries available");
            if args.accept {
                view.accept_notification();
            }
        }
        RefreshReport::Failed(err) => warn!(%err, "refresh failed; printing the loaded feed"),
        report => info!(?report, "refresh finished"),
    }

    for _ in 0..args.pages {
        match view.load_more().await {
            Ok(outcome) => info!(page = outcome.page, inserted = outcome.inserted, "loaded page"),
            Err(PageError::NoMorePages) => break,
            Err(err) => {
                warn!(%err, "stopping pagination");
                break;
            }
        }
    }

    let state = view.state();
    let identities: Vec<String> = state.entries.iter().map(|e| e.identity.clone()).collect();
    let metrics = match view.metrics_for(&identities).await {
        Ok(lookup) => lookup,
        Err(err) => {
            warn!(%err, "metrics unavailable; printing zero counts");
            MetricsLookup::default()
        }
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for entry in &state.entries {
        let line = json!({
            "entry": entry,
            "metrics": metrics.get(&entry.identity),
        });
        writeln!(out, "{line}")?;
    }
    info!(
        entries = state.entries.len(),
        has_more = state.has_more,
        total_known = ?state.total_known,
        "feed sync complete"
    );
    Ok(())
}
