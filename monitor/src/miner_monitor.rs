use anyhow::Result;
use std::sync::Arc;
use tokio::signal;

use lib_common::telemetry::SiteLayout;
use lib_common::{FileStorage, LocalStorage, MinerFeed, SnapshotStore, SubdomainSetting};

mod monitor_logic;
use monitor_logic::{config, logger, report};

async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    let log_path = logger::setup_logging(&config.log_dir(), config.log_level(), config.log_keep())?;
    log::info!("Logging to {}", log_path.display());

    let storage: Arc<dyn LocalStorage> = Arc::new(FileStorage::open(config.state_dir())?);
    let subdomain = config::choose_subdomain(&config, &SubdomainSetting::new(Arc::clone(&storage)))?;
    let endpoint = config.endpoint(&subdomain)?;
    let feed = MinerFeed::new(config.feed_config(endpoint)?, SnapshotStore::new(storage))?;
    if config.reset_state() {
        feed.reset_snapshots()?;
    }

    let layout = config.layout_path.as_deref().map(SiteLayout::load).transpose()?;
    let addresses = config.tracked_addresses(layout.as_ref());
    if addresses.is_empty() {
        log::warn!("No miners configured; the feed will have nothing to report.");
    }

    let subscription = feed.connect(&addresses, |update| {
        log::debug!("Feed update at {}: {} miners", update.stamp, update.batch.entries.len());
    });

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let reporter = tokio::spawn(report::run(
        feed.clone(),
        layout,
        config.summary_interval(),
        shutdown_tx.subscribe(),
    ));

    wait_for_shutdown().await;

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    subscription.unsubscribe();
    feed.stop().await;
    let _ = reporter.await;

    log::info!("Shutdown complete.");
    Ok(())
}
