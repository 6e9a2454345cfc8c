use std::time::Duration;

use lib_common::telemetry::{FleetSummary, SiteLayout, SnapshotMap};
use lib_common::{ConnectionState, FeedEvent, FeedStatus, MinerFeed};
use tokio::sync::broadcast;

fn state_label(state: ConnectionState) -> String {
    match state {
        ConnectionState::Disconnected => "disconnected".to_string(),
        ConnectionState::Connecting => "connecting".to_string(),
        ConnectionState::Connected => "connected".to_string(),
        ConnectionState::Backoff(delay) => format!("retrying in {:.1}s", delay.as_secs_f64()),
    }
}

/// Fleet totals, then one line per layout panel.
pub fn summary_lines(snapshots: &SnapshotMap, status: &FeedStatus, layout: Option<&SiteLayout>) -> Vec<String> {
    let mut lines = vec![format!(
        "{} | feed {} | last seen {}",
        FleetSummary::from_snapshots(snapshots),
        state_label(status.state),
        status.last_seen.as_deref().unwrap_or("never")
    )];

    if let Some(layout) = layout {
        for location in layout.group(snapshots) {
            for panel in &location.panels {
                let used: Vec<_> = panel.slots.iter().filter(|slot| !slot.address.is_empty()).collect();
                let online = used
                    .iter()
                    .filter(|slot| slot.snapshot.is_some_and(|s| s.is_online()))
                    .count();
                let unseen = used.iter().filter(|slot| slot.snapshot.is_none()).count();
                lines.push(format!(
                    "{} / {}: {}/{} online, {} not reported",
                    location.name,
                    panel.name,
                    online,
                    used.len(),
                    unseen
                ));
            }
        }
    }
    lines
}

/// Logs a fleet summary every `interval` and relays feed notifications
/// until `shutdown` fires.
pub async fn run(feed: MinerFeed, layout: Option<SiteLayout>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut events = feed.events();
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so the feed has a chance to connect.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                for line in summary_lines(&feed.snapshots(), &feed.status(), layout.as_ref()) {
                    log::info!("{}", line);
                }
            }
            event = events.recv() => match event {
                Ok(FeedEvent::ServerError(message)) => log::warn!("Feed server error: {}", message),
                Ok(other) => log::debug!("Feed event: {:?}", other),
                Err(broadcast::error::RecvError::Lagged(missed)) => log::debug!("Missed {} feed events", missed),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    log::debug!("Reporter stopped.");
}
