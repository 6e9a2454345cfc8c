//! # Miner Feed End-to-End Tests
//!
//! Runs a real `MinerFeed` against the in-process WebSocket and HTTP
//! stand-ins from `project_tests`: announcement, filtering, liveness,
//! server errors, reconnects with backoff, teardown and warm start.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use lib_common::telemetry::model::CONNECT_FAILURE_MESSAGE;
use lib_common::{
    Backoff, ConnectionState, FeedConfig, FeedEndpoint, FeedEvent, FeedStatus, FeedUpdate, FetchStatus, FileStorage,
    LocalStorage, MemoryStorage, MinerFeed, SnapshotStore,
};
use project_tests::{MockApi, MockFeedServer, WAIT};

fn ips(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn feed_for(socket_url: &str, api_origin: &str, storage: Arc<dyn LocalStorage>) -> MinerFeed {
    let endpoint = FeedEndpoint::from_urls(socket_url, api_origin).unwrap();
    let mut config = FeedConfig::new(endpoint, "user-42");
    config.backoff = Backoff::new(Duration::from_millis(50), Duration::from_millis(200), 1.5);
    config.announce_retries = 0;
    MinerFeed::new(config, SnapshotStore::new(storage)).unwrap()
}

async fn wait_status(feed: &MinerFeed, predicate: impl Fn(&FeedStatus) -> bool) -> FeedStatus {
    let mut status = feed.watch_status();
    let current = timeout(WAIT, status.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for feed status")
        .expect("feed dropped");
    current.clone()
}

async fn next_server_error(events: &mut broadcast::Receiver<FeedEvent>) -> String {
    loop {
        match timeout(WAIT, events.recv()).await.expect("timed out waiting for event") {
            Ok(FeedEvent::ServerError(message)) => return message,
            Ok(_) => continue,
            Err(e) => panic!("event stream failed: {}", e),
        }
    }
}

fn collector() -> (
    impl Fn(&FeedUpdate) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<FeedUpdate>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |update: &FeedUpdate| {
            let _ = tx.send(update.clone());
        },
        rx,
    )
}

#[tokio::test]
async fn test_live_feed_round_trip() {
    let mut server = MockFeedServer::start().await.unwrap();
    let mut api = MockApi::start(vec![]).await.unwrap();
    let feed = feed_for(&server.url, &api.origin, Arc::new(MemoryStorage::new()));
    let mut events = feed.events();
    let (on_update, mut updates) = collector();

    let subscription = feed.connect(&ips(&["10.0.0.1", "10.0.0.2"]), on_update);
    let mut conn = server.next_connection().await.unwrap();

    let announced = api.next_request().await.unwrap();
    assert!(announced.request_line.starts_with("POST /api/set-miner-ips "));
    assert_eq!(announced.body, json!({ "userId": "user-42", "ips": ["10.0.0.1", "10.0.0.2"] }));
    wait_status(&feed, |s| s.state == ConnectionState::Connected).await;

    // Tracked entry merged, untracked entry dropped.
    conn.send_text(
        r#"{"miners":[
            {"ip":"10.0.0.1","status":"fulfilled","data":{"summary":{"hashrateAvg":1000000}}},
            {"ip":"10.0.0.9","status":"fulfilled","data":{}}
        ],"timestamp":"T1","cycleId":"c1"}"#,
    )
    .await
    .unwrap();
    let update = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(update.stamp, "T1");
    assert_eq!(update.batch.entries.len(), 1);

    let snapshots = feed.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots["10.0.0.1"].status, FetchStatus::Fulfilled);
    assert_eq!(snapshots["10.0.0.1"].hashrate(), Some(1_000_000.0));
    assert!(!snapshots.contains_key("10.0.0.2"));

    // Nothing tracked: only liveness moves.
    conn.send_text(r#"{"miners":[{"ip":"10.0.0.9","status":"rejected"}],"timestamp":"T2"}"#)
        .await
        .unwrap();
    wait_status(&feed, |s| s.last_seen.as_deref() == Some("T2")).await;
    assert_eq!(feed.snapshots(), snapshots);

    // Server error: surfaced, snapshots kept.
    conn.send_text(r#"{"error":"poller offline"}"#).await.unwrap();
    assert_eq!(next_server_error(&mut events).await, "poller offline");
    assert_eq!(feed.snapshots(), snapshots);

    // Malformed message dropped, connection survives.
    conn.send_text(r#"{"miners":5}"#).await.unwrap();
    conn.send_text(r#"{"miners":[{"ip":"10.0.0.2","status":"rejected"}],"timestamp":"T3"}"#)
        .await
        .unwrap();
    let update = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(update.stamp, "T3");
    assert_eq!(
        feed.snapshots()["10.0.0.2"].error.as_deref(),
        Some(CONNECT_FAILURE_MESSAGE)
    );
    assert_eq!(feed.snapshots()["10.0.0.1"], snapshots["10.0.0.1"]);

    // Reconnect after the server hangs up; same list is not announced again.
    conn.close().await.unwrap();
    let mut conn = server.next_connection().await.unwrap();
    wait_status(&feed, |s| s.state == ConnectionState::Connected).await;
    assert!(api.no_request_within(Duration::from_millis(300)).await);

    // Last listener out closes the socket and does not dial again.
    subscription.unsubscribe();
    assert!(conn.wait_closed().await);
    assert_eq!(feed.status().state, ConnectionState::Disconnected);
    assert!(server.no_connection_within(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_failed_announcement_is_retried_on_next_connect() {
    let mut server = MockFeedServer::start().await.unwrap();
    let mut api = MockApi::start(vec![500]).await.unwrap();
    let feed = feed_for(&server.url, &api.origin, Arc::new(MemoryStorage::new()));
    let _subscription = feed.connect(&ips(&["10.0.0.1"]), |_| {});

    let conn = server.next_connection().await.unwrap();
    let first = api.next_request().await.unwrap();
    // Let the client see the 500 before forcing a reconnect.
    tokio::time::sleep(Duration::from_millis(200)).await;
    conn.close().await.unwrap();

    let conn = server.next_connection().await.unwrap();
    let second = api.next_request().await.unwrap();
    assert_eq!(first.body, second.body);
    tokio::time::sleep(Duration::from_millis(200)).await;
    conn.close().await.unwrap();

    let _conn = server.next_connection().await.unwrap();
    assert!(api.no_request_within(Duration::from_millis(300)).await);
    feed.stop().await;
}

#[tokio::test]
async fn test_new_listener_announces_grown_list() {
    let mut server = MockFeedServer::start().await.unwrap();
    let mut api = MockApi::start(vec![]).await.unwrap();
    let feed = feed_for(&server.url, &api.origin, Arc::new(MemoryStorage::new()));

    let first = feed.connect(&ips(&["10.0.0.1"]), |_| {});
    let _conn = server.next_connection().await.unwrap();
    assert_eq!(api.next_request().await.unwrap().body["ips"], json!(["10.0.0.1"]));
    wait_status(&feed, |s| s.state == ConnectionState::Connected).await;

    let second = feed.connect(&ips(&[" 10.0.0.3 ", "10.0.0.1"]), |_| {});
    assert_eq!(
        api.next_request().await.unwrap().body["ips"],
        json!(["10.0.0.1", "10.0.0.3"])
    );
    // Sharing one connection.
    assert!(server.no_connection_within(Duration::from_millis(200)).await);

    // Same addresses again: nothing new to announce.
    let third = feed.connect(&ips(&["10.0.0.3"]), |_| {});
    assert!(api.no_request_within(Duration::from_millis(300)).await);

    drop(first);
    drop(second);
    assert_eq!(feed.listener_count(), 1);
    drop(third);
    assert_eq!(feed.listener_count(), 0);
}

#[tokio::test]
async fn test_departing_listener_announces_shrunk_list() {
    let mut server = MockFeedServer::start().await.unwrap();
    let mut api = MockApi::start(vec![]).await.unwrap();
    let feed = feed_for(&server.url, &api.origin, Arc::new(MemoryStorage::new()));

    let first = feed.connect(&ips(&["10.0.0.1"]), |_| {});
    let _conn = server.next_connection().await.unwrap();
    assert_eq!(api.next_request().await.unwrap().body["ips"], json!(["10.0.0.1"]));
    wait_status(&feed, |s| s.state == ConnectionState::Connected).await;

    let second = feed.connect(&ips(&["10.0.0.2"]), |_| {});
    assert_eq!(
        api.next_request().await.unwrap().body["ips"],
        json!(["10.0.0.1", "10.0.0.2"])
    );

    first.unsubscribe();
    assert_eq!(api.next_request().await.unwrap().body["ips"], json!(["10.0.0.2"]));
    assert_eq!(feed.status().state, ConnectionState::Connected);
    assert!(server.no_connection_within(Duration::from_millis(200)).await);

    drop(second);
    assert_eq!(feed.status().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unsubscribe_during_backoff_cancels_reconnect() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let endpoint = FeedEndpoint::from_urls(
        &format!("ws://127.0.0.1:{}/ws", port),
        &format!("http://127.0.0.1:{}/", port),
    )
    .unwrap();
    let mut config = FeedConfig::new(endpoint, "user-42");
    config.backoff = Backoff::new(Duration::from_millis(300), Duration::from_millis(300), 1.0);
    config.announce_retries = 0;
    let feed = MinerFeed::new(config, SnapshotStore::new(Arc::new(MemoryStorage::new()))).unwrap();
    let mut events = feed.events();
    let subscription = feed.connect(&ips(&["10.0.0.1"]), |_| {});

    match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
        FeedEvent::Disconnected { retry_in } => assert_eq!(retry_in, Duration::from_millis(300)),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(feed.status().state, ConnectionState::Backoff(Duration::from_millis(300)));

    subscription.unsubscribe();
    assert_eq!(feed.status().state, ConnectionState::Disconnected);

    // The port answers from now on; a surviving reconnect timer would dial it.
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    assert!(timeout(Duration::from_millis(800), listener.accept()).await.is_err());
    assert_eq!(feed.status().state, ConnectionState::Disconnected);
    assert_eq!(feed.listener_count(), 0);
}

#[tokio::test]
async fn test_unreachable_feed_backs_off() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let feed = feed_for(
        &format!("ws://127.0.0.1:{}/ws", port),
        &format!("http://127.0.0.1:{}/", port),
        Arc::new(MemoryStorage::new()),
    );
    let mut events = feed.events();
    let _subscription = feed.connect(&ips(&["10.0.0.1"]), |_| {});

    let mut delays = Vec::new();
    while delays.len() < 3 {
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            FeedEvent::Disconnected { retry_in } => delays.push(retry_in),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(50),
            Duration::from_millis(75),
            Duration::from_micros(112_500)
        ]
    );
    assert!(feed.status().last_error.is_some());

    feed.stop().await;
    assert_eq!(feed.status().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_snapshots_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = MockFeedServer::start().await.unwrap();
    let api = MockApi::start(vec![]).await.unwrap();

    {
        let storage = Arc::new(FileStorage::open(dir.path()).unwrap());
        let feed = feed_for(&server.url, &api.origin, storage);
        let (on_update, mut updates) = collector();
        let _subscription = feed.connect(&ips(&["10.0.0.1"]), on_update);
        let mut conn = server.next_connection().await.unwrap();
        conn.send_text(r#"{"miners":[{"ip":"10.0.0.1","status":"rejected","data":{"error":"timeout"}}],"timestamp":"T1"}"#)
            .await
            .unwrap();
        timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        feed.stop().await;
    }

    let storage = Arc::new(FileStorage::open(dir.path()).unwrap());
    let feed = feed_for(&server.url, &api.origin, storage);
    let snapshots = feed.snapshots();
    assert_eq!(snapshots["10.0.0.1"].status, FetchStatus::Rejected);
    assert_eq!(snapshots["10.0.0.1"].error.as_deref(), Some("timeout"));
    assert_eq!(feed.status().last_seen.as_deref(), Some("T1"));
}
