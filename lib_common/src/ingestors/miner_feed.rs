//! # Miner Feed Ingestor
//!
//! WebSocket client for the live miner telemetry feed.
//!
//! One [`MinerFeed`] owns at most one connection, shared by every consumer
//! registered through [`MinerFeed::connect`]. The union of the consumers'
//! address lists is the tracked address list: it is announced to the backend
//! over HTTP when a connection opens, and incoming batches are filtered down
//! to it before they reach the reconciler and the consumers.
//!
//! Transport failures never surface as errors. The connection task moves to
//! `Backoff(delay)`, sleeps, and dials again until the last consumer leaves or
//! [`MinerFeed::stop`] is called.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Method;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::configs::feed_endpoint::{ConfigError, FeedEndpoint, SET_MINER_IPS_PATH};
use crate::core::{AddressGate, Backoff, ConnectionState, Dispatcher, LinkMachine, ListenerId, Removal};
use crate::retrieve::ApiClient;
use crate::storage::StoreError;
use crate::telemetry::{ParsedMessage, SnapshotMap, SnapshotStore, TelemetryReconciler, UpdateBatch};
use crate::utils::{fallback_address, normalize_address, now_rfc3339};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings for a [`MinerFeed`].
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Where the socket and the control API live.
    pub endpoint: FeedEndpoint,
    /// Account the tracked address list is announced for.
    pub user_id: String,
    /// Reconnect delay policy.
    pub backoff: Backoff,
    /// Optional bearer token for the control API.
    pub auth_token: Option<String>,
    /// Retries of a failed announcement before it is given up until the next connect.
    pub announce_retries: u32,
    /// Drop the connection when nothing arrives for this long.
    pub idle_timeout: Option<Duration>,
}

impl FeedConfig {
    /// Default policy: 5 s initial delay, x1.5, 50 s ceiling, no idle timeout.
    pub fn new(endpoint: FeedEndpoint, user_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            user_id: user_id.into(),
            backoff: Backoff::default(),
            auth_token: None,
            announce_retries: 2,
            idle_timeout: None,
        }
    }
}

/// What consumers receive for every batch that survives filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdate {
    /// The filtered batch, with fallback addresses filled in.
    pub batch: UpdateBatch,
    /// Timestamp the batch was recorded under.
    pub stamp: String,
}

/// Transient notifications about the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The socket opened.
    Connected,
    /// The socket went away; a new attempt follows after `retry_in`.
    Disconnected {
        /// Delay before the next attempt.
        retry_in: Duration,
    },
    /// The server sent an error instead of data. Snapshots are unchanged.
    ServerError(String),
}

/// Observable state of the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedStatus {
    /// Connection state.
    pub state: ConnectionState,
    /// Stamp of the last well-formed batch, filtered or not.
    pub last_seen: Option<String>,
    /// Most recent transport or server error.
    pub last_error: Option<String>,
}

/// Errors raised while building a [`MinerFeed`] or resetting its state.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The endpoint is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The control API client could not be built.
    #[error(transparent)]
    Client(#[from] anyhow::Error),

    /// `MinerFeed::new` was called outside a tokio runtime.
    #[error("MinerFeed must be created inside a tokio runtime")]
    NoRuntime,

    /// Durable state could not be written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one text frame amounts to.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// Server-side error; surface it and keep the snapshots.
    ServerError(String),
    /// Not a batch; dropped.
    Malformed(String),
    /// Nothing tracked in this batch; only liveness is recorded.
    Heartbeat {
        /// Stamp of the batch, if it carried one.
        timestamp: Option<String>,
    },
    /// Tracked entries to merge and broadcast.
    Update(UpdateBatch),
}

/// Decodes and filters feed messages against a tracked address list.
#[derive(Debug, Clone, Default)]
pub struct FeedSession {
    tracked: BTreeSet<String>,
}

impl FeedSession {
    /// Builds a session for the given tracked addresses (normalized here).
    pub fn new(tracked: &[String]) -> Self {
        Self {
            tracked: tracked.iter().map(|a| normalize_address(a)).collect(),
        }
    }

    /// Classifies one text frame.
    ///
    /// Entries whose address is not tracked are dropped. An entry without an
    /// address is kept only when an empty placeholder is tracked, and is
    /// given the address `unknown-{index}` from its position in the batch.
    pub fn handle_text(&self, text: &str) -> HandleOutcome {
        let batch = match UpdateBatch::parse(text) {
            ParsedMessage::Batch(batch) => batch,
            ParsedMessage::ServerError(message) => return HandleOutcome::ServerError(message),
            ParsedMessage::Malformed(reason) => return HandleOutcome::Malformed(reason),
        };

        let UpdateBatch {
            entries,
            timestamp,
            cycle_id,
        } = batch;
        let received = entries.len();
        let entries: Vec<_> = entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, mut entry)| match entry.address() {
                Some(address) if self.tracked.contains(&address) => Some(entry),
                Some(_) => None,
                None if self.tracked.contains("") => {
                    entry.ip = Some(fallback_address(index));
                    Some(entry)
                }
                None => None,
            })
            .collect();

        log::trace!(
            "Cycle {}: {} of {} entries tracked",
            cycle_id.as_deref().unwrap_or("-"),
            entries.len(),
            received
        );

        if entries.is_empty() {
            HandleOutcome::Heartbeat { timestamp }
        } else {
            HandleOutcome::Update(UpdateBatch {
                entries,
                timestamp,
                cycle_id,
            })
        }
    }
}

enum LinkCommand {
    TrackedChanged,
}

enum SessionEnd {
    Cancelled,
    Lost(String),
}

struct LinkHandle {
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<LinkCommand>,
    task: JoinHandle<()>,
}

struct Shared {
    config: FeedConfig,
    api: ApiClient,
    runtime: Handle,
    reconciler: Mutex<TelemetryReconciler>,
    dispatcher: Mutex<Dispatcher<FeedUpdate>>,
    gate: Mutex<AddressGate>,
    link: Mutex<Option<LinkHandle>>,
    status: watch::Sender<FeedStatus>,
    events: broadcast::Sender<FeedEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the live feed. Clones share the same connection and snapshots.
#[derive(Clone)]
pub struct MinerFeed {
    shared: Arc<Shared>,
}

impl fmt::Debug for MinerFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinerFeed")
            .field("socket_url", &self.shared.config.endpoint.socket_url.as_str())
            .field("api", &self.shared.api.base_url().as_str())
            .field("status", &*self.shared.status.borrow())
            .field("listeners", &lock(&self.shared.dispatcher).len())
            .finish()
    }
}

impl MinerFeed {
    /// Creates the feed and seeds its snapshots from `store`. Nothing is
    /// dialed until the first [`MinerFeed::connect`].
    pub fn new(config: FeedConfig, store: SnapshotStore) -> Result<Self, FeedError> {
        let runtime = Handle::try_current().map_err(|_| FeedError::NoRuntime)?;
        let announce_url = config.endpoint.set_miner_ips_url()?;
        let api = ApiClient::new(
            config.endpoint.api_origin.as_str(),
            config.auth_token.clone(),
            config.announce_retries,
        )?;
        let reconciler = TelemetryReconciler::open(store);
        log::info!(
            "Miner feed at {} (announcing to {}), {} warm snapshots",
            config.endpoint.socket_url,
            announce_url,
            reconciler.len()
        );

        let (status, _) = watch::channel(FeedStatus {
            state: ConnectionState::Disconnected,
            last_seen: reconciler.last_updated().map(str::to_string),
            last_error: None,
        });
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                api,
                runtime,
                reconciler: Mutex::new(reconciler),
                dispatcher: Mutex::new(Dispatcher::new()),
                gate: Mutex::new(AddressGate::new()),
                link: Mutex::new(None),
                status,
                events,
            }),
        })
    }

    /// Registers a consumer of `addresses` and opens the connection if none
    /// is running. When the connection is already up and the tracked list
    /// grew or shrank, the new list is announced.
    ///
    /// The consumer stays registered until the returned [`Subscription`] is
    /// unsubscribed or dropped.
    pub fn connect<F>(&self, addresses: &[String], on_update: F) -> Subscription
    where
        F: Fn(&FeedUpdate) + Send + Sync + 'static,
    {
        let mut dispatcher = lock(&self.shared.dispatcher);
        let before = dispatcher.tracked_addresses();
        let id = dispatcher.add_listener(addresses, Arc::new(on_update));
        let tracked_changed = dispatcher.tracked_addresses() != before;

        let mut link = lock(&self.shared.link);
        match link.as_ref() {
            Some(handle) if !handle.task.is_finished() => {
                if tracked_changed {
                    let _ = handle.commands.send(LinkCommand::TrackedChanged);
                }
            }
            _ => *link = Some(self.shared.spawn_link()),
        }

        Subscription {
            shared: Arc::clone(&self.shared),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Copy of the current address -> snapshot map.
    pub fn snapshots(&self) -> SnapshotMap {
        lock(&self.shared.reconciler).get_all().clone()
    }

    /// Current status.
    pub fn status(&self) -> FeedStatus {
        self.shared.status.borrow().clone()
    }

    /// Receiver that sees every status change.
    pub fn watch_status(&self) -> watch::Receiver<FeedStatus> {
        self.shared.status.subscribe()
    }

    /// Receiver of transient notifications from now on.
    pub fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.shared.events.subscribe()
    }

    /// Normalized union of every consumer's addresses.
    pub fn tracked_addresses(&self) -> Vec<String> {
        lock(&self.shared.dispatcher).tracked_addresses()
    }

    /// Number of registered consumers.
    pub fn listener_count(&self) -> usize {
        lock(&self.shared.dispatcher).len()
    }

    /// Forgets every snapshot, in memory and in durable storage, along with
    /// the last-seen stamp. This is the only way snapshots are ever removed.
    pub fn reset_snapshots(&self) -> Result<(), FeedError> {
        let result = lock(&self.shared.reconciler).reset();
        self.shared.status.send_modify(|status| status.last_seen = None);
        result?;
        log::info!("Miner snapshots reset.");
        Ok(())
    }

    /// Closes the connection and cancels any pending reconnect, then waits
    /// for the connection task to finish. Consumers stay registered; a later
    /// [`MinerFeed::connect`] dials again.
    pub async fn stop(&self) {
        let handle = lock(&self.shared.link).take();
        if let Some(handle) = handle {
            self.shared.cancel_link(&handle, "stopped");
            if let Err(e) = handle.task.await {
                log::warn!("Miner feed task ended abnormally: {}", e);
            }
        }
    }
}

/// Registration of one consumer. Dropping it unsubscribes.
pub struct Subscription {
    shared: Arc<Shared>,
    id: ListenerId,
    active: AtomicBool,
}

impl Subscription {
    /// Deregisters the consumer. The last one out closes the connection and
    /// cancels any pending reconnect; otherwise a shrunk tracked list is
    /// announced. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut dispatcher = lock(&self.shared.dispatcher);
        let before = dispatcher.tracked_addresses();
        match dispatcher.remove_listener(self.id) {
            Removal::Removed { remaining: 0 } => {
                if let Some(handle) = lock(&self.shared.link).take() {
                    self.shared.cancel_link(&handle, "last listener left");
                }
            }
            Removal::Removed { .. } if dispatcher.tracked_addresses() != before => {
                if let Some(handle) = lock(&self.shared.link).as_ref() {
                    let _ = handle.commands.send(LinkCommand::TrackedChanged);
                }
            }
            Removal::Removed { .. } | Removal::Unknown => {}
        }
    }

    /// False once unsubscribed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn idle_deadline(timeout: Option<Duration>, since: Instant) {
    match timeout {
        Some(timeout) => tokio::time::sleep_until(since + timeout).await,
        None => std::future::pending().await,
    }
}

impl Shared {
    fn spawn_link(self: &Arc<Self>) -> LinkHandle {
        let cancel = CancellationToken::new();
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = self
            .runtime
            .spawn(Arc::clone(self).run_link(cancel.clone(), receiver));
        LinkHandle { cancel, commands, task }
    }

    fn cancel_link(&self, handle: &LinkHandle, reason: &str) {
        log::info!("Closing miner feed: {}", reason);
        handle.cancel.cancel();
        self.status.send_if_modified(|status| {
            let changed = status.state != ConnectionState::Disconnected;
            status.state = ConnectionState::Disconnected;
            changed
        });
    }

    /// Publishes a state change unless the task owning `cancel` was torn down.
    fn set_state(&self, cancel: &CancellationToken, state: ConnectionState) {
        self.status.send_if_modified(|status| {
            if cancel.is_cancelled() || status.state == state {
                return false;
            }
            status.state = state;
            true
        });
    }

    fn record_error(&self, message: String) {
        self.status.send_modify(|status| status.last_error = Some(message));
    }

    fn emit(&self, event: FeedEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn run_link(self: Arc<Self>, cancel: CancellationToken, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
        let mut machine = LinkMachine::new(self.config.backoff.clone());
        machine.start();

        loop {
            self.set_state(&cancel, machine.state());
            let url = self.config.endpoint.socket_url.as_str();
            log::info!("Connecting to miner feed: {}", url);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = connect_async(url) => attempt,
            };

            match attempt {
                Ok((ws, _)) => {
                    machine.connect_succeeded();
                    self.set_state(&cancel, machine.state());
                    self.emit(FeedEvent::Connected);
                    log::info!("Connected to miner feed.");
                    self.announce();

                    match self.pump(ws, &cancel, &mut commands).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Lost(reason) => {
                            log::warn!("Miner feed connection lost: {}", reason);
                            self.record_error(reason);
                        }
                    }
                }
                Err(e) => {
                    log::error!("Failed to connect to miner feed: {}", e);
                    self.record_error(e.to_string());
                }
            }

            let Some(delay) = machine.connection_lost() else {
                break;
            };
            self.set_state(&cancel, machine.state());
            self.emit(FeedEvent::Disconnected { retry_in: delay });
            log::info!("Reconnecting in {} ms", delay.as_millis());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            machine.retry_due();
        }

        machine.stop();
        log::debug!("Miner feed task finished.");
    }

    async fn pump(
        self: &Arc<Self>,
        ws: WsStream,
        cancel: &CancellationToken,
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                command = commands.recv() => match command {
                    Some(LinkCommand::TrackedChanged) => self.announce(),
                    None => return SessionEnd::Cancelled,
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        self.handle_frame(text.as_str().to_owned(), cancel).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Lost(match frame {
                            Some(frame) => format!("closed by server ({}: {})", frame.code, frame.reason.as_str()),
                            None => "closed by server".to_string(),
                        });
                    }
                    // Binary, ping and pong frames only prove the link is alive.
                    Some(Ok(_)) => last_activity = Instant::now(),
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                },
                _ = idle_deadline(self.config.idle_timeout, last_activity) => {
                    return SessionEnd::Lost("idle timeout".to_string());
                }
            }
        }
    }

    /// Classifies and applies one text frame on the blocking pool. Merging
    /// rewrites the whole snapshot file and consumers run arbitrary code, so
    /// neither happens on a runtime worker. Frames are still applied one at
    /// a time, in arrival order.
    async fn handle_frame(self: &Arc<Self>, text: String, cancel: &CancellationToken) {
        let shared = Arc::clone(self);
        let cancel = cancel.clone();
        let applied = tokio::task::spawn_blocking(move || {
            let session = FeedSession::new(&lock(&shared.dispatcher).tracked_addresses());
            shared.apply(session.handle_text(&text), &cancel);
        })
        .await;
        if let Err(e) = applied {
            log::error!("Miner feed message handler failed: {}", e);
        }
    }

    /// Applies a classified message to the snapshots, status and consumers.
    fn apply(&self, outcome: HandleOutcome, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        match outcome {
            HandleOutcome::ServerError(message) => {
                log::warn!("Miner feed reported an error: {}", message);
                self.record_error(message.clone());
                self.emit(FeedEvent::ServerError(message));
            }
            HandleOutcome::Malformed(reason) => {
                log::debug!("Dropping malformed feed message: {}", reason);
            }
            HandleOutcome::Heartbeat { timestamp } => {
                let stamp = timestamp.unwrap_or_else(now_rfc3339);
                if let Err(e) = lock(&self.reconciler).touch(&stamp) {
                    log::warn!("Could not persist feed liveness: {}", e);
                }
                self.status.send_modify(|status| status.last_seen = Some(stamp));
            }
            HandleOutcome::Update(mut batch) => {
                let stamp = batch.timestamp.get_or_insert_with(now_rfc3339).clone();
                match lock(&self.reconciler).merge(&batch) {
                    Ok(applied) => log::debug!("Merged {} miner entries at {}", applied, stamp),
                    Err(e) => log::warn!("Merged batch could not be persisted: {}", e),
                }
                self.status.send_modify(|status| status.last_seen = Some(stamp.clone()));

                let update = FeedUpdate { batch, stamp };
                let listeners = lock(&self.dispatcher).listeners();
                for listener in listeners {
                    listener(&update);
                }
            }
        }
    }

    /// Sends the tracked list to the backend in a detached task, unless the
    /// same list was already sent.
    fn announce(self: &Arc<Self>) {
        let ips: Vec<String> = lock(&self.dispatcher)
            .tracked_addresses()
            .into_iter()
            .filter(|ip| !ip.is_empty())
            .collect();
        let Some(list) = lock(&self.gate).claim(&ips) else {
            log::debug!("Tracked address list unchanged; not announcing.");
            return;
        };

        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            match shared.post_addresses(&list).await {
                Ok(()) => log::info!("Announced {} tracked addresses.", list.len()),
                Err(e) => {
                    log::error!("Failed to announce tracked addresses: {}", e);
                    lock(&shared.gate).release(&list);
                }
            }
        });
    }

    async fn post_addresses(&self, ips: &[String]) -> anyhow::Result<()> {
        let body = json!({ "userId": self.config.user_id, "ips": ips });
        let response = self
            .api
            .request::<serde_json::Value, _>(Method::POST, SET_MINER_IPS_PATH, None, Some(body))
            .await?;
        if !response.success {
            anyhow::bail!(
                "HTTP {}: {}",
                response.status,
                response.error_body.unwrap_or_default()
            );
        }
        Ok(())
    }
}
