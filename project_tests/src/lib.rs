//! # Local Feed Backend Stand-ins
//!
//! In-process replacements for the two endpoints a `MinerFeed` talks to:
//!
//! - [`MockFeedServer`]: a WebSocket server. Every accepted connection is
//!   handed to the test, which scripts what the server sends and when it
//!   hangs up.
//! - [`MockApi`]: a one-request-per-connection HTTP server that records each
//!   request (request line and JSON body) and answers with scripted statuses.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

/// Upper bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(5);

/// WebSocket end of the feed.
pub struct MockFeedServer {
    /// `ws://` URL clients should dial.
    pub url: String,
    accepted: mpsc::UnboundedReceiver<FeedConnection>,
    task: JoinHandle<()>,
}

impl MockFeedServer {
    /// Binds an ephemeral port and starts accepting.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}/ws", listener.local_addr()?);
        let (tx, accepted) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                match accept_async(stream).await {
                    Ok(ws) => {
                        if tx.send(FeedConnection { ws }).is_err() {
                            break;
                        }
                    }
                    Err(e) => eprintln!("mock feed handshake failed: {}", e),
                }
            }
        });
        Ok(Self { url, accepted, task })
    }

    /// Waits for the next client connection.
    pub async fn next_connection(&mut self) -> Result<FeedConnection> {
        timeout(WAIT, self.accepted.recv())
            .await?
            .ok_or_else(|| anyhow!("mock feed server stopped"))
    }

    /// True when no client connects during `window`.
    pub async fn no_connection_within(&mut self, window: Duration) -> bool {
        timeout(window, self.accepted.recv()).await.is_err()
    }
}

impl Drop for MockFeedServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Server side of one accepted feed connection.
pub struct FeedConnection {
    ws: WebSocketStream<TcpStream>,
}

impl FeedConnection {
    /// Sends one text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::text(text.to_string())).await?;
        Ok(())
    }

    /// Hangs up with a close frame.
    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }

    /// Waits until the client closes or drops the connection.
    pub async fn wait_closed(&mut self) -> bool {
        loop {
            match timeout(WAIT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

/// One request received by [`MockApi`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// e.g. `POST /api/set-miner-ips HTTP/1.1`
    pub request_line: String,
    /// Parsed JSON body, `Null` when absent or not JSON.
    pub body: serde_json::Value,
}

/// HTTP end of the feed backend.
pub struct MockApi {
    /// `http://` origin clients should use.
    pub origin: String,
    requests: mpsc::UnboundedReceiver<RecordedRequest>,
    task: JoinHandle<()>,
}

impl MockApi {
    /// Starts a server that answers with `statuses` in order, then 200.
    pub async fn start(statuses: Vec<u16>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let origin = format!("http://{}/", listener.local_addr()?);
        let (tx, requests) = mpsc::unbounded_channel();
        let mut statuses: VecDeque<u16> = statuses.into();
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let Ok(raw) = read_request(&mut stream).await else {
                    continue;
                };
                let status = statuses.pop_front().unwrap_or(200);
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status,
                    reason(status)
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;

                let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
                let recorded = RecordedRequest {
                    request_line: head.lines().next().unwrap_or_default().to_string(),
                    body: serde_json::from_str(body).unwrap_or(serde_json::Value::Null),
                };
                if tx.send(recorded).is_err() {
                    break;
                }
            }
        });
        Ok(Self { origin, requests, task })
    }

    /// Waits for the next request.
    pub async fn next_request(&mut self) -> Result<RecordedRequest> {
        timeout(WAIT, self.requests.recv())
            .await?
            .ok_or_else(|| anyhow!("mock API stopped"))
    }

    /// True when no request arrives during `window`.
    pub async fn no_request_within(&mut self, window: Duration) -> bool {
        timeout(window, self.requests.recv()).await.is_err()
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Reads headers and a `Content-Length` body.
async fn read_request(stream: &mut TcpStream) -> Result<String> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = timeout(WAIT, stream.read(&mut buf)).await??;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if raw.len() >= end + 4 + length {
                break;
            }
        }
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}
