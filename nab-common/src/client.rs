//! TCP client for communicating with the nabd daemon
//!
//! This module provides a persistent line-delimited JSON session with the
//! daemon: requests are correlated to responses by `request_id` while
//! asynchronous event frames (state, button, ears, rfid, asr) are surfaced
//! on a separate stream, with timeouts and reconnection logic.

use crate::{Frame, Packet, Response};

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Errors that can occur while talking to the daemon
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to daemon at {0}")]
    DaemonNotRunning(String),

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("operation timeout after {0}ms")]
    OperationTimeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    #[error("packet has no request_id to correlate a response with")]
    MissingRequestId,
}

/// Default address of the daemon
pub const DEFAULT_ADDR: &str = "127.0.0.1:10543";

/// Default timeout for operations (in milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of reconnection attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay between reconnection attempts (in milliseconds)
pub const DEFAULT_RETRY_DELAY_MS: u64 = 200;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>;

/// Connection settings, builder style
#[derive(Debug, Clone)]
pub struct NabClientConfig {
    addr: String,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl NabClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }

    /// Set the timeout for operations
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    /// Set reconnection parameters
    pub fn with_retry_params(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = Duration::from_millis(retry_delay_ms);
        self
    }

    /// Connect, retrying on failure
    pub async fn connect(self) -> Result<NabClient, ClientError> {
        let mut attempts = 0;
        loop {
            match timeout(self.timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => return Ok(NabClient::from_stream(stream, self)),
                Ok(Err(e)) => {
                    if attempts >= self.max_retries {
                        return Err(ClientError::DaemonNotRunning(self.addr.clone()));
                    }
                    tracing::warn!("connection attempt {} failed: {}, retrying...", attempts + 1, e);
                    tokio::time::sleep(self.retry_delay).await;
                    attempts += 1;
                }
                Err(_) => return Err(ClientError::ConnectionTimeout),
            }
        }
    }
}

/// A connected writer session with the daemon
pub struct NabClient {
    writer: OwnedWriteHalf,
    events: mpsc::Receiver<Frame>,
    pending: PendingMap,
    timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl NabClient {
    /// Connect to the daemon with default settings
    pub async fn connect(addr: impl Into<String>) -> Result<Self, ClientError> {
        NabClientConfig::new(addr).connect().await
    }

    fn from_stream(stream: TcpStream, config: NabClientConfig) -> Self {
        let (read_half, writer) = stream.into_split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, events) = mpsc::channel(256);

        let reader_task = tokio::spawn(read_loop(read_half, Arc::clone(&pending), event_tx));

        Self {
            writer,
            events,
            pending,
            timeout: config.timeout,
            reader_task,
        }
    }

    /// Send a packet and wait for the correlated response.
    ///
    /// The packet must carry a `request_id`; use [`NabClient::send_nowait`]
    /// for fire-and-forget packets.
    pub async fn send(&mut self, packet: &Packet) -> Result<Response, ClientError> {
        let request_id = packet
            .request_id()
            .ok_or(ClientError::MissingRequestId)?
            .to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(e) = self.write_packet(packet).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ClientError::OperationTimeout(self.timeout.as_millis() as u64))
            }
        }
    }

    /// Send a packet without waiting for a response
    pub async fn send_nowait(&mut self, packet: &Packet) -> Result<(), ClientError> {
        self.write_packet(packet).await
    }

    /// Next asynchronous frame (state/event frames, and responses that
    /// carried no request_id). `None` once the connection is closed.
    pub async fn next_event(&mut self) -> Option<Frame> {
        self.events.recv().await
    }

    /// Wait up to `wait` for the next frame
    pub async fn next_event_timeout(&mut self, wait: Duration) -> Option<Frame> {
        timeout(wait, self.events.recv()).await.ok().flatten()
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let mut line = serde_json::to_string(packet)
            .map_err(|e| ClientError::Serialization(e.to_string()))?;
        line.push('\n');

        timeout(self.timeout, self.writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| ClientError::OperationTimeout(self.timeout.as_millis() as u64))??;
        Ok(())
    }
}

impl Drop for NabClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(read_half: OwnedReadHalf, pending: PendingMap, event_tx: mpsc::Sender<Frame>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let frame: Frame = match serde_json::from_str(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("dropping unparseable frame from daemon: {}", e);
                        continue;
                    }
                };

                if let Frame::Response(response) = &frame {
                    if let Some(request_id) = response.request_id.as_deref() {
                        if let Some(tx) = pending.lock().await.remove(request_id) {
                            let _ = tx.send(response.clone());
                            continue;
                        }
                    }
                }

                if event_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("daemon connection read error: {}", e);
                break;
            }
        }
    }
    // Unblock any requests still waiting for a response
    pending.lock().await.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{encode_frame, RabbitState, Status};
    use tokio::net::TcpListener;

    /// Mock daemon that sends the handshake state frame and acknowledges
    /// every packet carrying a request_id
    async fn mock_daemon(listener: TcpListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let handshake = encode_frame(&Frame::State { state: RabbitState::Idle });
                if write_half.write_all(format!("{}\n", handshake).as_bytes()).await.is_err() {
                    return;
                }

                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let packet: Packet = match serde_json::from_str(&line) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    if let Some(request_id) = packet.request_id() {
                        let frame = Frame::Response(Response::ok(Some(request_id.to_string())));
                        let out = format!("{}\n", encode_frame(&frame));
                        if write_half.write_all(out.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_handshake_and_request_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(mock_daemon(listener));

        let mut client = NabClient::connect(addr.to_string()).await.unwrap();

        // Handshake state frame arrives as an event
        let frame = client.next_event_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(frame, Frame::State { state: RabbitState::Idle }));

        let response = client
            .send(&Packet::Sleep { request_id: Some("s1".to_string()) })
            .await
            .unwrap();
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.request_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_send_requires_request_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(mock_daemon(listener));

        let mut client = NabClient::connect(addr.to_string()).await.unwrap();
        let result = client.send(&Packet::Sleep { request_id: None }).await;
        assert!(matches!(result, Err(ClientError::MissingRequestId)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let config = NabClientConfig::new("127.0.0.1:1")
            .with_timeout(200)
            .with_retry_params(1, 50);
        match config.connect().await {
            Err(ClientError::DaemonNotRunning(_)) | Err(ClientError::ConnectionTimeout) => {}
            other => panic!("expected connection failure, got {:?}", other.map(|_| ())),
        }
    }
}
