//! Collector server receiving readings from delivery clients.
//!
//! The server accepts one connection at a time, reads a single delimited
//! message from it, stores the decoded reading and answers with `ACK`.
//! Messages that cannot be decoded are recorded in the sink as synthetic
//! error readings and are never acknowledged.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::reading::Reading;
use crate::store::ReadingSink;
use crate::wire::{self, DELIMITER};
use crate::window::{SensorStats, SensorWindow};

/// Capacity of the event channel; slow subscribers miss older events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Lifecycle state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Listening,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Stopped => write!(f, "stopped"),
            ServerStatus::Listening => write!(f, "listening"),
            ServerStatus::Error => write!(f, "error"),
        }
    }
}

/// Notifications for display and monitoring collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The server moved to a new lifecycle state
    StatusChanged(ServerStatus),

    /// A reading was stored and acknowledged
    ReadingReceived {
        reading: Reading,
        message_id: Option<Uuid>,
    },

    /// A complete message was received but not stored
    MessageRejected { peer: SocketAddr, reason: String },
}

/// TCP collector feeding a [`ReadingSink`] and a per-sensor window.
///
/// Clones share the same sink, window and lifecycle, so a clone can be kept
/// to call [`CollectorServer::stop`] while another one serves.
pub struct CollectorServer<S: ReadingSink + 'static> {
    config: ServerConfig,
    sink: Arc<Mutex<S>>,
    window: Arc<Mutex<SensorWindow>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    status: Arc<Mutex<ServerStatus>>,
    events: broadcast::Sender<ServerEvent>,
}

impl<S: ReadingSink + 'static> Clone for CollectorServer<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            sink: Arc::clone(&self.sink),
            window: Arc::clone(&self.window),
            running: Arc::clone(&self.running),
            shutdown: Arc::clone(&self.shutdown),
            status: Arc::clone(&self.status),
            events: self.events.clone(),
        }
    }
}

impl<S: ReadingSink + 'static> CollectorServer<S> {
    /// Create a server owning `sink`.
    pub fn new(config: ServerConfig, sink: S) -> Self {
        Self::with_shared_sink(config, Arc::new(Mutex::new(sink)))
    }

    /// Create a server writing to a sink shared with the caller.
    pub fn with_shared_sink(config: ServerConfig, sink: Arc<Mutex<S>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            sink,
            window: Arc::new(Mutex::new(SensorWindow::new())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            status: Arc::new(Mutex::new(ServerStatus::Stopped)),
            events,
        }
    }

    /// Bind the configured address and serve until stopped.
    pub async fn start(&self) -> Result<(), ServerError> {
        let addr = self.config.bind_addr;
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(addr = %addr, error = %source, "Failed to bind collector");
                self.set_status(ServerStatus::Error);
                return Err(ServerError::Bind { addr, source });
            }
        };
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until stopped.
    ///
    /// Connections are handled one at a time. A `stop` issued before this
    /// call has no effect on it, so a stopped server can be served again.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        // Registered before going live so no stop from here on is missed.
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        self.running.store(true, Ordering::SeqCst);
        self.set_status(ServerStatus::Listening);
        match listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Collector listening"),
            Err(e) => debug!(error = %e, "Collector listening on unknown address"),
        }

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.handle_connection(stream, peer).await,
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!(error = %e, "Dropped connection during accept");
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed, collector stopping");
                        self.running.store(false, Ordering::SeqCst);
                        self.set_status(ServerStatus::Error);
                        return Err(ServerError::Accept(e));
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_status(ServerStatus::Stopped);
        info!("Collector stopped");
        Ok(())
    }

    /// Ask the accept loop to exit. A connection being handled completes first.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ServerStatus {
        *lock(&self.status)
    }

    /// Receive future [`ServerEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Per-sensor statistics over the readings received recently.
    pub fn get_sensor_stats(&self) -> Vec<SensorStats> {
        lock(&self.window).stats()
    }

    /// The sink readings are written to.
    pub fn sink(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.sink)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "Connection accepted");

        let mut line = Vec::new();
        let read = {
            let limit = self.config.max_message_size as u64;
            let mut reader = BufReader::new((&mut stream).take(limit));
            timeout(self.config.read_timeout, reader.read_until(DELIMITER, &mut line)).await
        };

        match read {
            Err(_) => {
                warn!(peer = %peer, received = line.len(), "Read timed out, discarding message");
                return;
            }
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Read failed, discarding message");
                return;
            }
            Ok(Ok(_)) if line.last() != Some(&DELIMITER) => {
                warn!(peer = %peer, received = line.len(), "Incomplete message discarded");
                return;
            }
            Ok(Ok(_)) => {}
        }

        if self.process_message(&line, peer).await {
            if let Err(e) = stream.write_all(&wire::ack_reply()).await {
                warn!(peer = %peer, error = %e, "Failed to send acknowledgment");
                return;
            }
        }
        if let Err(e) = stream.shutdown().await {
            debug!(peer = %peer, error = %e, "Connection shutdown failed");
        }
    }

    /// Decode and store one complete message. Returns whether to acknowledge it.
    async fn process_message(&self, line: &[u8], peer: SocketAddr) -> bool {
        let now = Utc::now();

        let (reading, message_id) = match wire::decode_reading(line) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Rejected malformed message");
                self.record_server_error().await;
                self.publish(ServerEvent::MessageRejected {
                    peer,
                    reason: e.to_string(),
                });
                return false;
            }
        };

        if let Err(reason) = self.append_to_sink(reading.clone()).await {
            error!(peer = %peer, sensor_id = %reading.sensor_id, error = %reason, "Failed to store reading");
            self.record_server_error().await;
            self.publish(ServerEvent::MessageRejected { peer, reason });
            return false;
        }

        lock(&self.window).insert(reading.clone(), now);

        debug!(
            peer = %peer,
            sensor_id = %reading.sensor_id,
            value = reading.value,
            message_id = ?message_id,
            "Reading stored"
        );
        self.publish(ServerEvent::ReadingReceived {
            reading,
            message_id,
        });
        true
    }

    async fn record_server_error(&self) {
        if let Err(reason) = self.append_to_sink(Reading::server_error(Utc::now())).await {
            error!(error = %reason, "Failed to record server error");
        }
    }

    /// Append on the blocking pool, since sinks write and sync files.
    async fn append_to_sink(&self, reading: Reading) -> Result<(), String> {
        let sink = Arc::clone(&self.sink);
        match tokio::task::spawn_blocking(move || lock(&sink).append(reading)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("sink task failed: {e}")),
        }
    }

    fn set_status(&self, status: ServerStatus) {
        *lock(&self.status) = status;
        self.publish(ServerEvent::StatusChanged(status));
    }

    fn publish(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Accept errors caused by a single peer rather than the listener.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
