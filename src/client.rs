//! Delivery client for sending readings to the collector.
//!
//! Every attempt opens a fresh TCP connection, writes one delimited message
//! and waits for the `ACK` reply. Transport failures are retried a bounded
//! number of times with a fixed pause between attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::reading::Reading;
use crate::wire::{self, EncodeError, WireMessage, DELIMITER};

/// Longest reply line the client reads before giving up on it.
const MAX_REPLY_LEN: u64 = 64;

/// Errors that can occur while delivering a reading.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Could not establish the connection
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection broke while sending or receiving
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect or acknowledgment wait exceeded the timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Peer closed the connection without replying
    #[error("connection closed without acknowledgment")]
    NoAck,

    /// Peer replied with something other than the ACK token
    #[error("unexpected acknowledgment: {0:?}")]
    InvalidAck(String),

    /// The reading could not be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// All attempts failed
    #[error("all {attempts} attempts failed. Last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The client was closed
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connect { .. }
            | ClientError::Io(_)
            | ClientError::Timeout(_)
            | ClientError::NoAck
            | ClientError::InvalidAck(_) => true,
            ClientError::Encode(_) | ClientError::RetriesExhausted { .. } | ClientError::Closed => {
                false
            }
        }
    }
}

/// Statistics about client operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Readings acknowledged by the collector
    pub readings_sent: u64,

    /// Readings given up on
    pub readings_failed: u64,

    /// Connection attempts made, successful or not
    pub attempts: u64,

    /// Attempts made after a first failure
    pub retries: u64,
}

/// Client delivering readings to the collector with at-least-once semantics.
///
/// # Example
///
/// ```no_run
/// use sensor_telemetry::client::DeliveryClient;
/// use sensor_telemetry::config::ClientConfig;
/// use sensor_telemetry::reading::Reading;
///
/// #[tokio::main]
/// async fn main() {
///     let client = DeliveryClient::new(&ClientConfig::default());
///
///     if !client.send(&Reading::now("T1", 21.5, "°C")).await && client.is_connection_failed() {
///         eprintln!("Collector unreachable");
///     }
///     client.close();
/// }
/// ```
pub struct DeliveryClient {
    /// `host:port` of the collector
    addr: String,

    /// Bound on connect and on the acknowledgment wait, per attempt
    timeout: Duration,

    /// Attempts per reading
    max_attempts: u32,

    /// Pause between attempts
    backoff: Duration,

    /// Set when the last send exhausted its attempts
    connection_failed: AtomicBool,

    closed: AtomicBool,

    stats: RwLock<ClientStats>,
}

impl DeliveryClient {
    /// Create a client from configuration.
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_settings(config.address(), config.timeout, config.max_attempts, config.backoff)
    }

    /// Create a client with explicit settings.
    ///
    /// `max_attempts` is clamped to at least one.
    pub fn with_settings(
        addr: impl Into<String>,
        timeout: Duration,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            max_attempts: max_attempts.max(1),
            backoff,
            connection_failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats: RwLock::new(ClientStats::default()),
        }
    }

    /// Deliver a reading, returning whether the collector acknowledged it.
    pub async fn send(&self, reading: &Reading) -> bool {
        match self.try_send(reading).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, sensor_id = %reading.sensor_id, "Reading not delivered");
                false
            }
        }
    }

    /// Deliver a reading, retrying transport failures.
    ///
    /// The same message id is used for every attempt so the collector can
    /// recognise redelivered readings.
    pub async fn try_send(&self, reading: &Reading) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let message_id = Uuid::new_v4();
        let payload = wire::encode(&WireMessage::with_id(reading, message_id))?;

        let mut last_error: Option<ClientError> = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                warn!(
                    attempt = attempt,
                    max_attempts = self.max_attempts,
                    delay_ms = self.backoff.as_millis() as u64,
                    "Retrying after failure"
                );
                tokio::time::sleep(self.backoff).await;
                self.record(|s| s.retries += 1);
            }
            self.record(|s| s.attempts += 1);

            match self.send_once(&payload).await {
                Ok(()) => {
                    debug!(
                        sensor_id = %reading.sensor_id,
                        message_id = %message_id,
                        attempt = attempt,
                        "Reading acknowledged"
                    );
                    self.connection_failed.store(false, Ordering::SeqCst);
                    self.record(|s| s.readings_sent += 1);
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        error = %e,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        "Delivery attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(error = %e, attempt = attempt, "Delivery failed permanently");
                    self.record(|s| s.readings_failed += 1);
                    return Err(e);
                }
            }
        }

        self.connection_failed.store(true, Ordering::SeqCst);
        self.record(|s| s.readings_failed += 1);

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());
        error!(
            addr = %self.addr,
            attempts = self.max_attempts,
            last_error = %last_error,
            "Collector unreachable"
        );

        Err(ClientError::RetriesExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// One connection: write the message, wait for the reply line.
    async fn send_once(&self, payload: &[u8]) -> Result<(), ClientError> {
        let mut stream = timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
            .map_err(|source| ClientError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        stream.write_all(payload).await?;
        stream.flush().await?;

        let mut reply = Vec::with_capacity(4);
        let mut reader = BufReader::new((&mut stream).take(MAX_REPLY_LEN));
        let read = timeout(self.timeout, reader.read_until(DELIMITER, &mut reply))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;

        if read == 0 {
            return Err(ClientError::NoAck);
        }
        if !wire::is_ack(&reply) {
            return Err(ClientError::InvalidAck(
                String::from_utf8_lossy(&reply).trim_end().to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the most recent send gave up after exhausting its attempts.
    ///
    /// Producers use this to abandon a run instead of retrying every reading.
    pub fn is_connection_failed(&self) -> bool {
        self.connection_failed.load(Ordering::SeqCst)
    }

    /// Stop accepting sends. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let stats = self.stats();
            info!(
                addr = %self.addr,
                readings_sent = stats.readings_sent,
                readings_failed = stats.readings_failed,
                "Delivery client closed"
            );
        }
    }

    /// Whether [`DeliveryClient::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get current client statistics.
    pub fn stats(&self) -> ClientStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, update: impl FnOnce(&mut ClientStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }

    /// Get the collector address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Get the number of attempts per reading.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Get the per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn test_reading() -> Reading {
        Reading::now("T1", 22.5, "°C")
    }

    /// Accept connections forever, answering each message with `reply`.
    async fn spawn_responder(reply: &'static [u8]) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut line = Vec::new();
                let mut reader = BufReader::new(&mut stream);
                let _ = reader.read_until(b'\n', &mut line).await;
                let _ = stream.write_all(reply).await;
            }
        });

        (addr, connections)
    }

    /// An address nothing listens on.
    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout(Duration::from_secs(5));
        assert_eq!(format!("{}", err), "timed out after 5s");

        let err = ClientError::RetriesExhausted {
            attempts: 3,
            last_error: "Connection refused".to_string(),
        };
        assert!(format!("{}", err).contains("3"));
        assert!(format!("{}", err).contains("Connection refused"));
    }

    #[test]
    fn test_retryable_error_detection() {
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ClientError::NoAck.is_retryable());
        assert!(ClientError::InvalidAck("NAK".to_string()).is_retryable());
        assert!(ClientError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_retryable());
        assert!(!ClientError::Closed.is_retryable());
        assert!(!ClientError::RetriesExhausted {
            attempts: 1,
            last_error: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn test_client_creation() {
        let client = DeliveryClient::new(&ClientConfig::default());
        assert_eq!(client.addr(), "127.0.0.1:5000");
        assert_eq!(client.max_attempts(), 3);
        assert_eq!(client.timeout(), Duration::from_secs(5));
        assert!(!client.is_connection_failed());

        let client = DeliveryClient::with_settings("example:1", Duration::from_secs(1), 0, Duration::ZERO);
        assert_eq!(client.max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_send_succeeds_on_ack() {
        let (addr, connections) = spawn_responder(b"ACK\n").await;
        let client = DeliveryClient::with_settings(addr, Duration::from_secs(2), 3, Duration::from_millis(10));

        assert!(client.send(&test_reading()).await);
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert!(!client.is_connection_failed());

        let stats = client.stats();
        assert_eq!(stats.readings_sent, 1);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.retries, 0);
    }

    #[tokio::test]
    async fn test_wrong_ack_exhausts_attempts() {
        let (addr, connections) = spawn_responder(b"NAK\n").await;
        let backoff = Duration::from_millis(50);
        let client = DeliveryClient::with_settings(addr, Duration::from_secs(2), 3, backoff);

        let started = Instant::now();
        let result = client.try_send(&test_reading()).await;
        let elapsed = started.elapsed();

        assert!(matches!(
            result,
            Err(ClientError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(connections.load(Ordering::SeqCst), 3);
        assert!(elapsed >= backoff * 2, "attempts must be separated by the backoff");
        assert!(client.is_connection_failed());

        let stats = client.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.readings_failed, 1);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        // Accepts and reads, but never replies.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        let client = DeliveryClient::with_settings(
            addr,
            Duration::from_millis(100),
            3,
            Duration::from_millis(20),
        );
        assert!(!client.send(&test_reading()).await);
        assert_eq!(connections.load(Ordering::SeqCst), 3);
        assert!(client.is_connection_failed());
    }

    #[tokio::test]
    async fn test_connection_refused_sets_failed_flag() {
        let addr = closed_port().await;
        let client = DeliveryClient::with_settings(addr, Duration::from_secs(1), 2, Duration::from_millis(10));

        assert!(!client.send(&test_reading()).await);
        assert!(client.is_connection_failed());
        assert_eq!(client.stats().attempts, 2);
    }

    #[tokio::test]
    async fn test_success_clears_failed_flag() {
        let (addr, _) = spawn_responder(b"ACK\n").await;
        let client = DeliveryClient::with_settings(addr, Duration::from_secs(1), 1, Duration::ZERO);
        client.connection_failed.store(true, Ordering::SeqCst);

        assert!(client.send(&test_reading()).await);
        assert!(!client.is_connection_failed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_sends() {
        let (addr, connections) = spawn_responder(b"ACK\n").await;
        let client = DeliveryClient::with_settings(addr, Duration::from_secs(1), 3, Duration::ZERO);

        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.try_send(&test_reading()).await,
            Err(ClientError::Closed)
        ));
        assert_eq!(connections.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_reading_is_not_retried() {
        let (addr, connections) = spawn_responder(b"ACK\n").await;
        let client = DeliveryClient::with_settings(addr, Duration::from_secs(1), 3, Duration::ZERO);

        let result = client.try_send(&Reading::now("", 1.0, "°C")).await;
        assert!(matches!(result, Err(ClientError::Encode(_))));
        assert_eq!(connections.load(Ordering::SeqCst), 0);
    }
}
