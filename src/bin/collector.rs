//! Collector - receives sensor readings and stores them in the rotating log store
//!
//! ## Configuration
//!
//! - `SENSOR_TELEMETRY_STORE_CONFIG`: Store configuration file (default: config.json)
//! - `SENSOR_TELEMETRY_BIND`: Listen address (default: 0.0.0.0)
//! - `SENSOR_TELEMETRY_PORT`: Listen port (default: 5000)
//! - `SENSOR_TELEMETRY_READ_TIMEOUT_SECS`: Time allowed per message (default: 10)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sensor_telemetry::config::{ServerConfig, StoreConfig};
use sensor_telemetry::server::{CollectorServer, ServerEvent};
use sensor_telemetry::store::LogStore;

/// Interval between sensor statistics reports
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Time allowed for the accept loop to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting collector...");

    let store_config = match StoreConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load store configuration");
            std::process::exit(1);
        }
    };

    let server_config = match ServerConfig::from_env() {
        Ok(config) => {
            info!(
                bind_addr = %config.bind_addr,
                read_timeout_secs = config.read_timeout.as_secs(),
                "Server configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load server configuration");
            std::process::exit(1);
        }
    };

    let store = match LogStore::open(store_config) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to open log store");
            std::process::exit(1);
        }
    };

    let server = CollectorServer::new(server_config, store);

    let monitor_handle = tokio::spawn(monitor(server.clone()));

    let serving = server.clone();
    let mut server_handle = tokio::spawn(async move { serving.start().await });

    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Collector exited"),
                Ok(Err(e)) => error!(error = %e, "Collector failed"),
                Err(e) => error!(error = %e, "Collector task panicked"),
            }
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            server.stop();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server_handle).await {
                Ok(Ok(Ok(()))) => info!("Collector shut down gracefully"),
                Ok(Ok(Err(e))) => warn!(error = %e, "Collector failed during shutdown"),
                Ok(Err(e)) => warn!(error = %e, "Collector task panicked during shutdown"),
                Err(_) => warn!("Collector shutdown timed out after {:?}", SHUTDOWN_TIMEOUT),
            }
        }
    }

    monitor_handle.abort();

    let sink = server.sink();
    let mut store = sink.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = store.stop() {
        error!(error = %e, "Failed to stop log store");
    }
    let stats = store.stats();
    info!(
        rows_written = stats.rows_written,
        rotations = stats.rotations,
        archives_pruned = stats.archives_pruned,
        "Collector stopped"
    );
}

/// Follow server events and periodically report per-sensor statistics.
async fn monitor(server: CollectorServer<LogStore>) {
    let mut events = server.subscribe();
    let mut ticker = interval(REPORT_INTERVAL);
    let mut received: u64 = 0;
    let mut rejected: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for stats in server.get_sensor_stats() {
                    info!(
                        sensor_id = %stats.sensor_id,
                        last_value = stats.last_value,
                        unit = %stats.unit,
                        avg_1h = format!("{:.2}", stats.avg_1h),
                        avg_12h = format!("{:.2}", stats.avg_12h),
                        samples = stats.samples,
                        "Sensor statistics"
                    );
                }
                if received > 0 || rejected > 0 {
                    info!(received = received, rejected = rejected, "Collector progress");
                    received = 0;
                    rejected = 0;
                }
            }
            event = events.recv() => match event {
                Ok(ServerEvent::ReadingReceived { .. }) => received += 1,
                Ok(ServerEvent::MessageRejected { peer, reason }) => {
                    rejected += 1;
                    debug!(peer = %peer, reason = %reason, "Message rejected");
                }
                Ok(ServerEvent::StatusChanged(status)) => info!(status = %status, "Collector status changed"),
                Err(RecvError::Lagged(missed)) => warn!(missed = missed, "Event monitor fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
