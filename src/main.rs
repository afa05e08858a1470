//! Sensor Telemetry - sensor client run
//!
//! Reads the four default simulated sensors at a fixed interval, stores every
//! reading locally and delivers it to the collector.
//!
//! ## Features
//!
//! - Local persistence through the rotating log store
//! - Delivery with bounded retries; the run aborts once the collector is unreachable
//! - Graceful shutdown on Ctrl+C
//!
//! ## Configuration
//!
//! - `SENSOR_TELEMETRY_STORE_CONFIG`: Store configuration file (default: config.json)
//! - `SENSOR_TELEMETRY_HOST`: Collector host (default: 127.0.0.1)
//! - `SENSOR_TELEMETRY_PORT`: Collector port (default: 5000)
//! - `SENSOR_TELEMETRY_TIMEOUT_SECS`: Per-attempt timeout (default: 5)
//! - `SENSOR_TELEMETRY_MAX_ATTEMPTS`: Attempts per reading (default: 3)
//! - `SENSOR_TELEMETRY_BACKOFF_MS`: Pause between attempts (default: 1000)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sensor_telemetry::client::DeliveryClient;
use sensor_telemetry::config::{ClientConfig, StoreConfig};
use sensor_telemetry::sensor::SensorArray;
use sensor_telemetry::store::LogStore;

/// Number of rounds over all sensors
const ITERATIONS: u32 = 10;

/// Pause between rounds
const READ_INTERVAL: Duration = Duration::from_secs(1);

/// How a run ended.
#[derive(Debug, PartialEq, Eq)]
enum RunOutcome {
    Completed,
    CollectorUnreachable,
}

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting sensor client...");

    let store_config = match StoreConfig::load() {
        Ok(config) => {
            info!(
                log_dir = %config.log_dir.display(),
                buffer_size = config.buffer_size,
                "Store configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load store configuration");
            std::process::exit(1);
        }
    };

    let client_config = match ClientConfig::from_env() {
        Ok(config) => {
            info!(
                addr = %config.address(),
                max_attempts = config.max_attempts,
                timeout_secs = config.timeout.as_secs(),
                "Client configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load client configuration");
            std::process::exit(1);
        }
    };

    let store = match LogStore::open(store_config) {
        Ok(store) => Arc::new(Mutex::new(store)),
        Err(e) => {
            error!(error = %e, "Failed to open log store");
            std::process::exit(1);
        }
    };

    let mut sensors = SensorArray::default_set();
    let local = Arc::clone(&store);
    sensors.subscribe_all(move |reading| {
        let mut store = local.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = store.append(reading.clone()) {
            warn!(error = %e, sensor_id = %reading.sensor_id, "Failed to store reading locally");
        }
    });

    let client = DeliveryClient::new(&client_config);

    tokio::select! {
        outcome = run(&mut sensors, &client) => match outcome {
            RunOutcome::Completed => info!(iterations = ITERATIONS, "Run completed"),
            RunOutcome::CollectorUnreachable => {
                error!("Aborting run: collector unreachable after all attempts");
            }
        },
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Interrupted by user"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
    }

    client.close();

    let stats = client.stats();
    info!(
        sent = stats.readings_sent,
        failed = stats.readings_failed,
        retries = stats.retries,
        "Delivery summary"
    );

    let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = store.stop() {
        error!(error = %e, "Failed to stop log store");
    }

    info!("Sensor client stopped");
}

/// Read every sensor each round and deliver the readings.
async fn run(sensors: &mut SensorArray, client: &DeliveryClient) -> RunOutcome {
    for iteration in 1..=ITERATIONS {
        for sensor in sensors.iter_mut() {
            if client.is_connection_failed() {
                return RunOutcome::CollectorUnreachable;
            }

            let reading = match sensor.read_value(Local::now()) {
                Ok(reading) => reading,
                Err(e) => {
                    warn!(error = %e, "Skipping sensor");
                    continue;
                }
            };

            if !client.send(&reading).await && client.is_connection_failed() {
                return RunOutcome::CollectorUnreachable;
            }
        }

        info!(iteration = iteration, "Round completed");
        if iteration < ITERATIONS {
            tokio::time::sleep(READ_INTERVAL).await;
        }
    }
    RunOutcome::Completed
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
