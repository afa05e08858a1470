//! Sensor Telemetry Library
//!
//! This library provides components for collecting environmental sensor
//! readings over TCP and storing them in rotating, archived log files:
//!
//! - **reading**: The reading value type shared by every component
//! - **sensor**: Simulated sensors publishing readings to subscribers
//! - **wire**: Newline-delimited JSON message codec and acknowledgment token
//! - **client**: Delivery client with bounded retries and fixed backoff
//! - **server**: Collector server with a per-sensor window and event channel
//! - **store**: Buffered CSV log store with rotation, archiving and retention
//! - **query**: Lazy range queries over log files and archives
//! - **config**: JSON store configuration and environment-based network settings
//!
//! # Example
//!
//! ```no_run
//! use sensor_telemetry::client::DeliveryClient;
//! use sensor_telemetry::config::{ClientConfig, StoreConfig};
//! use sensor_telemetry::sensor::SensorArray;
//! use sensor_telemetry::store::LogStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut store = LogStore::open(StoreConfig::new("logs")).expect("Failed to open store");
//!     let client = DeliveryClient::new(&ClientConfig::default());
//!
//!     let mut sensors = SensorArray::default_set();
//!     for reading in sensors.read_all(chrono::Local::now()) {
//!         store.append(reading.clone()).ok();
//!         client.send(&reading).await;
//!     }
//!
//!     client.close();
//!     store.stop().ok();
//! }
//! ```

pub mod archive;
pub mod client;
pub mod config;
pub mod query;
pub mod reading;
pub mod sensor;
pub mod server;
pub mod store;
pub mod window;
pub mod wire;

// Re-export commonly used types at crate root for convenience
pub use client::{ClientError, ClientStats, DeliveryClient};
pub use config::{ClientConfig, ConfigError, ServerConfig, StoreConfig};
pub use query::ReadingQuery;
pub use reading::{Reading, ReadingError};
pub use sensor::{Sensor, SensorArray, SensorError, SensorKind};
pub use server::{CollectorServer, ServerError, ServerEvent, ServerStatus};
pub use store::{LogStore, MemorySink, NullSink, ReadingSink, StorageError, StoreStats};
pub use window::{SensorStats, SensorWindow};
pub use wire::{DecodeError, EncodeError, WireMessage};
