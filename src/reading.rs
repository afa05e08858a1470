//! Reading module: the timestamped measurement that flows through every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sensor id used for records the collector writes about its own failures.
pub const SERVER_SENSOR_ID: &str = "server";

/// Unit used for records the collector writes about its own failures.
pub const ERROR_UNIT: &str = "ERROR";

/// A single timestamped sensor measurement.
///
/// Readings carry no identity beyond their four fields. Two equal readings
/// are indistinguishable and both are legal to store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Identifier of the sensor instance
    pub sensor_id: String,

    /// Time the measurement was taken
    pub timestamp: DateTime<Utc>,

    /// Measured value, always finite
    pub value: f64,

    /// Unit of the value, e.g. "°C" or "hPa"
    pub unit: String,
}

/// Reasons a reading is rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReadingError {
    #[error("sensor_id must not be empty")]
    EmptySensorId,

    #[error("value {0} is not finite")]
    NonFiniteValue(f64),
}

impl Reading {
    /// Create a new reading.
    pub fn new(
        sensor_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            value,
            unit: unit.into(),
        }
    }

    /// Create a reading stamped with the current time.
    pub fn now(sensor_id: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self::new(sensor_id, Utc::now(), value, unit)
    }

    /// The record the collector writes when it fails to process a message.
    pub fn server_error(timestamp: DateTime<Utc>) -> Self {
        Self::new(SERVER_SENSOR_ID, timestamp, 0.0, ERROR_UNIT)
    }

    /// Check the invariants every stored or transmitted reading must hold.
    pub fn validate(&self) -> Result<(), ReadingError> {
        if self.sensor_id.is_empty() {
            return Err(ReadingError::EmptySensorId);
        }
        if !self.value.is_finite() {
            return Err(ReadingError::NonFiniteValue(self.value));
        }
        Ok(())
    }

    /// Whether this is a synthetic collector error record.
    pub fn is_server_error(&self) -> bool {
        self.sensor_id == SERVER_SENSOR_ID && self.unit == ERROR_UNIT
    }
}

impl std::fmt::Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} = {} {}",
            self.timestamp.to_rfc3339(),
            self.sensor_id,
            self.value,
            self.unit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_reading_validation() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert!(Reading::new("T1", ts, 21.5, "°C").validate().is_ok());
        assert_eq!(
            Reading::new("", ts, 21.5, "°C").validate(),
            Err(ReadingError::EmptySensorId)
        );
        assert!(matches!(
            Reading::new("T1", ts, f64::NAN, "°C").validate(),
            Err(ReadingError::NonFiniteValue(_))
        ));
        assert!(Reading::new("T1", ts, f64::INFINITY, "°C").validate().is_err());
    }

    #[test]
    fn test_server_error_record() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let reading = Reading::server_error(ts);

        assert_eq!(reading.sensor_id, "server");
        assert_eq!(reading.unit, "ERROR");
        assert_eq!(reading.value, 0.0);
        assert!(reading.is_server_error());
        assert!(!Reading::new("T1", ts, 0.0, "°C").is_server_error());
    }

    #[test]
    fn test_reading_display() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let text = format!("{}", Reading::new("P1", ts, 1013.25, "hPa"));

        assert!(text.contains("P1"));
        assert!(text.contains("1013.25 hPa"));
        assert!(text.starts_with("2024-05-01T12:00:00"));
    }
}
