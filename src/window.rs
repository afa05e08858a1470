//! Per-sensor window of recent readings held by the collector.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::reading::Reading;

/// How far back the window keeps readings.
pub const WINDOW_SPAN_HOURS: i64 = 12;

/// Span of the short average.
pub const SHORT_SPAN_HOURS: i64 = 1;

/// Aggregated view of one sensor for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorStats {
    pub sensor_id: String,
    pub last_value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,

    /// Mean of values from the last hour, 0 when there are none
    pub avg_1h: f64,

    /// Mean of values from the last 12 hours, 0 when there are none
    pub avg_12h: f64,

    /// Number of readings currently held for the sensor
    pub samples: usize,
}

/// Recent readings per sensor.
///
/// Trimming happens only on insert: a sensor that stops reporting keeps its
/// last readings until its next insert.
#[derive(Debug, Default, Clone)]
pub struct SensorWindow {
    series: HashMap<String, VecDeque<Reading>>,
}

impl SensorWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reading and drop that sensor's readings older than 12 hours before `now`.
    pub fn insert(&mut self, reading: Reading, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(WINDOW_SPAN_HOURS);
        let key = reading.sensor_id.clone();
        let series = self.series.entry(key.clone()).or_default();
        series.push_back(reading);
        // Timestamps from different sources are not ordered, so scan the whole series.
        series.retain(|r| r.timestamp >= cutoff);
        if series.is_empty() {
            // The inserted reading itself was already out of the window.
            self.series.remove(&key);
        }
    }

    /// Stats for every sensor, evaluated at `now`. Order is unspecified.
    pub fn stats_at(&self, now: DateTime<Utc>) -> Vec<SensorStats> {
        let short_cutoff = now - Duration::hours(SHORT_SPAN_HOURS);
        let long_cutoff = now - Duration::hours(WINDOW_SPAN_HOURS);

        self.series
            .iter()
            .filter_map(|(sensor_id, series)| {
                let last = series.back()?;
                Some(SensorStats {
                    sensor_id: sensor_id.clone(),
                    last_value: last.value,
                    unit: last.unit.clone(),
                    timestamp: last.timestamp,
                    avg_1h: mean_since(series, short_cutoff),
                    avg_12h: mean_since(series, long_cutoff),
                    samples: series.len(),
                })
            })
            .collect()
    }

    /// Stats for every sensor, evaluated now.
    pub fn stats(&self) -> Vec<SensorStats> {
        self.stats_at(Utc::now())
    }

    /// Readings currently held for one sensor, in insertion order.
    pub fn readings(&self, sensor_id: &str) -> Option<&VecDeque<Reading>> {
        self.series.get(sensor_id)
    }

    /// Number of sensors with readings in the window.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

fn mean_since(series: &VecDeque<Reading>, cutoff: DateTime<Utc>) -> f64 {
    let (sum, count) = series
        .iter()
        .filter(|r| r.timestamp >= cutoff)
        .fold((0.0, 0usize), |(sum, count), r| (sum + r.value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
