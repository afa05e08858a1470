//! Simulated environmental sensors.
//!
//! Each sensor derives its value from the local hour and day of year plus a
//! random weather factor, clamped to the range of its kind. Readings are
//! published to subscribed handlers in registration order.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::reading::Reading;

/// Light reduction per sky condition, with its relative frequency.
const SKY_CONDITIONS: [(f64, u32); 4] = [
    (1.0, 40), // sunny
    (0.6, 30), // cloudy
    (0.3, 20), // rainy
    (0.1, 10), // stormy
];

/// Errors raised by sensors.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("sensor {0} is stopped")]
    Inactive(String),
}

/// Kinds of simulated sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Temperature,
    Humidity,
    Light,
    Pressure,
}

impl SensorKind {
    /// Get all sensor kinds.
    pub fn all() -> &'static [SensorKind] {
        &[
            SensorKind::Temperature,
            SensorKind::Humidity,
            SensorKind::Light,
            SensorKind::Pressure,
        ]
    }

    /// Get the sensor kind name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Light => "light",
            SensorKind::Pressure => "pressure",
        }
    }

    /// Get the unit for this sensor kind.
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::Humidity => "%",
            SensorKind::Light => "lux",
            SensorKind::Pressure => "hPa",
        }
    }

    /// Inclusive range every value of this kind is clamped to.
    pub fn range(&self) -> (f64, f64) {
        match self {
            SensorKind::Temperature => (-40.0, 50.0),
            SensorKind::Humidity => (0.0, 100.0),
            SensorKind::Light => (0.0, 10_000.0),
            SensorKind::Pressure => (950.0, 1050.0),
        }
    }

    /// Simulated value at local time `now`.
    pub fn sample(&self, now: DateTime<Local>, rng: &mut impl Rng) -> f64 {
        let hour = f64::from(now.hour());
        let day_of_year = f64::from(now.ordinal());
        let daily = (std::f64::consts::PI * hour / 12.0).sin();
        let seasonal = (2.0 * std::f64::consts::PI * day_of_year / 365.0).sin();

        let value = match self {
            SensorKind::Temperature => temperature(daily, seasonal, rng),
            SensorKind::Humidity => {
                // Humidity falls as the temperature rises.
                let temp = SensorKind::Temperature.clamp(temperature(daily, seasonal, rng));
                60.0 - (temp - 20.0) * 1.5 + 20.0 * daily
            }
            SensorKind::Light => {
                let (_, max) = self.range();
                let factor = SKY_CONDITIONS
                    .choose_weighted(rng, |(_, weight)| *weight)
                    .map(|(factor, _)| *factor)
                    .unwrap_or(1.0);
                max * daily * factor
            }
            SensorKind::Pressure => {
                1013.0 + 5.0 * seasonal + 2.0 * daily + rng.gen_range(-3.0..=3.0)
            }
        };
        self.clamp(value)
    }

    fn clamp(&self, value: f64) -> f64 {
        let (min, max) = self.range();
        value.clamp(min, max)
    }
}

fn temperature(daily: f64, seasonal: f64, rng: &mut impl Rng) -> f64 {
    let base = 15.0 + 10.0 * seasonal + 10.0 * daily;
    base * rng.gen_range(0.8..=1.2)
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Callback receiving every reading a sensor produces.
pub type ReadingHandler = Box<dyn FnMut(&Reading) + Send>;

/// A simulated sensor.
pub struct Sensor {
    id: String,
    name: String,
    kind: SensorKind,
    active: bool,
    last_value: Option<f64>,
    handlers: Vec<ReadingHandler>,
}

impl Sensor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: SensorKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            active: true,
            last_value: None,
            handlers: Vec::new(),
        }
    }

    /// Register a handler called with every reading, after the ones already registered.
    pub fn subscribe(&mut self, handler: impl FnMut(&Reading) + Send + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Produce a reading for local time `now` and publish it to every handler.
    pub fn read_value(&mut self, now: DateTime<Local>) -> Result<Reading, SensorError> {
        self.read_value_with(now, &mut rand::thread_rng())
    }

    /// Like [`Sensor::read_value`], drawing randomness from `rng`.
    pub fn read_value_with(
        &mut self,
        now: DateTime<Local>,
        rng: &mut impl Rng,
    ) -> Result<Reading, SensorError> {
        if !self.active {
            return Err(SensorError::Inactive(self.name.clone()));
        }

        let value = self.kind.sample(now, rng);
        self.last_value = Some(value);

        let reading = Reading::new(
            self.id.as_str(),
            now.with_timezone(&Utc),
            value,
            self.kind.unit(),
        );
        for handler in &mut self.handlers {
            handler(&reading);
        }
        Ok(reading)
    }

    /// Scale the last value by `factor`, taking a reading first if there is none.
    pub fn calibrate(&mut self, factor: f64) -> Result<f64, SensorError> {
        let value = match self.last_value {
            Some(value) => value,
            None => self.read_value(Local::now())?.value,
        };
        let calibrated = value * factor;
        self.last_value = Some(calibrated);
        Ok(calibrated)
    }

    pub fn start(&mut self) {
        self.active = true;
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn unit(&self) -> &'static str {
        self.kind.unit()
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("active", &self.active)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// A fixed set of sensors read together.
#[derive(Debug, Default)]
pub struct SensorArray {
    sensors: Vec<Sensor>,
}

impl SensorArray {
    pub fn new(sensors: Vec<Sensor>) -> Self {
        Self { sensors }
    }

    /// One sensor of every kind: `T1`, `H1`, `L1` and `P1`.
    pub fn default_set() -> Self {
        Self::new(vec![
            Sensor::new("T1", "Temp Sensor", SensorKind::Temperature),
            Sensor::new("H1", "Humidity Sensor", SensorKind::Humidity),
            Sensor::new("L1", "Light Sensor", SensorKind::Light),
            Sensor::new("P1", "Pressure Sensor", SensorKind::Pressure),
        ])
    }

    /// Register the same handler on every sensor.
    pub fn subscribe_all(&mut self, handler: impl Fn(&Reading) + Send + Sync + 'static) {
        let handler = Arc::new(handler);
        for sensor in &mut self.sensors {
            let handler = Arc::clone(&handler);
            sensor.subscribe(move |reading| handler(reading));
        }
    }

    /// Read every active sensor once, in order.
    pub fn read_all(&mut self, now: DateTime<Local>) -> Vec<Reading> {
        self.sensors
            .iter_mut()
            .filter_map(|sensor| sensor.read_value(now).ok())
            .collect()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Sensor> {
        self.sensors.iter_mut()
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Sensor> {
        self.sensors.iter_mut().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}
