//! Snapshot collectors
//!
//! The scheduler's jobs only see `DeviceSource` and `GrainbinSource`. The
//! concrete collectors build snapshots from two sensor seams:
//! - `Thermometer` for the device's own interior/exterior probes
//! - `BusReader` for the grainbin cable buses

pub mod owfs;
pub mod w1;

use crate::config::{DeviceConfig, GrainbinEntry};
use crate::error::CollectError;
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

pub use owfs::OwfsReader;
pub use w1::W1Thermometer;

/// Value reported for a probe that could not be read
pub const UNREADABLE: &str = "U";

/// Pseudo-bus that aggregates every other bus
const ALL_BUS: &str = "bus.0";

#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn device_snapshot(&self) -> Result<Snapshot, CollectError>;
}

#[async_trait]
pub trait GrainbinSource: Send + Sync {
    async fn grainbin_snapshots(&self) -> Result<Vec<Snapshot>, CollectError>;
}

#[async_trait]
pub trait Thermometer: Send + Sync {
    async fn read_celsius(&self, sensor: &str) -> Result<f64, CollectError>;
}

/// One sensor's raw values as the bus reports them
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorReading {
    pub sensor_name: String,
    pub temperature: Option<String>,
    pub temphigh: Option<String>,
    pub templow: Option<String>,
}

#[async_trait]
pub trait BusReader: Send + Sync {
    /// Connected bus names (`bus.N`), including the aggregate bus
    async fn buses(&self) -> Result<Vec<String>, CollectError>;
    async fn sensors(&self, bus: &str) -> Result<Vec<String>, CollectError>;
    async fn read(&self, bus: &str, sensor: &str) -> Result<SensorReading, CollectError>;
}

/// Device identity plus interior/exterior temperatures
pub struct DeviceCollector<T> {
    device: DeviceConfig,
    grainbin_count: usize,
    thermometer: T,
    samples: usize,
}

impl<T: Thermometer> DeviceCollector<T> {
    pub fn new(device: DeviceConfig, grainbin_count: usize, thermometer: T) -> Self {
        Self {
            device,
            grainbin_count,
            thermometer,
            samples: 3,
        }
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples.max(1);
        self
    }

    /// Mean of the readable samples rounded to 2 decimals, or "U"
    async fn temperature(&self, sensor: Option<&str>) -> Value {
        let Some(sensor) = sensor else {
            return Value::from(UNREADABLE);
        };

        let mut values = Vec::with_capacity(self.samples);
        for _ in 0..self.samples {
            match self.thermometer.read_celsius(sensor).await {
                Ok(v) => values.push(v),
                Err(e) => debug!("Sample from {} failed: {}", sensor, e),
            }
        }

        if values.is_empty() {
            warn!("No readable samples from sensor {}", sensor);
            return Value::from(UNREADABLE);
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Value::from(round_to(mean, 2))
    }
}

#[async_trait]
impl<T: Thermometer> DeviceSource for DeviceCollector<T> {
    async fn device_snapshot(&self) -> Result<Snapshot, CollectError> {
        let interior = self.temperature(self.device.interior_sensor.as_deref()).await;
        let exterior = self.temperature(self.device.exterior_sensor.as_deref()).await;

        Ok(Snapshot::builder()
            .field("device_id", self.device.id.as_str())
            .field("hardware_version", self.device.hardware_version.clone())
            .field("software_version", self.device.software_version.clone())
            .field("grainbin_count", self.grainbin_count)
            .field("interior_temp", interior)
            .field("exterior_temp", exterior)
            .build())
    }
}

/// One snapshot per configured bin whose bus is connected
pub struct GrainbinCollector<R> {
    bins: Vec<GrainbinEntry>,
    reader: R,
}

impl<R: BusReader> GrainbinCollector<R> {
    pub fn new(bins: Vec<GrainbinEntry>, reader: R) -> Self {
        Self { bins, reader }
    }

    async fn connected_buses(&self) -> Result<Vec<String>, CollectError> {
        let mut buses: Vec<String> = self
            .reader
            .buses()
            .await?
            .into_iter()
            .filter(|b| b != ALL_BUS)
            .collect();
        buses.sort();
        Ok(buses)
    }

    async fn bin_snapshot(&self, bin: &GrainbinEntry, bus: &str) -> Result<Snapshot, CollectError> {
        let sensor_names = self.reader.sensors(bus).await?;

        let mut readings = Vec::with_capacity(sensor_names.len());
        for sensor in &sensor_names {
            let mut reading = self.reader.read(bus, sensor).await?;
            reading.sensor_name = sensor.clone();
            readings.push(reading);
        }

        let temperatures: Vec<&str> = readings.iter().filter_map(|r| r.temperature.as_deref()).collect();
        let average = average_temperature(&temperatures);
        let sensor_data = serde_json::to_value(&readings).map_err(|e| CollectError::Parse(e.to_string()))?;

        Ok(Snapshot::builder()
            .field("name", bin.name.as_str())
            .field("bus_number", bin.bus_number)
            .field("bus_number_string", bus)
            .field("sensor_names", sensor_names)
            .field("sensor_data", sensor_data)
            .field("average_temp", average)
            .build())
    }
}

#[async_trait]
impl<R: BusReader> GrainbinSource for GrainbinCollector<R> {
    async fn grainbin_snapshots(&self) -> Result<Vec<Snapshot>, CollectError> {
        let buses = self.connected_buses().await?;
        let mut snapshots = Vec::new();

        for bin in &self.bins {
            let bus = bus_name(bin.bus_number);
            if !buses.contains(&bus) {
                warn!("Bus {} not currently connected when trying to create update", bus);
                continue;
            }
            snapshots.push(self.bin_snapshot(bin, &bus).await?);
        }

        Ok(snapshots)
    }
}

pub fn bus_name(bus_number: u32) -> String {
    format!("bus.{}", bus_number)
}

/// Mean of the parseable readings, rounded to 4 decimals; "unknown" when
/// nothing parses
pub fn average_temperature(temperatures: &[&str]) -> String {
    let values: Vec<f64> = temperatures
        .iter()
        .filter_map(|t| t.trim().parse::<f64>().ok())
        .collect();
    if values.is_empty() {
        return "unknown".to_string();
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    round_to(mean, 4).to_string()
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
