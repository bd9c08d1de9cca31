//! Grainbin buses through an OWFS mount
//!
//! Layout under the mount root: `bus.N/28.XXXXXXXXXXXX/{temperature,temphigh,templow}`.

use super::{BusReader, SensorReading};
use crate::error::CollectError;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

/// DS18B20 family prefix
const THERMOMETER_FAMILY: &str = "28.";

#[derive(Debug, Clone)]
pub struct OwfsReader {
    root: PathBuf,
}

impl OwfsReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn entries_with_prefix(dir: &Path, prefix: &str) -> Result<Vec<String>, CollectError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_value(path: PathBuf) -> Result<Option<String>, CollectError> {
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BusReader for OwfsReader {
    async fn buses(&self) -> Result<Vec<String>, CollectError> {
        Self::entries_with_prefix(&self.root, "bus.").await
    }

    async fn sensors(&self, bus: &str) -> Result<Vec<String>, CollectError> {
        Self::entries_with_prefix(&self.root.join(bus), THERMOMETER_FAMILY).await
    }

    async fn read(&self, bus: &str, sensor: &str) -> Result<SensorReading, CollectError> {
        let dir = self.root.join(bus).join(sensor);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(CollectError::SensorMissing(format!("{}/{}", bus, sensor)));
        }

        Ok(SensorReading {
            sensor_name: sensor.to_string(),
            temperature: Self::read_value(dir.join("temperature")).await?,
            temphigh: Self::read_value(dir.join("temphigh")).await?,
            templow: Self::read_value(dir.join("templow")).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{GrainbinCollector, GrainbinSource};
    use crate::config::GrainbinEntry;
    use tempfile::TempDir;

    fn sensor(root: &Path, bus: &str, name: &str, temperature: &str) {
        let dir = root.join(bus).join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("temperature"), format!("     {}", temperature)).unwrap();
        std::fs::write(dir.join("temphigh"), "75").unwrap();
    }

    #[tokio::test]
    async fn test_lists_buses_and_sensors() {
        let root = TempDir::new().unwrap();
        sensor(root.path(), "bus.1", "28.0000075A1B2C", "21.25");
        sensor(root.path(), "bus.1", "28.0000075A1B2D", "22.75");
        std::fs::create_dir_all(root.path().join("bus.1").join("81.000000000000")).unwrap();
        std::fs::create_dir_all(root.path().join("bus.0")).unwrap();
        std::fs::create_dir_all(root.path().join("settings")).unwrap();

        let reader = OwfsReader::new(root.path());
        assert_eq!(reader.buses().await.unwrap(), vec!["bus.0", "bus.1"]);
        assert_eq!(
            reader.sensors("bus.1").await.unwrap(),
            vec!["28.0000075A1B2C", "28.0000075A1B2D"]
        );

        let reading = reader.read("bus.1", "28.0000075A1B2C").await.unwrap();
        assert_eq!(reading.temperature.as_deref(), Some("21.25"));
        assert_eq!(reading.temphigh.as_deref(), Some("75"));
        assert_eq!(reading.templow, None);
    }

    #[tokio::test]
    async fn test_grainbin_snapshot_from_mount() {
        let root = TempDir::new().unwrap();
        sensor(root.path(), "bus.2", "28.0000075A1B2C", "21.25");
        sensor(root.path(), "bus.2", "28.0000075A1B2D", "22.75");

        let bins = vec![GrainbinEntry {
            name: "east".into(),
            bus_number: 2,
        }];
        let snapshots = GrainbinCollector::new(bins, OwfsReader::new(root.path()))
            .grainbin_snapshots()
            .await
            .unwrap();

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].get("average_temp").unwrap(), "22");
        assert_eq!(snapshots[0].get("sensor_names").unwrap().as_array().unwrap().len(), 2);
    }
}
