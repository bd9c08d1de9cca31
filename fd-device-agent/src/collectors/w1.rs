//! 1-Wire thermometers through the kernel's w1 sysfs tree

use super::Thermometer;
use crate::error::CollectError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Reads `<devices_dir>/<sensor>/w1_slave`
#[derive(Debug, Clone)]
pub struct W1Thermometer {
    devices_dir: PathBuf,
}

impl W1Thermometer {
    pub fn new(devices_dir: impl Into<PathBuf>) -> Self {
        Self {
            devices_dir: devices_dir.into(),
        }
    }

    pub fn devices_dir(&self) -> &Path {
        &self.devices_dir
    }
}

#[async_trait]
impl Thermometer for W1Thermometer {
    async fn read_celsius(&self, sensor: &str) -> Result<f64, CollectError> {
        let path = self.devices_dir.join(sensor).join("w1_slave");
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CollectError::SensorMissing(sensor.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        parse_w1_slave(&raw)
    }
}

/// Parse the two-line w1_slave format: a CRC line ending in `YES`, then a
/// line carrying `t=<millidegrees>`
pub fn parse_w1_slave(raw: &str) -> Result<f64, CollectError> {
    let mut lines = raw.lines();
    let crc = lines.next().unwrap_or_default();
    if !crc.trim_end().ends_with("YES") {
        return Err(CollectError::Parse(format!("CRC check failed: {}", crc.trim())));
    }

    let data = lines.next().unwrap_or_default();
    let (_, millis) = data
        .rsplit_once("t=")
        .ok_or_else(|| CollectError::Parse(format!("no temperature in: {}", data.trim())))?;
    let millis: f64 = millis
        .trim()
        .parse()
        .map_err(|_| CollectError::Parse(millis.trim().to_string()))?;
    Ok(millis / 1000.0)
}
