//! Configuration management
//!
//! Handles:
//! - Broker credentials, candidate hosts and timeouts
//! - Presence discovery interface and port
//! - Schedule intervals
//! - Device identity and sensor names
//!
//! The file is TOML, located through `FD_DEVICE_CONFIG_PATH` or the OS config
//! directory. Environment overrides are applied on top of it.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Env var pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "FD_DEVICE_CONFIG_PATH";
/// Env var carrying an explicit broker address
pub const OVERRIDE_ADDRESS_ENV: &str = "RABBITMQ_HOST_ADDRESS";
/// Env var selecting the environment profile
pub const ENVIRONMENT_ENV: &str = "FD_DEVICE_ENV";

/// Longest accepted schedule interval, one week
pub const MAX_INTERVAL_MINS: u64 = 7 * 24 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub environment: Environment,
    pub device: DeviceConfig,
    pub broker: BrokerConfig,
    pub discovery: DiscoveryConfig,
    pub schedule: ScheduleConfig,
    pub grainbin: GrainbinConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Prod,
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
    pub hardware_version: Option<String>,
    pub software_version: Option<String>,
    pub interior_sensor: Option<String>,
    pub exterior_sensor: Option<String>,
    pub w1_devices_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    pub override_address: Option<String>,
    pub candidate_hosts: Vec<String>,
    pub probe_timeout_secs: u64,
    pub dispatch_timeout_secs: u64,
    /// AMQP heartbeat negotiated on each connection; 0 disables it
    pub heartbeat_secs: u16,
    /// Exchange tasks are published to; empty means the default exchange
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub interface: Option<String>,
    pub presence_port: u16,
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub device_update_interval_mins: u64,
    pub grainbin_update_interval_mins: u64,
    pub align_to_minute: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrainbinConfig {
    pub owfs_root: PathBuf,
    pub bins: Vec<GrainbinEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrainbinEntry {
    pub name: String,
    pub bus_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Overrides the environment's default level when set
    pub level: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            hardware_version: None,
            software_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            interior_sensor: None,
            exterior_sensor: None,
            w1_devices_dir: PathBuf::from("/sys/bus/w1/devices"),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_BROKER_PORT,
            username: "fd".to_string(),
            password: "farm_monitor".to_string(),
            virtual_host: "farm_monitor".to_string(),
            override_address: None,
            candidate_hosts: vec![
                "fm_rabbitmq".to_string(),
                "host.docker.internal".to_string(),
                "localhost".to_string(),
            ],
            probe_timeout_secs: 5,
            dispatch_timeout_secs: 10,
            heartbeat_secs: 30,
            exchange: String::new(),
            routing_key: "celery".to_string(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interface: None,
            presence_port: crate::DEFAULT_PRESENCE_PORT,
            poll_timeout_secs: 5,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            device_update_interval_mins: 5,
            grainbin_update_interval_mins: 10,
            align_to_minute: true,
        }
    }
}

impl Default for GrainbinConfig {
    fn default() -> Self {
        Self {
            owfs_root: PathBuf::from("/mnt/1wire"),
            bins: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let mut state_path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("./data"));
        state_path.push("fd-device");
        state_path.push("connection.json");
        Self { state_path }
    }
}

impl BrokerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn heartbeat(&self) -> u16 {
        self.heartbeat_secs
    }
}

impl ScheduleConfig {
    pub fn device_update_interval(&self) -> chrono::Duration {
        interval(self.device_update_interval_mins)
    }

    pub fn grainbin_update_interval(&self) -> chrono::Duration {
        interval(self.grainbin_update_interval_mins)
    }
}

/// Minutes to a schedule interval, saturating at `MAX_INTERVAL_MINS`
fn interval(minutes: u64) -> chrono::Duration {
    chrono::Duration::minutes(minutes.min(MAX_INTERVAL_MINS) as i64)
}

impl DiscoveryConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

impl AgentConfig {
    /// Load config from `FD_DEVICE_CONFIG_PATH` or the OS-specific location,
    /// then apply environment overrides
    pub async fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => Self::config_file_path()?,
        };

        let mut config = Self::load_from(&path).await?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults when it does not exist
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config: AgentConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("fd-device");
        path.push("config.toml");
        Ok(path)
    }

    /// Apply environment overrides from `lookup` (usually `std::env::var`)
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup(OVERRIDE_ADDRESS_ENV).filter(|a| !a.trim().is_empty()) {
            self.broker.override_address = Some(address.trim().to_string());
        }

        if let Some(profile) = lookup(ENVIRONMENT_ENV) {
            self.environment = match profile.trim().to_lowercase().as_str() {
                "prod" => Environment::Prod,
                "test" => Environment::Test,
                "dev" => Environment::Dev,
                other => {
                    warn!("Unknown environment profile '{}', using dev", other);
                    Environment::Dev
                }
            };
        }
    }

    /// Reject values the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero_checks = [
            (self.broker.probe_timeout_secs, "broker.probe_timeout_secs"),
            (self.broker.dispatch_timeout_secs, "broker.dispatch_timeout_secs"),
            (self.discovery.poll_timeout_secs, "discovery.poll_timeout_secs"),
            (self.schedule.device_update_interval_mins, "schedule.device_update_interval_mins"),
            (self.schedule.grainbin_update_interval_mins, "schedule.grainbin_update_interval_mins"),
        ];
        for (value, name) in zero_checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }

        let intervals = [
            (self.schedule.device_update_interval_mins, "schedule.device_update_interval_mins"),
            (self.schedule.grainbin_update_interval_mins, "schedule.grainbin_update_interval_mins"),
        ];
        for (value, name) in intervals {
            if value > MAX_INTERVAL_MINS {
                return Err(ConfigError::Invalid(format!(
                    "{} must be at most {} minutes",
                    name, MAX_INTERVAL_MINS
                )));
            }
        }

        if self.broker.port == 0 || self.discovery.presence_port == 0 {
            return Err(ConfigError::Invalid("ports must be non-zero".to_string()));
        }

        Ok(())
    }

    /// First-time setup writes the device identity; without it
    /// there is nothing to report
    pub fn is_setup(&self) -> bool {
        !self.device.id.trim().is_empty()
    }

    /// Log filter used when `RUST_LOG` is not set
    pub fn log_filter(&self) -> String {
        let level = self.logging.level.clone().unwrap_or_else(|| {
            match self.environment {
                Environment::Prod => "info",
                Environment::Dev | Environment::Test => "debug",
            }
            .to_string()
        });
        format!("fd_device_agent={},fd_device_agent::broker=info,lapin=warn", level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.discovery.presence_port, 5554);
        assert_eq!(config.schedule.device_update_interval_mins, 5);
        assert_eq!(
            config.broker.candidate_hosts,
            vec!["fm_rabbitmq", "host.docker.internal", "localhost"]
        );
        assert!(config.validate().is_ok());
        assert!(!config.is_setup());
    }

    #[test]
    fn test_default_routing() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.exchange, "");
        assert_eq!(broker.routing_key, "celery");
        assert_eq!(broker.heartbeat(), 30);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (OVERRIDE_ADDRESS_ENV, " 10.10.1.204 "),
            (ENVIRONMENT_ENV, "PROD"),
        ]
        .into_iter()
        .collect();

        let mut config = AgentConfig::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.broker.override_address.as_deref(), Some("10.10.1.204"));
        assert_eq!(config.environment, Environment::Prod);
        assert!(config.log_filter().starts_with("fd_device_agent=info"));
    }

    #[test]
    fn test_blank_override_is_ignored() {
        let mut config = AgentConfig::default();
        config.apply_env_overrides(|key| (key == OVERRIDE_ADDRESS_ENV).then(|| "  ".to_string()));
        assert!(config.broker.override_address.is_none());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = AgentConfig::default();
        config.schedule.grainbin_update_interval_mins = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_oversized_interval_rejected() {
        let mut config = AgentConfig::default();
        config.schedule.device_update_interval_mins = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.schedule.device_update_interval_mins = MAX_INTERVAL_MINS;
        assert!(config.validate().is_ok());
        assert_eq!(config.schedule.device_update_interval(), chrono::Duration::weeks(1));
    }

    #[test]
    fn test_interval_conversion_saturates() {
        let schedule = ScheduleConfig {
            grainbin_update_interval_mins: u64::MAX,
            ..ScheduleConfig::default()
        };
        assert_eq!(schedule.grainbin_update_interval(), chrono::Duration::weeks(1));
        assert_eq!(schedule.device_update_interval(), chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
[device]
id = "fd-0042"

[broker]
override_address = "192.168.1.10"

[[grainbin.bins]]
name = "north"
bus_number = 1
"#,
        )
        .await
        .unwrap();

        let config = AgentConfig::load_from(&path).await.unwrap();
        assert!(config.is_setup());
        assert_eq!(config.broker.override_address.as_deref(), Some("192.168.1.10"));
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.grainbin.bins.len(), 1);
        assert_eq!(config.grainbin.bins[0].bus_number, 1);
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.discovery.poll_timeout_secs, 5);
    }

    #[test]
    fn test_config_file_path() {
        if let Ok(path) = AgentConfig::config_file_path() {
            assert!(path.to_string_lossy().contains("fd-device"));
            assert!(path.to_string_lossy().ends_with("config.toml"));
        }
    }
}
