//! Error types for the agent
//!
//! Probe and dispatch failures are never surfaced as errors: they fold into
//! `bool` and `DispatchOutcome`. The enums here cover everything that can
//! legitimately stop a component.

use std::path::PathBuf;

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("could not find a config directory for this platform")]
    NoConfigDir,
}

/// Durable endpoint record errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Sensor collaborator errors
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sensor {0} is not connected")]
    SensorMissing(String),
    #[error("unreadable sensor value: {0}")]
    Parse(String),
}

/// Broadcast listener setup errors
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(#[source] std::io::Error),
    #[error("failed to bind presence socket on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// Transport-level publish failures, classified before they reach the caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Broker unreachable, refused, or a channel/protocol error
    #[error("broker operational error: {0}")]
    Operational(String),
    /// The broker did not answer in time
    #[error("timed out waiting for broker")]
    Timeout,
    /// The connection was forcibly closed
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// Anything else on the wire
    #[error("transport error: {0}")]
    Transport(String),
}

/// Fatal resolution errors (exhaustion is not an error, see `Resolution`)
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to persist broker address {address}: {source}")]
    Persist {
        address: String,
        #[source]
        source: StoreError,
    },
}
