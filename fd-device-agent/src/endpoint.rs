//! Broker endpoint and its durable record
//!
//! Exactly one endpoint is current at a time. The record is replaced as a
//! whole: stores write it atomically and never patch single fields.

use crate::config::BrokerConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Broker address plus the credentials fixed at configuration time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, broker: &BrokerConfig) -> Self {
        Self {
            host: host.into(),
            port: broker.port,
            username: broker.username.clone(),
            password: broker.password.clone(),
            virtual_host: broker.virtual_host.clone(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Persisted connection record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub address: String,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub connected: bool,
}

impl EndpointRecord {
    /// Record for a freshly confirmed address; `first_seen` carries over
    /// from the previous record
    pub fn confirmed(address: impl Into<String>, previous: Option<&EndpointRecord>, now: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            first_seen: previous.map(|p| p.first_seen).unwrap_or(now),
            last_updated: now,
            connected: true,
        }
    }
}

/// Read/write access to the current endpoint record
#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<EndpointRecord>, StoreError>;
    async fn save(&self, record: &EndpointRecord) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: EndpointStore + ?Sized> EndpointStore for Arc<S> {
    async fn load(&self) -> Result<Option<EndpointRecord>, StoreError> {
        (**self).load().await
    }

    async fn save(&self, record: &EndpointRecord) -> Result<(), StoreError> {
        (**self).save(record).await
    }
}

/// JSON file store; writes go through a temp file and a rename
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EndpointStore for JsonFileStore {
    async fn load(&self) -> Result<Option<EndpointRecord>, StoreError> {
        if !self.path.exists() {
            debug!("No connection record at {}, starting fresh", self.path.display());
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let record: EndpointRecord = serde_json::from_str(&content)?;
        Ok(Some(record))
    }

    async fn save(&self, record: &EndpointRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Saved connection record for {} to {}", record.address, self.path.display());
        Ok(())
    }
}

/// In-memory store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Mutex<Option<EndpointRecord>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(address: impl Into<String>) -> Self {
        let store = Self::new();
        *store.record.lock() = Some(EndpointRecord::confirmed(address, None, Utc::now()));
        store
    }

    pub fn current(&self) -> Option<EndpointRecord> {
        self.record.lock().clone()
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl EndpointStore for MemoryStore {
    async fn load(&self) -> Result<Option<EndpointRecord>, StoreError> {
        Ok(self.record.lock().clone())
    }

    async fn save(&self, record: &EndpointRecord) -> Result<(), StoreError> {
        *self.record.lock() = Some(record.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}
