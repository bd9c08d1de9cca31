//! Broker reachability probe
//!
//! A probe succeeds only when the broker completes the session handshake with
//! our credentials; a bare TCP connect is not enough.

use super::{classify_amqp_error, close, connect};
use crate::config::BrokerConfig;
use crate::endpoint::Endpoint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of a single probe, consumed immediately by the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub address: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Probe: Send + Sync {
    /// True only if a full handshake with `address` succeeds. Never fails.
    async fn probe(&self, address: &str) -> bool;

    async fn check(&self, address: &str) -> ProbeResult {
        let reachable = self.probe(address).await;
        ProbeResult {
            reachable,
            address: address.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl<P: Probe + ?Sized> Probe for Arc<P> {
    async fn probe(&self, address: &str) -> bool {
        (**self).probe(address).await
    }
}

/// Probe against the real broker
#[derive(Debug, Clone)]
pub struct BrokerProbe {
    broker: BrokerConfig,
    timeout: Duration,
}

impl BrokerProbe {
    pub fn new(broker: BrokerConfig) -> Self {
        let timeout = broker.probe_timeout();
        Self { broker, timeout }
    }
}

#[async_trait]
impl Probe for BrokerProbe {
    async fn probe(&self, address: &str) -> bool {
        let endpoint = Endpoint::new(address, &self.broker);
        debug!("Testing connection to {}", endpoint);

        let handshake = tokio::time::timeout(self.timeout, connect(&endpoint, "probe", self.broker.heartbeat())).await;

        match handshake {
            Ok(Ok(connection)) => {
                debug!("Connection to {} is good", endpoint);
                close(&connection).await;
                true
            }
            Ok(Err(e)) => {
                debug!(
                    "Connection to {} failed: {} ({:?})",
                    endpoint,
                    e,
                    classify_amqp_error(&e)
                );
                false
            }
            Err(_) => {
                debug!("Connection to {} timed out after {:?}", endpoint, self.timeout);
                false
            }
        }
    }
}
