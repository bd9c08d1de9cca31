//! Broker address resolution
//!
//! Fallback chain, stopping at the first address whose broker answers:
//!
//! ```text
//! Override -> Cached -> Dns(0) .. Dns(n-1) -> Broadcast -> Unresolved
//! ```
//!
//! Every winner except `Cached` is persisted before it is reported; a cached
//! hit is already on disk.

use crate::broker::probe::Probe;
use crate::config::{BrokerConfig, DiscoveryConfig};
use crate::discovery::{presence_bind_address, DiscoveryListener, ListenOutcome};
use crate::endpoint::{Endpoint, EndpointRecord, EndpointStore};
use crate::error::ResolveError;
use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Position in the fallback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Override,
    Cached,
    /// Index into the candidate host list
    Dns(usize),
    Broadcast,
    Unresolved,
}

impl Stage {
    /// Stage to try after a miss at `self`, given `candidates` DNS names
    pub fn next(self, candidates: usize) -> Stage {
        match self {
            Stage::Override => Stage::Cached,
            Stage::Cached if candidates > 0 => Stage::Dns(0),
            Stage::Cached => Stage::Broadcast,
            Stage::Dns(i) if i + 1 < candidates => Stage::Dns(i + 1),
            Stage::Dns(_) => Stage::Broadcast,
            Stage::Broadcast | Stage::Unresolved => Stage::Unresolved,
        }
    }

    /// Whether an address found at this stage still has to be written
    pub fn persists(self) -> bool {
        !matches!(self, Stage::Cached)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Override => f.write_str("override"),
            Stage::Cached => f.write_str("cached"),
            Stage::Dns(i) => write!(f, "dns[{}]", i),
            Stage::Broadcast => f.write_str("broadcast"),
            Stage::Unresolved => f.write_str("unresolved"),
        }
    }
}

/// Result of a full resolution run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved { endpoint: Endpoint, stage: Stage },
    Unresolved,
}

/// Name lookup seam
#[async_trait]
pub trait HostLookup: Send + Sync {
    async fn lookup(&self, host: &str) -> io::Result<IpAddr>;
}

/// Resolver-backed lookup, preferring IPv4 like `gethostbyname`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

#[async_trait]
impl HostLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> io::Result<IpAddr> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0)).await?.collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {}", host)))
    }
}

/// Walks the fallback chain once
pub struct AddressResolver<P, L, S> {
    broker: BrokerConfig,
    discovery: DiscoveryConfig,
    probe: P,
    lookup: L,
    store: S,
    token: CancellationToken,
    presence_address: Option<SocketAddr>,
}

impl<P, L, S> AddressResolver<P, L, S>
where
    P: Probe,
    L: HostLookup,
    S: EndpointStore,
{
    pub fn new(
        broker: BrokerConfig,
        discovery: DiscoveryConfig,
        probe: P,
        lookup: L,
        store: S,
        token: CancellationToken,
    ) -> Self {
        Self {
            broker,
            discovery,
            probe,
            lookup,
            store,
            token,
            presence_address: None,
        }
    }

    /// Bind the presence listener here instead of the interface's broadcast address
    pub fn with_presence_address(mut self, addr: SocketAddr) -> Self {
        self.presence_address = Some(addr);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run the chain. Only a failed write of the winning address is an error.
    pub async fn resolve(&self) -> Result<Resolution, ResolveError> {
        let cached = match self.store.load().await {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable connection record: {}", e);
                None
            }
        };

        let candidates = self.broker.candidate_hosts.len();
        let mut stage = Stage::Override;

        while stage != Stage::Unresolved {
            if self.token.is_cancelled() {
                warn!(stage = %stage, "Address resolution interrupted");
                break;
            }

            if let Some(address) = self.attempt(stage, cached.as_ref()).await {
                if stage.persists() {
                    let record = EndpointRecord::confirmed(address.as_str(), cached.as_ref(), Utc::now());
                    self.store
                        .save(&record)
                        .await
                        .map_err(|source| ResolveError::Persist {
                            address: address.clone(),
                            source,
                        })?;
                }

                info!(stage = %stage, address = %address, "Broker address resolved");
                return Ok(Resolution::Resolved {
                    endpoint: Endpoint::new(address, &self.broker),
                    stage,
                });
            }

            stage = stage.next(candidates);
        }

        error!("No address for the broker found");
        Ok(Resolution::Unresolved)
    }

    /// Try one stage; `Some` carries a reachable address
    async fn attempt(&self, stage: Stage, cached: Option<&EndpointRecord>) -> Option<String> {
        match stage {
            Stage::Override => {
                let address = self.broker.override_address.as_deref()?;
                debug!(stage = %stage, address, "Trying configured broker address");
                self.checked(stage, address).await
            }
            Stage::Cached => {
                let address = cached?.address.as_str();
                debug!(stage = %stage, address, "Trying previous broker address");
                self.checked(stage, address).await
            }
            Stage::Dns(i) => {
                let host = self.broker.candidate_hosts.get(i)?;
                debug!(stage = %stage, host = %host, "Testing candidate host");
                match self.lookup.lookup(host).await {
                    Ok(ip) => self.checked(stage, &ip.to_string()).await,
                    Err(e) => {
                        debug!(stage = %stage, host = %host, "Host was not found: {}", e);
                        None
                    }
                }
            }
            Stage::Broadcast => self.listen().await,
            Stage::Unresolved => None,
        }
    }

    async fn checked(&self, stage: Stage, address: &str) -> Option<String> {
        let result = self.probe.check(address).await;
        if result.reachable {
            Some(result.address)
        } else {
            info!(stage = %stage, address = %result.address, "Broker unreachable");
            None
        }
    }

    async fn listen(&self) -> Option<String> {
        let bind = match self.presence_address {
            Some(addr) => addr,
            None => match presence_bind_address(self.discovery.interface.as_deref(), self.discovery.presence_port) {
                Ok(addr) => addr,
                Err(e) => {
                    error!(stage = %Stage::Broadcast, "Cannot determine presence address: {}", e);
                    return None;
                }
            },
        };

        let listener = match DiscoveryListener::bind(bind, self.discovery.poll_timeout()).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(stage = %Stage::Broadcast, "Presence listener unavailable: {}", e);
                return None;
            }
        };

        match listener.listen(&self.probe, &self.token).await {
            ListenOutcome::Found(address) => Some(address),
            ListenOutcome::Interrupted => None,
        }
    }
}
