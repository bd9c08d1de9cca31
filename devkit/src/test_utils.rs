/*!
Test harness for the agent

- `StaticLookup` answers name lookups from a table
- `ManualClock` lets the scheduler run through hours of schedule instantly
- `CountingJob` counts its runs
- `ResolverHarness` wires the doubles into an `AddressResolver`
*/

use crate::broker_stub::ScriptedProbe;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fd_device_agent::config::{BrokerConfig, DiscoveryConfig};
use fd_device_agent::{AddressResolver, Clock, HostLookup, Job, JobControl, MemoryStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Init logging for tests; safe to call more than once
pub fn init_test_logging() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

/// Name lookup from a fixed table; unknown names fail with `NotFound`
#[derive(Clone, Default)]
pub struct StaticLookup {
    hosts: Arc<Mutex<HashMap<String, IpAddr>>>,
    lookups: Arc<Mutex<Vec<String>>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: &str, ip: IpAddr) -> Self {
        self.hosts.lock().insert(host.to_string(), ip);
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl HostLookup for StaticLookup {
    async fn lookup(&self, host: &str) -> io::Result<IpAddr> {
        self.lookups.lock().push(host.to_string());
        self.hosts
            .lock()
            .get(host)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {}", host)))
    }
}

/// Clock whose sleeps return at once and move time forward.
///
/// A sleep that would cross the horizon cancels the token instead and never
/// returns, like an operator interrupt arriving while the scheduler idles.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    sleeps: Arc<Mutex<Vec<std::time::Duration>>>,
    horizon: Option<(DateTime<Utc>, CancellationToken)>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
            horizon: None,
        }
    }

    pub fn with_horizon(mut self, horizon: DateTime<Utc>, token: CancellationToken) -> Self {
        self.horizon = Some((horizon, token));
        self
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Completed sleeps, in order
    pub fn sleeps(&self) -> Vec<std::time::Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: std::time::Duration) {
        let wake_at = self.now() + Duration::from_std(duration).unwrap_or_else(|_| Duration::zero());

        if let Some((horizon, token)) = &self.horizon {
            if wake_at > *horizon {
                debug!("Sleep past horizon, cancelling");
                token.cancel();
                std::future::pending::<()>().await;
            }
        }

        *self.now.lock() = wake_at;
        self.sleeps.lock().push(duration);
    }
}

/// Job that counts its runs and optionally unschedules itself
pub struct CountingJob {
    name: String,
    runs: Arc<AtomicUsize>,
    cancel_after: Option<usize>,
}

impl CountingJob {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            runs: Arc::new(AtomicUsize::new(0)),
            cancel_after: None,
        }
    }

    /// Ask to be unscheduled after `runs` runs
    pub fn cancel_after(mut self, runs: usize) -> Self {
        self.cancel_after = Some(runs);
        self
    }

    /// Shared run counter, still readable once the job is boxed
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.runs.clone()
    }
}

#[async_trait]
impl Job for CountingJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self) -> JobControl {
        let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        match self.cancel_after {
            Some(limit) if runs >= limit => JobControl::Cancel,
            _ => JobControl::Continue,
        }
    }
}

/// Resolver over in-memory doubles
pub struct ResolverHarness {
    pub broker: BrokerConfig,
    pub discovery: DiscoveryConfig,
    pub probe: ScriptedProbe,
    pub lookup: StaticLookup,
    pub store: Arc<MemoryStore>,
    pub token: CancellationToken,
    pub presence_address: Option<SocketAddr>,
}

impl ResolverHarness {
    pub fn new() -> Self {
        init_test_logging();

        let discovery = DiscoveryConfig {
            poll_timeout_secs: 1,
            ..DiscoveryConfig::default()
        };

        Self {
            broker: BrokerConfig::default(),
            discovery,
            probe: ScriptedProbe::new(),
            lookup: StaticLookup::new(),
            store: Arc::new(MemoryStore::new()),
            token: CancellationToken::new(),
            presence_address: None,
        }
    }

    pub fn resolver(&self) -> AddressResolver<ScriptedProbe, StaticLookup, Arc<MemoryStore>> {
        let resolver = AddressResolver::new(
            self.broker.clone(),
            self.discovery.clone(),
            self.probe.clone(),
            self.lookup.clone(),
            self.store.clone(),
            self.token.clone(),
        );
        match self.presence_address {
            Some(addr) => resolver.with_presence_address(addr),
            None => resolver,
        }
    }

    /// Cancel the harness token after `delay`
    pub fn cancel_after(&self, delay: std::time::Duration) {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        });
    }
}

impl Default for ResolverHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_manual_clock_advances_on_sleep() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);

        clock.sleep(std::time::Duration::from_secs(90)).await;
        assert_eq!(clock.now(), start + Duration::seconds(90));
        assert_eq!(clock.sleeps(), vec![std::time::Duration::from_secs(90)]);
    }

    #[tokio::test]
    async fn test_manual_clock_advance_is_not_a_sleep() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);

        clock.advance(Duration::minutes(2));
        assert_eq!(clock.now(), start + Duration::minutes(2));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_static_lookup() {
        let lookup = StaticLookup::new().with_host("farm-monitor.local", "10.0.0.9".parse().unwrap());
        assert!(lookup.lookup("farm-monitor.local").await.is_ok());
        assert!(lookup.lookup("nowhere.local").await.is_err());
        assert_eq!(lookup.lookups().len(), 2);
    }

    #[tokio::test]
    async fn test_counting_job_cancels() {
        let mut job = CountingJob::new("count").cancel_after(2);
        let runs = job.counter();
        assert_eq!(job.run().await, JobControl::Continue);
        assert_eq!(job.run().await, JobControl::Cancel);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
