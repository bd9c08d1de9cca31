//! Broadcast presence discovery for the broker host
//!
//! This module handles:
//! - Locating the broadcast address of the interface facing the server
//! - Listening for the server's presence datagrams on the presence port
//! - Probing each announcer until one answers the broker handshake
//!
//! Only the datagram's source address matters; the payload is read but not
//! interpreted.

use crate::broker::probe::Probe;
use crate::error::DiscoveryError;
use async_trait::async_trait;
use if_addrs::{get_if_addrs, IfAddr};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interface used when none is configured
pub const DEFAULT_INTERFACE: &str = "eth0";

/// Presence datagrams are tiny; anything past this is dropped
const PRESENCE_READ_LEN: usize = 2;

/// How a listening session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenOutcome {
    /// An announcer whose broker answered the probe
    Found(String),
    /// Operator shutdown
    Interrupted,
}

/// Address to bind the presence socket to: the IPv4 broadcast address of
/// `interface`, or the wildcard address when it has none
pub fn presence_bind_address(interface: Option<&str>, port: u16) -> Result<SocketAddr, DiscoveryError> {
    let interface = interface.unwrap_or_else(|| {
        warn!("No interface configured for discovery, using '{}'", DEFAULT_INTERFACE);
        DEFAULT_INTERFACE
    });

    let addrs = get_if_addrs().map_err(DiscoveryError::Interfaces)?;
    let broadcast = addrs
        .iter()
        .filter(|a| a.name == interface)
        .find_map(|a| match &a.addr {
            IfAddr::V4(v4) => v4.broadcast,
            IfAddr::V6(_) => None,
        });

    let ip = match broadcast {
        Some(broadcast) => {
            debug!("Interface {} broadcasts on {}", interface, broadcast);
            broadcast
        }
        None => {
            warn!("Interface {} has no IPv4 broadcast address, listening on all interfaces", interface);
            Ipv4Addr::UNSPECIFIED
        }
    };

    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Where presence datagrams come from
#[async_trait]
trait PresenceSource: Send + Sync {
    async fn recv_presence(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl PresenceSource for UdpSocket {
    async fn recv_presence(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Broadcast-capable UDP socket waiting for presence announcements
#[derive(Debug)]
pub struct DiscoveryListener {
    socket: UdpSocket,
    poll_timeout: Duration,
}

impl DiscoveryListener {
    pub async fn bind(addr: SocketAddr, poll_timeout: Duration) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| DiscoveryError::Bind { addr, source })?;
        socket.set_broadcast(true)?;

        Ok(Self { socket, poll_timeout })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for an announcer whose broker passes `probe`. Returns on the
    /// first good announcer or on cancellation; the socket is closed either way.
    pub async fn listen<P>(self, probe: &P, token: &CancellationToken) -> ListenOutcome
    where
        P: Probe + ?Sized,
    {
        let local = self
            .socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("Looking for FarmMonitor presence on {}", local);

        watch(&self.socket, self.poll_timeout, probe, token).await
    }
}

/// Receive loop behind `DiscoveryListener::listen`. A failed receive waits
/// out one poll period before the next attempt.
async fn watch<S, P>(socket: &S, poll_timeout: Duration, probe: &P, token: &CancellationToken) -> ListenOutcome
where
    S: PresenceSource + ?Sized,
    P: Probe + ?Sized,
{
    let mut buf = [0u8; PRESENCE_READ_LEN];
    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                info!("Presence discovery interrupted");
                return ListenOutcome::Interrupted;
            }

            received = tokio::time::timeout(poll_timeout, socket.recv_presence(&mut buf)) => {
                match received {
                    Err(_) => debug!("No broadcast from FarmMonitor yet"),
                    Ok(Err(e)) => {
                        warn!("Presence socket receive failed: {}, retrying in {:?}", e, poll_timeout);
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => {
                                info!("Presence discovery interrupted");
                                return ListenOutcome::Interrupted;
                            }
                            _ = tokio::time::sleep(poll_timeout) => {}
                        }
                    }
                    Ok(Ok((len, source))) => {
                        let address = source.ip().to_string();
                        debug!("Presence datagram ({} bytes) from {}", len, source);
                        if probe.probe(&address).await {
                            info!("Found FarmMonitor at {}", source);
                            return ListenOutcome::Found(address);
                        }
                        debug!("Reply from {}, but no broker present", source);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Answers from a script, remembering who was asked
    struct SequenceProbe {
        answers: Mutex<VecDeque<bool>>,
        asked: Mutex<Vec<String>>,
    }

    impl SequenceProbe {
        fn new(answers: &[bool]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                asked: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Probe for SequenceProbe {
        async fn probe(&self, address: &str) -> bool {
            self.asked.lock().push(address.to_string());
            self.answers.lock().pop_front().unwrap_or(false)
        }
    }

    async fn loopback_listener(poll: Duration) -> (DiscoveryListener, SocketAddr) {
        let listener = DiscoveryListener::bind("127.0.0.1:0".parse().unwrap(), poll)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_ignores_announcer_without_broker() {
        let (listener, addr) = loopback_listener(Duration::from_millis(50)).await;
        let probe = Arc::new(SequenceProbe::new(&[false, true]));
        let token = CancellationToken::new();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"fm", addr).await.unwrap();
        sender.send_to(b"fm", addr).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), listener.listen(probe.as_ref(), &token))
            .await
            .unwrap();

        assert_eq!(outcome, ListenOutcome::Found("127.0.0.1".to_string()));
        assert_eq!(probe.asked.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_datagram_still_counts() {
        let (listener, addr) = loopback_listener(Duration::from_millis(50)).await;
        let probe = SequenceProbe::new(&[true]);
        let token = CancellationToken::new();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"farm monitor presence", addr).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), listener.listen(&probe, &token))
            .await
            .unwrap();
        assert!(matches!(outcome, ListenOutcome::Found(_)));
    }

    #[tokio::test]
    async fn test_cancellation_while_idle() {
        let (listener, _) = loopback_listener(Duration::from_millis(20)).await;
        let probe = SequenceProbe::new(&[]);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), listener.listen(&probe, &token))
            .await
            .unwrap();
        assert_eq!(outcome, ListenOutcome::Interrupted);
        assert!(probe.asked.lock().is_empty());
    }

    /// Socket whose every receive fails at once
    #[derive(Default)]
    struct BrokenSocket {
        receives: AtomicUsize,
    }

    #[async_trait]
    impl PresenceSource for BrokenSocket {
        async fn recv_presence(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.receives.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "network is down"))
        }
    }

    #[tokio::test]
    async fn test_receive_errors_back_off() {
        let socket = BrokenSocket::default();
        let probe = SequenceProbe::new(&[]);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            watch(&socket, Duration::from_millis(100), &probe, &token),
        )
        .await
        .unwrap();

        assert_eq!(outcome, ListenOutcome::Interrupted);
        let receives = socket.receives.load(Ordering::SeqCst);
        assert!((1..=5).contains(&receives), "{} receives in 350ms", receives);
        assert!(probe.asked.lock().is_empty());
    }

    #[test]
    fn test_unknown_interface_falls_back_to_wildcard() {
        let addr = presence_bind_address(Some("no-such-if0"), 5554).unwrap();
        assert_eq!(addr, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5554));
    }
}
