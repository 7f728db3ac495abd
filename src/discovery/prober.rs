//! Reachability probing.
//!
//! Liveness is checked with ICMP echo over one client shared by the whole
//! batch; only live hosts get a TCP connect against the target port. Neither
//! an unreachable host nor a closed port is an error.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use surge_ping::{Client, Config, PingIdentifier, PingSequence};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::model::validate_ipv4;

/// Default ICMP echo timeout per attempt (1 second).
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of retries after a failed echo.
const DEFAULT_PING_RETRIES: u32 = 1;

/// Default TCP connect timeout (3 seconds).
const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of concurrent probes.
const DEFAULT_CONCURRENCY: usize = 64;

fn default_ping_timeout() -> Duration {
    DEFAULT_PING_TIMEOUT
}

fn default_ping_retries() -> u32 {
    DEFAULT_PING_RETRIES
}

fn default_port_timeout() -> Duration {
    DEFAULT_PORT_TIMEOUT
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

/// Probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// ICMP echo timeout per attempt (default: 1s).
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// Retries after a failed echo (default: 1).
    #[serde(default = "default_ping_retries")]
    pub ping_retries: u32,
    /// TCP connect timeout (default: 3s).
    #[serde(default = "default_port_timeout", with = "humantime_serde")]
    pub port_timeout: Duration,
    /// Concurrent probes per batch (default: 64).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ping_timeout: DEFAULT_PING_TIMEOUT,
            ping_retries: DEFAULT_PING_RETRIES,
            port_timeout: DEFAULT_PORT_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Errors raised by a probe backend.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The ICMP client could not be created (e.g. missing socket permission).
    #[error("failed to create ICMP client: {0}")]
    Client(String),
}

/// Liveness of one address. `port_open` implies `reachable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reachability {
    pub address: String,
    pub reachable: bool,
    pub port_open: bool,
}

/// Transport used by the [`Prober`].
#[async_trait::async_trait]
pub trait ProbeBackend: Send + Sync + 'static {
    /// Liveness of each address, in input order.
    async fn ping_all(&self, addresses: &[Ipv4Addr]) -> Result<Vec<bool>, ProbeError>;

    /// Whether a TCP connection to `address:port` can be established.
    async fn port_open(&self, address: Ipv4Addr, port: u16) -> bool;
}

// =============================================================================
// Network backend
// =============================================================================

/// ICMP echo + TCP connect backend.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    config: ProbeConfig,
}

impl NetworkProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl ProbeBackend for NetworkProbe {
    async fn ping_all(&self, addresses: &[Ipv4Addr]) -> Result<Vec<bool>, ProbeError> {
        let client = Client::new(&Config::default()).map_err(|e| ProbeError::Client(e.to_string()))?;
        let permits = Semaphore::new(self.config.concurrency.max(1));

        let checks = addresses.iter().map(|ip| {
            let (client, permits) = (&client, &permits);
            async move {
                let _permit = permits.acquire().await;
                ping_one(client, *ip, self.config.ping_timeout, self.config.ping_retries).await
            }
        });
        Ok(join_all(checks).await)
    }

    async fn port_open(&self, address: Ipv4Addr, port: u16) -> bool {
        let addr = SocketAddrV4::new(address, port);
        match timeout(self.config.port_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(target = %addr, error = %e, "Port closed");
                false
            }
            Err(_) => {
                tracing::debug!(target = %addr, timeout_ms = self.config.port_timeout.as_millis(), "Port probe timed out");
                false
            }
        }
    }
}

async fn ping_one(client: &Client, ip: Ipv4Addr, probe_timeout: Duration, retries: u32) -> bool {
    let mut pinger = client.pinger(IpAddr::V4(ip), PingIdentifier(rand::random())).await;
    pinger.timeout(probe_timeout);

    for attempt in 0..=retries {
        let seq = PingSequence(u16::try_from(attempt).unwrap_or(u16::MAX));
        match timeout(probe_timeout, pinger.ping(seq, &[])).await {
            Ok(Ok((_, rtt))) => {
                tracing::debug!(host = %ip, latency_ms = rtt.as_secs_f64() * 1000.0, "Host alive");
                return true;
            }
            Ok(Err(e)) => tracing::debug!(host = %ip, attempt, error = %e, "Ping failed"),
            Err(_) => tracing::debug!(host = %ip, attempt, "Ping timed out"),
        }
    }
    false
}

// =============================================================================
// Prober
// =============================================================================

/// Batch reachability checks over a [`ProbeBackend`].
#[derive(Clone)]
pub struct Prober {
    backend: Arc<dyn ProbeBackend>,
    concurrency: usize,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Prober {
    pub fn new(backend: Arc<dyn ProbeBackend>, concurrency: usize) -> Self {
        Self {
            backend,
            concurrency: concurrency.max(1),
        }
    }

    /// Probe every address against `port`.
    ///
    /// Returns one result per input address, in input order. Liveness for
    /// the whole batch completes before any port is probed.
    pub async fn probe(&self, addresses: &[String], port: u16) -> Vec<Reachability> {
        let parsed: Vec<Option<Ipv4Addr>> = addresses
            .iter()
            .map(|a| match validate_ipv4(a) {
                Ok(ip) => Some(ip),
                Err(e) => {
                    tracing::warn!(address = %a, error = %e, "Skipping invalid address");
                    None
                }
            })
            .collect();
        let valid: Vec<Ipv4Addr> = parsed.iter().flatten().copied().collect();

        let mut alive = match self.backend.ping_all(&valid).await {
            Ok(alive) if alive.len() == valid.len() => alive,
            Ok(alive) => {
                tracing::error!(expected = valid.len(), got = alive.len(), "Probe backend returned wrong count, treating batch as unreachable");
                vec![false; valid.len()]
            }
            Err(e) => {
                tracing::warn!(error = %e, hosts = valid.len(), "Liveness probing unavailable, treating batch as unreachable");
                vec![false; valid.len()]
            }
        }
        .into_iter();

        let live: Vec<Option<Ipv4Addr>> = parsed
            .iter()
            .map(|ip| ip.filter(|_| alive.next().unwrap_or(false)))
            .collect();

        let permits = Semaphore::new(self.concurrency);
        let ports = join_all(live.iter().map(|ip| {
            let permits = &permits;
            async move {
                match ip {
                    Some(ip) => {
                        let _permit = permits.acquire().await;
                        self.backend.port_open(*ip, port).await
                    }
                    None => false,
                }
            }
        }))
        .await;

        let results: Vec<Reachability> = addresses
            .iter()
            .zip(live.iter().zip(ports))
            .map(|(address, (ip, open))| Reachability {
                address: address.clone(),
                reachable: ip.is_some(),
                port_open: ip.is_some() && open,
            })
            .collect();

        tracing::debug!(
            hosts = results.len(),
            reachable = results.iter().filter(|r| r.reachable).count(),
            port_open = results.iter().filter(|r| r.port_open).count(),
            port,
            "Probe batch complete"
        );
        results
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Backend answering from fixed sets.
    pub(crate) struct FakeBackend {
        pub alive: HashSet<Ipv4Addr>,
        pub open: HashSet<Ipv4Addr>,
        pub fail: bool,
    }

    impl FakeBackend {
        pub(crate) fn new(alive: &[&str], open: &[&str]) -> Self {
            let parse = |v: &[&str]| v.iter().map(|a| a.parse().unwrap()).collect();
            Self {
                alive: parse(alive),
                open: parse(open),
                fail: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl ProbeBackend for FakeBackend {
        async fn ping_all(&self, addresses: &[Ipv4Addr]) -> Result<Vec<bool>, ProbeError> {
            if self.fail {
                return Err(ProbeError::Client("permission denied".into()));
            }
            Ok(addresses.iter().map(|a| self.alive.contains(a)).collect())
        }

        async fn port_open(&self, address: Ipv4Addr, _port: u16) -> bool {
            self.open.contains(&address)
        }
    }

    fn addrs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_probe_preserves_order_and_invariant() {
        // 10.0.0.4 has an "open" port but is not alive: must be reported closed.
        let backend = FakeBackend::new(&["10.0.0.1", "10.0.0.3"], &["10.0.0.1", "10.0.0.4"]);
        let prober = Prober::new(Arc::new(backend), 4);

        let input = addrs(&["10.0.0.4", "10.0.0.3", "bogus", "10.0.0.1", "10.0.0.2"]);
        let results = prober.probe(&input, 22).await;

        assert_eq!(results.len(), 5);
        let order: Vec<_> = results.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(order, vec!["10.0.0.4", "10.0.0.3", "bogus", "10.0.0.1", "10.0.0.2"]);

        assert!(!results[0].reachable && !results[0].port_open);
        assert!(results[1].reachable && !results[1].port_open);
        assert!(!results[2].reachable);
        assert!(results[3].reachable && results[3].port_open);
        assert!(!results[4].reachable);
        assert!(results.iter().all(|r| r.reachable || !r.port_open));
    }

    #[tokio::test]
    async fn test_backend_failure_means_unreachable() {
        let mut backend = FakeBackend::new(&["10.0.0.1"], &["10.0.0.1"]);
        backend.fail = true;
        let prober = Prober::new(Arc::new(backend), 4);

        let results = prober.probe(&addrs(&["10.0.0.1", "10.0.0.2"]), 22).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.reachable && !r.port_open));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let prober = Prober::new(Arc::new(FakeBackend::new(&[], &[])), 4);
        assert!(prober.probe(&[], 22).await.is_empty());
    }

    #[tokio::test]
    async fn test_network_port_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        let closed_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let probe = NetworkProbe::new(ProbeConfig {
            port_timeout: Duration::from_millis(500),
            ..ProbeConfig::default()
        });
        assert!(probe.port_open(Ipv4Addr::LOCALHOST, open_port).await);
        assert!(!probe.port_open(Ipv4Addr::LOCALHOST, closed_port).await);
    }

    #[test]
    fn test_probe_config_defaults() {
        let config: ProbeConfig = serde_yaml::from_str("ping_timeout: 250ms").unwrap();
        assert_eq!(config.ping_timeout, Duration::from_millis(250));
        assert_eq!(config.ping_retries, 1);
        assert_eq!(config.port_timeout, DEFAULT_PORT_TIMEOUT);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
    }
}
