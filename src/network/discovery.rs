//! Peer Discovery
//!
//! Finds peers by sweeping the local /24 for hosts that answer the control
//! port's info route. Probes run in bounded concurrent batches with a short
//! per-probe timeout; anything that fails or times out is simply not a peer.
//! Discovered addresses carry a last-seen time and expire after the
//! configured TTL.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::config::DiscoveryConfig;
use super::protocol::{peer_url, routes, ServerInfo};

/// All host addresses of `self_addr`'s /24, excluding `self_addr`
pub fn subnet_hosts(self_addr: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, own] = self_addr.octets();
    (1..=254u8)
        .filter(|host| *host != own)
        .map(|host| Ipv4Addr::new(a, b, c, host))
        .collect()
}

/// Whether a polling tick should re-sweep the subnet
pub fn should_rescan(known_empty: bool, probability: f64, roll: f64) -> bool {
    known_empty || roll < probability
}

/// Sweeps the subnet and remembers who answered
pub struct DiscoveryScanner {
    client: reqwest::Client,
    config: DiscoveryConfig,
    port: u16,
    peers: RwLock<HashMap<Ipv4Addr, Instant>>,
    shutdown: CancellationToken,
}

impl DiscoveryScanner {
    pub fn new(config: DiscoveryConfig, port: u16) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_default();

        Self {
            client,
            config,
            port,
            peers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Control-port address of a peer
    pub fn endpoint(&self, host: Ipv4Addr) -> SocketAddr {
        SocketAddr::new(host.into(), self.port)
    }

    /// Abort sweeps in flight when `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Probe one host; true if it answered with a success status in time
    pub async fn probe(&self, host: Ipv4Addr) -> bool {
        let url = peer_url(self.endpoint(host), routes::SERVER_INFO);
        let request = self.client.get(url).send();

        tokio::select! {
            result = request => matches!(result, Ok(response) if response.status().is_success()),
            _ = tokio::time::sleep(self.config.probe_timeout()) => false,
            _ = self.shutdown.cancelled() => false,
        }
    }

    /// Ask a peer who it is
    pub async fn server_info(&self, host: Ipv4Addr) -> Option<ServerInfo> {
        let url = peer_url(self.endpoint(host), routes::SERVER_INFO);
        let response = self
            .client
            .get(url)
            .timeout(self.config.probe_timeout())
            .send()
            .await
            .ok()?;
        response.json().await.ok()
    }

    /// Sweep the whole subnet of `self_addr`
    pub async fn scan(&self, self_addr: Ipv4Addr) -> HashSet<Ipv4Addr> {
        let hosts = subnet_hosts(self_addr);
        let started = Instant::now();
        let mut found = HashSet::new();

        for batch in hosts.chunks(self.config.batch_size.max(1)) {
            let results = join_all(batch.iter().map(|host| async move {
                (*host, self.probe(*host).await)
            }))
            .await;

            found.extend(results.into_iter().filter(|(_, alive)| *alive).map(|(host, _)| host));
        }

        {
            let now = Instant::now();
            let mut peers = self.peers.write().await;
            for host in &found {
                if peers.insert(*host, now).is_none() {
                    tracing::info!("Discovered peer {}", host);
                }
            }
        }

        tracing::debug!(
            "Swept {} hosts around {} in {:.2}s, {} answered",
            hosts.len(),
            self_addr,
            started.elapsed().as_secs_f64(),
            found.len()
        );

        found
    }

    /// One polling tick: sweep when nothing is known, otherwise only sometimes
    pub async fn tick(&self, self_addr: Ipv4Addr) -> HashSet<Ipv4Addr> {
        let known = self.peers().await;
        if should_rescan(known.is_empty(), self.config.rescan_probability, rand::random::<f64>()) {
            self.scan(self_addr).await;
            self.peers().await
        } else {
            known
        }
    }

    /// Known peers, after dropping the ones not seen within the TTL
    pub async fn peers(&self) -> HashSet<Ipv4Addr> {
        let ttl = self.config.peer_ttl();
        let mut peers = self.peers.write().await;
        peers.retain(|host, seen| {
            let fresh = seen.elapsed() <= ttl;
            if !fresh {
                tracing::debug!("Peer {} expired", host);
            }
            fresh
        });
        peers.keys().copied().collect()
    }

    /// Refresh a peer's last-seen time, adding it if unknown
    pub async fn mark_seen(&self, host: Ipv4Addr) {
        self.peers.write().await.insert(host, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::serve_on;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;

    #[test]
    fn test_subnet_hosts_excludes_self() {
        let hosts = subnet_hosts(Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(hosts.len(), 253);
        assert!(!hosts.contains(&Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(hosts.first(), Some(&Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(hosts.last(), Some(&Ipv4Addr::new(192, 168, 1, 254)));
        assert!(hosts.iter().all(|h| h.octets()[..3] == [192, 168, 1]));
    }

    #[test]
    fn test_rescan_decision() {
        assert!(should_rescan(true, 0.3, 0.99));
        assert!(should_rescan(false, 0.3, 0.1));
        assert!(!should_rescan(false, 0.3, 0.5));
        assert!(!should_rescan(false, 0.0, 0.0));
    }

    #[tokio::test]
    async fn test_scan_keeps_only_successful_timely_peers() {
        let alive = Router::new().route("/get-server-info", get(|| async { "ok" }));
        let addr = serve_on("127.0.0.1:0", alive).await;
        let port = addr.port();

        let broken = Router::new().route(
            "/get-server-info",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        serve_on(&format!("127.0.0.2:{}", port), broken).await;

        let slow = Router::new().route(
            "/get-server-info",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "late"
            }),
        );
        serve_on(&format!("127.0.0.3:{}", port), slow).await;

        let scanner = DiscoveryScanner::new(DiscoveryConfig::default(), port);
        let found = scanner.scan(Ipv4Addr::new(127, 0, 0, 50)).await;

        assert_eq!(found, HashSet::from([Ipv4Addr::new(127, 0, 0, 1)]));
        assert_eq!(scanner.peers().await, found);
    }

    #[tokio::test]
    async fn test_stale_peers_expire() {
        let config = DiscoveryConfig {
            peer_ttl_secs: 0,
            ..Default::default()
        };
        let scanner = DiscoveryScanner::new(config, 3030);
        scanner.mark_seen(Ipv4Addr::new(10, 0, 0, 9)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(scanner.peers().await.is_empty());

        let scanner = DiscoveryScanner::new(DiscoveryConfig::default(), 3030);
        scanner.mark_seen(Ipv4Addr::new(10, 0, 0, 9)).await;
        assert_eq!(scanner.peers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_tick_skips_sweep_when_peers_known() {
        let config = DiscoveryConfig {
            rescan_probability: 0.0,
            ..Default::default()
        };
        let scanner = DiscoveryScanner::new(config, 1);
        scanner.mark_seen(Ipv4Addr::new(10, 0, 0, 9)).await;

        let peers = scanner.tick(Ipv4Addr::new(10, 0, 0, 1)).await;
        assert_eq!(peers, HashSet::from([Ipv4Addr::new(10, 0, 0, 9)]));
    }
}
