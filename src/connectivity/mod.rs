//! Connectivity aggregation: every way a running service can be reached.
//!
//! Reachability is computed on demand from a snapshot of running services,
//! the local network interfaces, the discovery name, and the tunnel session.
//! Nothing here blocks on network I/O beyond enumerating local interfaces;
//! tunnel URLs are read from the session record, never probed.

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// The complete set of addresses at which one service can currently be
/// reached, partitioned by scope. Derived, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityRecord {
    pub service: String,
    /// Always present for a running service
    pub loopback: String,
    /// One URL per non-loopback interface
    pub lan: Vec<String>,
    /// Local-discovery name, when a discovery client is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<String>,
    /// Public URL, when an active tunnel routes this service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<String>,
}

/// Network discovery seam. The real resolver (mDNS or otherwise) lives
/// outside this crate; implementations only need to hand back the resolvable
/// name they advertised.
pub trait Discovery: Send + Sync {
    /// Advertise the project's services; returns the resolvable host name.
    fn advertise(&self, project: &str, services: &[(String, u16)]) -> Result<String>;
}

/// Default discovery client: composes the conventional `{project}.local`
/// name without advertising anything itself.
#[derive(Debug, Clone, Default)]
pub struct LocalNameDiscovery;

impl Discovery for LocalNameDiscovery {
    fn advertise(&self, project: &str, _services: &[(String, u16)]) -> Result<String> {
        Ok(format!("{}.local", project))
    }
}

/// Computes reachability for running services.
///
/// Built from a read-only snapshot (running services + tunnel URLs) so it
/// never references the orchestrator or the live tunnel connection.
pub struct ConnectivityAggregator {
    running: HashMap<String, u16>,
    tunnel_urls: HashMap<String, String>,
    discovery_name: Option<String>,
}

impl ConnectivityAggregator {
    /// Build from a snapshot of running services `(name, port)`.
    pub fn new(running: Vec<(String, u16)>) -> Self {
        Self {
            running: running.into_iter().collect(),
            tunnel_urls: HashMap::new(),
            discovery_name: None,
        }
    }

    /// Attach per-service public URLs from an active tunnel session.
    pub fn with_tunnel_urls(mut self, urls: HashMap<String, String>) -> Self {
        self.tunnel_urls = urls;
        self
    }

    /// Advertise through the given discovery client and record the name.
    /// Discovery failures degrade to no discovery scope rather than failing
    /// reachability.
    pub fn with_discovery(mut self, discovery: &dyn Discovery, project: &str) -> Self {
        let services: Vec<(String, u16)> = self
            .running
            .iter()
            .map(|(name, port)| (name.clone(), *port))
            .collect();
        match discovery.advertise(project, &services) {
            Ok(name) => self.discovery_name = Some(name),
            Err(e) => tracing::warn!("Discovery advertisement failed: {}", e),
        }
        self
    }

    /// Compute the reachability record for one running service.
    ///
    /// Degrades gracefully: with no tunnel and no LAN interfaces the record
    /// still contains the loopback URL. Only a service missing from the
    /// running snapshot is an error.
    pub fn compute(&self, service: &str) -> Result<ConnectivityRecord> {
        let port = *self
            .running
            .get(service)
            .ok_or_else(|| Error::ServiceNotRunning(service.to_string()))?;

        let lan = lan_addresses()
            .into_iter()
            .map(|ip| format!("http://{}:{}", ip, port))
            .collect();

        Ok(ConnectivityRecord {
            service: service.to_string(),
            loopback: format!("http://localhost:{}", port),
            lan,
            discovery: self
                .discovery_name
                .as_ref()
                .map(|name| format!("http://{}:{}", name, port)),
            tunnel: self.tunnel_urls.get(service).cloned(),
        })
    }

    /// Records for every running service, sorted by name.
    pub fn compute_all(&self) -> Vec<ConnectivityRecord> {
        let mut names: Vec<&String> = self.running.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.compute(name).ok())
            .collect()
    }
}

/// Enumerate non-loopback IPv4 addresses on interfaces that are up.
///
/// Container-engine bridges (docker0, br-*, veth*) are skipped: addresses on
/// those reach containers, not this host's services.
pub fn lan_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    let Ok(ifaddrs) = getifaddrs() else {
        return addresses;
    };
    for ifaddr in ifaddrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
            || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        let name = ifaddr.interface_name.as_str();
        if name.starts_with("docker")
            || name.starts_with("br-")
            || name.starts_with("veth")
            || name.contains("bridge")
        {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            let addr = std::net::SocketAddrV4::from(*sin);
            let ip = *addr.ip();
            if !ip.is_loopback() {
                addresses.push(ip);
            }
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> ConnectivityAggregator {
        ConnectivityAggregator::new(vec![("ollama".to_string(), 11434)])
    }

    #[test]
    fn running_service_always_has_loopback() {
        let record = aggregator().compute("ollama").unwrap();
        assert_eq!(record.loopback, "http://localhost:11434");
    }

    #[test]
    fn unknown_service_is_an_error() {
        let err = aggregator().compute("redis").unwrap_err();
        assert!(matches!(err, Error::ServiceNotRunning(_)));
    }

    #[test]
    fn tunnel_scope_comes_from_the_session_snapshot() {
        let mut urls = HashMap::new();
        urls.insert(
            "ollama".to_string(),
            "https://demo.trycloudflare.com/ollama".to_string(),
        );
        let record = aggregator()
            .with_tunnel_urls(urls)
            .compute("ollama")
            .unwrap();
        assert_eq!(
            record.tunnel.as_deref(),
            Some("https://demo.trycloudflare.com/ollama")
        );
    }

    #[test]
    fn discovery_scope_uses_the_advertised_name() {
        let record = aggregator()
            .with_discovery(&LocalNameDiscovery, "demo")
            .compute("ollama")
            .unwrap();
        assert_eq!(record.discovery.as_deref(), Some("http://demo.local:11434"));
    }

    #[test]
    fn lan_enumeration_never_returns_loopback() {
        for ip in lan_addresses() {
            assert!(!ip.is_loopback());
        }
    }

    #[test]
    fn compute_all_is_sorted_by_name() {
        let aggregator = ConnectivityAggregator::new(vec![
            ("redis".to_string(), 6379),
            ("minio".to_string(), 9000),
        ]);
        let records = aggregator.compute_all();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].service, "minio");
        assert_eq!(records[1].service, "redis");
    }
}
