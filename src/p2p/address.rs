//! Peer address parsing and host resolution.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};

use super::error::TransportError;

/// Longest announced address accepted from a peer
pub const MAX_ANNOUNCED_ADDRESS_LENGTH: usize = 100;

/// A parsed `host[:port]` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// Lower-cased host name or IP literal, without IPv6 brackets
    pub host: String,
    pub port: Option<u16>,
}

impl PeerAddress {
    pub fn port_or(&self, default_port: u16) -> u16 {
        self.port.unwrap_or(default_port)
    }

    /// Host as it must appear in a URL or `host:port` string
    pub fn host_for_url(&self) -> String {
        host_for_url(&self.host)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host_for_url(), port),
            None => write!(f, "{}", self.host_for_url()),
        }
    }
}

pub fn host_for_url(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
///
/// Returns None for empty hosts, bad ports, illegal host characters, and
/// anything longer than [`MAX_ANNOUNCED_ADDRESS_LENGTH`].
pub fn parse_address(address: &str) -> Option<PeerAddress> {
    let address = address.trim().to_ascii_lowercase();
    if address.is_empty() || address.len() > MAX_ANNOUNCED_ADDRESS_LENGTH {
        return None;
    }

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        host.parse::<std::net::Ipv6Addr>().ok()?;
        let port = match tail {
            "" => None,
            t => Some(t.strip_prefix(':')?.parse::<u16>().ok()?),
        };
        (host.to_string(), port)
    } else if address.matches(':').count() > 1 {
        // bare IPv6 literal, no port possible
        address.parse::<std::net::Ipv6Addr>().ok()?;
        (address.clone(), None)
    } else {
        match address.split_once(':') {
            Some((host, port)) => (host.to_string(), Some(port.parse::<u16>().ok()?)),
            None => (address.clone(), None),
        }
    };

    if host.is_empty() || port == Some(0) {
        return None;
    }
    let legal = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'));
    if !legal || host.starts_with('.') || host.starts_with('-') {
        return None;
    }
    Some(PeerAddress { host, port })
}

/// Normalise an address to `host` or `host:port`, keeping the port only
/// when it differs from the default peer port.
pub fn address_with_port(address: &str, default_port: u16) -> Option<String> {
    let parsed = parse_address(address)?;
    Some(match parsed.port {
        Some(port) if port != default_port => parsed.to_string(),
        _ => parsed.host_for_url(),
    })
}

/// Loopback, link-local and unspecified addresses are never peers,
/// except on single-host test networks.
pub fn is_peerable_ip(ip: &IpAddr, local_test_mode: bool) -> bool {
    if local_test_mode {
        return !ip.is_unspecified();
    }
    let link_local = match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    };
    !(ip.is_loopback() || ip.is_unspecified() || link_local)
}

/// Name resolution used for peer identity checks.
pub trait Resolver: Send + Sync {
    /// Resolve a host name or IP literal. Literals never touch DNS.
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, TransportError>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, TransportError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let addrs = (host, 0)
            .to_socket_addrs()
            .map_err(|_| TransportError::Dns(host.to_string()))?;
        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            return Err(TransportError::Dns(host.to_string()));
        }
        Ok(ips)
    }
}

/// Fixed name table; IP literals resolve to themselves.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, ips: &[IpAddr]) -> Self {
        self.entries.insert(name.to_ascii_lowercase(), ips.to_vec());
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, TransportError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        self.entries
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TransportError::Dns(host.to_string()))
    }
}
