//! Network and destination types

use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::ProxyError;

/// Transport network of a connection or destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
        })
    }
}

/// Host part of a destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(IpAddr),
    Domain(String),
}

impl Address {
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Domain(domain) => f.write_str(domain),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

/// Where a session is headed: network, host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
    pub port: u16,
}

impl Destination {
    pub fn tcp(address: impl Into<Address>, port: u16) -> Self {
        Self {
            network: Network::Tcp,
            address: address.into(),
            port,
        }
    }

    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Self::tcp(Address::Domain(domain.into()), port)
    }

    /// Resolve to a socket address, querying DNS for domain destinations
    pub async fn to_socket_addr(&self) -> io::Result<SocketAddr> {
        match &self.address {
            Address::Ip(ip) => Ok(SocketAddr::new(*ip, self.port)),
            Address::Domain(domain) => {
                let mut addrs = tokio::net::lookup_host((domain.as_str(), self.port)).await?;
                addrs.next().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses found for {}", domain),
                    )
                })
            }
        }
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Self::tcp(addr.ip(), addr.port())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.network, self.address, self.port)
    }
}

/// Parses `host:port` or `[v6]:port` into a TCP destination
impl FromStr for Destination {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let invalid = || ProxyError::Config(format!("invalid destination '{}', expected host:port", s));
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || host.contains(':') || host.starts_with('[') {
            return Err(invalid());
        }

        Ok(match host.parse::<IpAddr>() {
            Ok(ip) => Self::tcp(ip, port),
            Err(_) => Self::domain(host, port),
        })
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
