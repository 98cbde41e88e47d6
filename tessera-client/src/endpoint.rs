//! Replica endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{AddrParseError, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// An IPv4 replica address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(SocketAddrV4);

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self(SocketAddrV4::new(ip, port))
    }

    /// Builds an endpoint from a host-order IPv4 address.
    pub fn from_u32(ip: u32, port: u16) -> Self {
        Self::new(Ipv4Addr::from(ip), port)
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Stable 64-bit identity used by replica selection: `ip << 32 | port`.
    pub fn identity(&self) -> u64 {
        (u32::from(self.ip()) as u64) << 32 | self.port() as u64
    }

    /// The same host with the port moved by `delta`, or `None` on overflow.
    pub fn with_port_offset(&self, delta: u16) -> Option<Self> {
        let port = self.port().checked_add(delta)?;
        Some(Self::new(self.ip(), port))
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(self.0)
    }

    /// Parses a comma-separated endpoint list, ignoring blank entries.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, AddrParseError> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<Endpoint>())
            .collect()
    }
}

impl FromStr for Endpoint {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
