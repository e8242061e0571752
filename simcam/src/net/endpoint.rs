//! Socket addresses as they appear in configuration and logs.

use std::net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Port the relay listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 8080;

/// An IP address and port, written `"ip:port"` in TOML and on the command
/// line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// `0.0.0.0:port`, every IPv4 interface.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// `127.0.0.1:port`.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Keeps the address, replaces the port.
    #[must_use]
    pub const fn with_port(self, port: u16) -> Self {
        Self(SocketAddr::new(self.0.ip(), port))
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::any(DEFAULT_PORT)
    }
}

impl FromStr for Endpoint {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listens_everywhere_on_8080() {
        let endpoint = Endpoint::default();
        assert_eq!(endpoint.to_string(), "0.0.0.0:8080");
        assert_eq!(endpoint.port(), DEFAULT_PORT);
    }

    #[test]
    fn parse_and_replace_port() {
        let endpoint: Endpoint = "127.0.0.1:0".parse().unwrap();
        assert_eq!(endpoint, Endpoint::localhost(0));
        assert_eq!(endpoint.with_port(9100).to_string(), "127.0.0.1:9100");
        assert!("not an address".parse::<Endpoint>().is_err());
    }

    #[test]
    fn socket_addr_conversions() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(Endpoint::from(addr).as_socket_addr(), addr);
        assert_eq!(SocketAddr::from(Endpoint::from(addr)), addr);
    }
}
