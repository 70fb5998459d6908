use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
};

use crate::error::EndpointError;

/// An IPv4 address and port used as a bind target or a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    /// `0.0.0.0:0`, used where a role ignores one of its endpoints.
    pub const UNSPECIFIED: Endpoint = Endpoint::new(Ipv4Addr::UNSPECIFIED, 0);

    pub const fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    pub const fn localhost(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    /// Validates the separate address and port fields a settings form would supply.
    pub fn parse(address: &str, port: &str) -> Result<Self, EndpointError> {
        let address = address.trim();
        let port = port.trim();
        let address = Ipv4Addr::from_str(address)
            .map_err(|_| EndpointError::InvalidAddress(address.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
        Ok(Self::new(address, port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
        Self::parse(address, port)
    }
}

impl TryFrom<SocketAddr> for Endpoint {
    type Error = EndpointError;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self::new(*v4.ip(), v4.port())),
            SocketAddr::V6(_) => Err(EndpointError::NotIpv4(addr)),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.socket_addr()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
