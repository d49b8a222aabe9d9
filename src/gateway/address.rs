use std::{fmt, net::SocketAddr, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::message::SiloAddress;

/// The client-facing endpoint of a gateway silo.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayAddress(SocketAddr);

impl GatewayAddress {
    /// Wraps a socket address.
    pub const fn new(endpoint: SocketAddr) -> Self {
        GatewayAddress(endpoint)
    }

    /// The socket address.
    pub const fn endpoint(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for GatewayAddress {
    fn from(endpoint: SocketAddr) -> Self {
        GatewayAddress(endpoint)
    }
}

impl From<SiloAddress> for GatewayAddress {
    fn from(silo: SiloAddress) -> Self {
        GatewayAddress(silo.endpoint)
    }
}

impl FromStr for GatewayAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(GatewayAddress)
    }
}

impl fmt::Display for GatewayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
