//! Core types used throughout NATlab.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An IPv4 UDP endpoint: four address bytes plus a 16-bit port.
///
/// Compared by equality of all five bytes. The all-zero endpoint doubles
/// as the "masked" wildcard in table keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UdpEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl UdpEndpoint {
    /// The unspecified endpoint, `0.0.0.0:0`.
    pub const UNSPECIFIED: Self = Self {
        ip: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    /// The endpoint as a socket address, for bind/send calls.
    pub fn to_socket_addr(self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// Convert a generic socket address, if it is IPv4 (or IPv4-mapped).
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self::new(*v4.ip(), v4.port())),
            SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().map(|ip| Self::new(ip, v6.port())),
        }
    }
}

impl From<SocketAddrV4> for UdpEndpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<UdpEndpoint> for SocketAddr {
    fn from(ep: UdpEndpoint) -> Self {
        SocketAddr::V4(ep.to_socket_addr())
    }
}

impl fmt::Display for UdpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for UdpEndpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddrV4::from_str(s).map(Self::from)
    }
}

/// An ordered (source, destination) pair of UDP endpoints.
///
/// Used both as a table key (after masking) and as the description of a
/// datagram's addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UdpTuple {
    pub src: UdpEndpoint,
    pub dst: UdpEndpoint,
}

impl UdpTuple {
    pub const fn new(src: UdpEndpoint, dst: UdpEndpoint) -> Self {
        Self { src, dst }
    }

    /// Swap source and destination.
    pub fn flip(self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for UdpTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// The role an interface plays in the NAT datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceRole {
    /// Private side: packets arriving here are translated outbound.
    Lan,
    /// Public side: packets arriving here are translated inbound.
    Wan,
}

impl fmt::Display for InterfaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lan => write!(f, "lan"),
            Self::Wan => write!(f, "wan"),
        }
    }
}

/// Check whether an IPv4 address is in RFC 1918 private space.
pub fn is_rfc1918(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10 || (o[0] == 172 && o[1] & 0xf0 == 16) || (o[0] == 192 && o[1] == 168)
}

/// Check whether an IPv4 address is plausibly a public, globally
/// routable unicast address.
pub fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_unspecified()
        || is_rfc1918(ip))
}
