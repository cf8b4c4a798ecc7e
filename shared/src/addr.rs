//! Network address model for the discovery protocol.
//!
//! The wire protocol only ever carries IPv4 endpoints, but the discovery
//! pipeline also broadcasts on legacy IPX segments when asked to, so the
//! address is a small tagged union rather than a bare `SocketAddr`. Two
//! addresses compare equal iff the family and every field match, which is
//! what the ping/finished bookkeeping relies on.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// A game server endpoint as the discovery pipeline sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetAddress {
    /// IPv4 host and port. The only family the master protocol carries.
    Ip { host: [u8; 4], port: u16 },
    /// Legacy IPX endpoint, kept for LAN broadcast on old segments.
    Ipx {
        net: [u8; 4],
        node: [u8; 6],
        port: u16,
    },
}

impl NetAddress {
    /// The IPv4 link-local broadcast endpoint for `port`.
    pub fn ip_broadcast(port: u16) -> NetAddress {
        NetAddress::Ip {
            host: [255, 255, 255, 255],
            port,
        }
    }

    /// The IPX broadcast endpoint for `port`.
    pub fn ipx_broadcast(port: u16) -> NetAddress {
        NetAddress::Ipx {
            net: [0, 0, 0, 0],
            node: [0xFF; 6],
            port,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        match self {
            NetAddress::Ip { host, .. } => *host == [255, 255, 255, 255],
            NetAddress::Ipx { node, .. } => *node == [0xFF; 6],
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            NetAddress::Ip { port, .. } | NetAddress::Ipx { port, .. } => *port,
        }
    }

    /// The UDP socket address for this endpoint, if the host has one.
    /// IPX endpoints have no socket representation here.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            NetAddress::Ip { host, port } => Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(host[0], host[1], host[2], host[3]),
                *port,
            ))),
            NetAddress::Ipx { .. } => None,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Option<NetAddress> {
        match addr.ip() {
            IpAddr::V4(v4) => Some(NetAddress::Ip {
                host: v4.octets(),
                port: addr.port(),
            }),
            IpAddr::V6(_) => None,
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddress::Ip { host, port } => {
                write!(f, "{}.{}.{}.{}:{}", host[0], host[1], host[2], host[3], port)
            }
            NetAddress::Ipx { net, node, port } => {
                write!(
                    f,
                    "IPX:{:02X}{:02X}{:02X}{:02X}:{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}:{}",
                    net[0], net[1], net[2], net[3], node[0], node[1], node[2], node[3], node[4],
                    node[5], port
                )
            }
        }
    }
}

/// Failure to parse an address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrParseError(String);

impl fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad net address: {}", self.0)
    }
}

impl std::error::Error for AddrParseError {}

impl FromStr for NetAddress {
    type Err = AddrParseError;

    /// Accepts `host:port`, an optional `IP:` prefix, and the `BROADCAST`
    /// host sentinel (`IP:BROADCAST:28000`). Hostnames are not resolved
    /// here; the caller decides whether DNS is appropriate.
    fn from_str(s: &str) -> Result<NetAddress, AddrParseError> {
        let rest = s.strip_prefix("IP:").unwrap_or(s);
        if let Some(port) = rest.strip_prefix("BROADCAST:") {
            let port: u16 = port.parse().map_err(|_| AddrParseError(s.to_string()))?;
            return Ok(NetAddress::ip_broadcast(port));
        }
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| AddrParseError(s.to_string()))?;
        let port: u16 = port.parse().map_err(|_| AddrParseError(s.to_string()))?;
        let ip: Ipv4Addr = host.parse().map_err(|_| AddrParseError(s.to_string()))?;
        Ok(NetAddress::Ip {
            host: ip.octets(),
            port,
        })
    }
}
