//! Self-describing layered network addresses.
//!
//! `/ip4/127.0.0.1/tcp/4001/ipfs/QmPeer` reads left to right: network layer,
//! transport layer, peer identity. Immutable after construction.

use crate::crypto::PeerId;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MultiaddrError {
    #[error("empty multiaddress")]
    Empty,

    #[error("unknown protocol segment: {0}")]
    UnknownProtocol(String),

    #[error("segment {0} is missing its value")]
    MissingValue(&'static str),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Tcp(u16),
    Ipfs(String),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Segment::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Segment::Tcp(port) => write!(f, "/tcp/{port}"),
            Segment::Ipfs(id) => write!(f, "/ipfs/{id}"),
        }
    }
}

/// A parsed multiaddress.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    segments: Vec<Segment>,
}

impl Multiaddr {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Convenience constructor for the common tcp listen/dial shape.
    pub fn tcp(ip: IpAddr, port: u16) -> Self {
        let ip_segment = match ip {
            IpAddr::V4(v4) => Segment::Ip4(v4),
            IpAddr::V6(v6) => Segment::Ip6(v6),
        };
        Self::new(vec![ip_segment, Segment::Tcp(port)])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.segments.iter().find_map(|s| match s {
            Segment::Ip4(ip) => Some(IpAddr::V4(*ip)),
            Segment::Ip6(ip) => Some(IpAddr::V6(*ip)),
            _ => None,
        })
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.segments.iter().find_map(|s| match s {
            Segment::Tcp(port) => Some(*port),
            _ => None,
        })
    }

    /// The `/ipfs/<id>` component, if present.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.segments.iter().find_map(|s| match s {
            Segment::Ipfs(id) => Some(PeerId::from_string(id.clone())),
            _ => None,
        })
    }

    /// True if this address names an IP endpoint we could dial.
    pub fn is_ip(&self) -> bool {
        self.ip().is_some() && self.tcp_port().is_some()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip()?, self.tcp_port()?))
    }

    /// A copy of this address with the `/ipfs/<id>` suffix replaced or added.
    pub fn with_peer(&self, id: &PeerId) -> Self {
        let mut segments: Vec<Segment> = self
            .segments
            .iter()
            .filter(|s| !matches!(s, Segment::Ipfs(_)))
            .cloned()
            .collect();
        segments.push(Segment::Ipfs(id.as_str().to_string()));
        Self::new(segments)
    }
}

impl FromStr for Multiaddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        // a leading slash yields one empty part before the first protocol
        match parts.next() {
            Some("") => {}
            _ => return Err(MultiaddrError::Empty),
        }

        let mut segments = Vec::new();
        while let Some(proto) = parts.next() {
            if proto.is_empty() {
                // tolerate a trailing slash
                continue;
            }
            let segment = match proto {
                "ip4" => {
                    let v = parts.next().ok_or(MultiaddrError::MissingValue("ip4"))?;
                    Segment::Ip4(v.parse().map_err(|_| {
                        MultiaddrError::InvalidValue("ip4", v.to_string())
                    })?)
                }
                "ip6" => {
                    let v = parts.next().ok_or(MultiaddrError::MissingValue("ip6"))?;
                    Segment::Ip6(v.parse().map_err(|_| {
                        MultiaddrError::InvalidValue("ip6", v.to_string())
                    })?)
                }
                "tcp" => {
                    let v = parts.next().ok_or(MultiaddrError::MissingValue("tcp"))?;
                    Segment::Tcp(v.parse().map_err(|_| {
                        MultiaddrError::InvalidValue("tcp", v.to_string())
                    })?)
                }
                "ipfs" | "p2p" => {
                    let v = parts.next().ok_or(MultiaddrError::MissingValue("ipfs"))?;
                    Segment::Ipfs(v.to_string())
                }
                other => return Err(MultiaddrError::UnknownProtocol(other.to_string())),
            };
            segments.push(segment);
        }

        if segments.is_empty() {
            return Err(MultiaddrError::Empty);
        }
        Ok(Self::new(segments))
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_address() {
        let ma: Multiaddr = "/ip4/127.0.0.1/tcp/4001/ipfs/QmPeerId".parse().unwrap();
        assert_eq!(ma.ip(), Some("127.0.0.1".parse().unwrap()));
        assert_eq!(ma.tcp_port(), Some(4001));
        assert_eq!(ma.peer_id().unwrap().as_str(), "QmPeerId");
        assert_eq!(ma.to_string(), "/ip4/127.0.0.1/tcp/4001/ipfs/QmPeerId");
    }

    #[test]
    fn parse_without_peer() {
        let ma: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        assert!(ma.is_ip());
        assert!(ma.peer_id().is_none());
        assert_eq!(ma.socket_addr().unwrap().to_string(), "10.0.0.1:4001");
    }

    #[test]
    fn p2p_alias() {
        let ma: Multiaddr = "/ip4/1.2.3.4/tcp/1/p2p/QmX".parse().unwrap();
        assert_eq!(ma.peer_id().unwrap().as_str(), "QmX");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Multiaddr>().is_err());
        assert!("/ip4/not-an-ip/tcp/1".parse::<Multiaddr>().is_err());
        assert!("/udp/53".parse::<Multiaddr>().is_err());
        assert!("/tcp".parse::<Multiaddr>().is_err());
    }

    #[test]
    fn with_peer_replaces_suffix() {
        let ma: Multiaddr = "/ip4/127.0.0.1/tcp/4001/ipfs/QmOld".parse().unwrap();
        let id = PeerId::from_string("QmNew".into());
        assert_eq!(ma.with_peer(&id).to_string(), "/ip4/127.0.0.1/tcp/4001/ipfs/QmNew");
    }
}
