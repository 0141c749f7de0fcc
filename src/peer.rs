//! Peer records and reachable endpoints.

use std::fmt;
use std::net::SocketAddr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::address::{Address, KademliaAddress};
use crate::clock::Timestamp;
use crate::error::TableError;

/// Liveness score assigned to a peer the first time it is heard of.
pub const INITIAL_LIVENESS: f64 = 0.5;

/// A reachable transport endpoint, as `scheme://remainder`.
///
/// The table treats URIs as opaque lookup keys; only the basic shape is
/// validated so obviously malformed input is rejected before it can enter the
/// URI map or the cache file.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uri(String);

impl Uri {
    /// Validate and wrap a URI string.
    pub fn parse(raw: &str) -> Result<Self, TableError> {
        let (scheme, remainder) = raw
            .split_once("://")
            .ok_or_else(|| TableError::InvalidUri(raw.to_string()))?;
        let scheme_ok = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-');
        if !scheme_ok || remainder.is_empty() {
            return Err(TableError::InvalidUri(raw.to_string()));
        }
        Ok(Uri(raw.to_string()))
    }

    /// A `tcp://` URI for a plain socket address hint.
    pub fn from_socket(addr: SocketAddr) -> Self {
        Uri(format!("tcp://{addr}"))
    }

    /// The URI scheme, without the `://` separator.
    pub fn scheme(&self) -> &str {
        self.0.split("://").next().unwrap_or_default()
    }

    /// The full URI string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uri({})", self.0)
    }
}

impl Serialize for Uri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Uri::parse(&raw).map_err(D::Error::custom)
    }
}

/// Everything the table knows about a single peer.
///
/// Records are owned by the table's address registry; buckets refer to them by
/// [`Address`]. The `last_heard`, `liveness`, `uptime_start`, and `verified`
/// fields are maintained by the table itself as liveness reports arrive, so a
/// freshly constructed `PeerInfo` only needs to carry what the transport
/// observed: the identity, and optionally an endpoint and ports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's public identity.
    pub address: Address,
    /// Hashed form of `address`; derived, never persisted.
    #[serde(skip)]
    kademlia_address: KademliaAddress,
    /// Endpoint the peer was last reachable at, if known.
    pub uri: Option<Uri>,
    /// UDP/TCP ports the peer has claimed to listen on.
    pub ports: Vec<u16>,
    /// When the peer was last heard from.
    pub last_heard: Timestamp,
    /// Confidence in `[0, 1]` that the peer is alive.
    pub liveness: f64,
    /// When the current record was first established.
    pub uptime_start: Timestamp,
    /// Whether the peer has answered a direct liveliness probe.
    pub verified: bool,
}

impl PeerInfo {
    /// A fresh record for a newly observed identity.
    pub fn new(address: Address) -> Self {
        let kademlia_address = KademliaAddress::from_address(&address);
        PeerInfo {
            address,
            kademlia_address,
            uri: None,
            ports: Vec::new(),
            last_heard: Timestamp::ZERO,
            liveness: INITIAL_LIVENESS,
            uptime_start: Timestamp::ZERO,
            verified: false,
        }
    }

    /// Attach a known endpoint.
    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.uri = Some(uri);
        self
    }

    /// Attach claimed ports.
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// The hashed identity, positioned in the metric space.
    pub fn kademlia_address(&self) -> &KademliaAddress {
        &self.kademlia_address
    }

    /// Recompute the hashed identity after deserialization.
    pub(crate) fn refresh_kademlia_address(&mut self) {
        self.kademlia_address = KademliaAddress::from_address(&self.address);
    }

    /// Record claimed ports, keeping existing ones.
    pub(crate) fn merge_ports(&mut self, reported: &[u16]) {
        for port in reported {
            if !self.ports.contains(port) {
                self.ports.push(*port);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_accepts_scheme_and_remainder() {
        let uri = Uri::parse("tcp://127.0.0.1:8000").expect("well-formed");
        assert_eq!(uri.scheme(), "tcp");
        assert_eq!(uri.as_str(), "tcp://127.0.0.1:8000");
    }

    #[test]
    fn uri_rejects_malformed_input() {
        for raw in ["", "no-scheme", "://host", "tcp://", "bad scheme://x"] {
            assert!(
                matches!(Uri::parse(raw), Err(TableError::InvalidUri(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn uri_from_socket_round_trips_through_parse() {
        let addr: SocketAddr = "10.0.0.7:9031".parse().expect("socket addr");
        let uri = Uri::from_socket(addr);
        assert_eq!(uri.as_str(), "tcp://10.0.0.7:9031");
        assert!(Uri::parse(uri.as_str()).is_ok());
    }

    #[test]
    fn peer_info_derives_its_kademlia_address() {
        let address = Address::new(b"remote-peer").expect("non-empty");
        let info = PeerInfo::new(address.clone());
        assert_eq!(
            *info.kademlia_address(),
            KademliaAddress::from_address(&address)
        );
        assert_eq!(info.liveness, INITIAL_LIVENESS);
        assert!(!info.verified);
    }

    #[test]
    fn merge_ports_keeps_entries_unique() {
        let address = Address::new(b"remote-peer").expect("non-empty");
        let mut info = PeerInfo::new(address).with_ports(vec![9000]);
        info.merge_ports(&[9000, 9001]);
        assert_eq!(info.ports, vec![9000, 9001]);
    }
}
