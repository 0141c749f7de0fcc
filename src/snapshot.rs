//! On-disk representation of the routing table.
//!
//! The cache file holds a single map with exactly eight entries, keyed by the
//! single-byte tags below. Values are encoded by bincode's varint codec
//! (variable-length integers, length-prefixed byte strings, arrays, maps).
//! Tags may appear in any order; an unknown, duplicate, or missing tag fails
//! the load. Bucket fields persist membership only — full peer records live
//! under [`TAG_KNOWN_PEERS`] and are re-resolved after decoding.

use std::collections::{HashMap, HashSet};
use std::fmt;

use bincode::Options;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::address::Address;
use crate::clock::Timestamp;
use crate::error::TableError;
use crate::peer::{PeerInfo, Uri};

pub(crate) const TAG_BY_LOGARITHM: u8 = 1;
pub(crate) const TAG_BY_HAMMING: u8 = 2;
pub(crate) const TAG_KNOWN_PEERS: u8 = 3;
pub(crate) const TAG_KNOWN_URIS: u8 = 4;
pub(crate) const TAG_CONNECTION_EXPIRY: u8 = 5;
pub(crate) const TAG_DESIRED_URI_EXPIRY: u8 = 6;
pub(crate) const TAG_DESIRED_PEERS: u8 = 7;
pub(crate) const TAG_DESIRED_URIS: u8 = 8;

/// Plain-data aggregate of everything `dump` writes and `load` reads.
#[derive(Clone, Debug, Default)]
pub(crate) struct TableSnapshot {
    pub by_logarithm: Vec<Vec<Address>>,
    pub by_hamming: Vec<Vec<Address>>,
    pub known_peers: HashMap<Address, PeerInfo>,
    pub known_uris: HashMap<Uri, PeerInfo>,
    pub connection_expiry: HashMap<Address, Timestamp>,
    pub desired_uri_expiry: HashMap<Uri, Timestamp>,
    pub desired_peers: HashSet<Address>,
    pub desired_uris: HashSet<Uri>,
}

impl TableSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, TableError> {
        bincode::options()
            .serialize(self)
            .map_err(|err| TableError::Codec(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TableError> {
        bincode::options()
            .deserialize(bytes)
            .map_err(|err| TableError::Codec(err.to_string()))
    }
}

impl Serialize for TableSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(8))?;
        map.serialize_entry(&TAG_BY_LOGARITHM, &self.by_logarithm)?;
        map.serialize_entry(&TAG_BY_HAMMING, &self.by_hamming)?;
        map.serialize_entry(&TAG_KNOWN_PEERS, &self.known_peers)?;
        map.serialize_entry(&TAG_KNOWN_URIS, &self.known_uris)?;
        map.serialize_entry(&TAG_CONNECTION_EXPIRY, &self.connection_expiry)?;
        map.serialize_entry(&TAG_DESIRED_URI_EXPIRY, &self.desired_uri_expiry)?;
        map.serialize_entry(&TAG_DESIRED_PEERS, &self.desired_peers)?;
        map.serialize_entry(&TAG_DESIRED_URIS, &self.desired_uris)?;
        map.end()
    }
}

struct SnapshotVisitor;

/// Fill `$slot` from the next map value, rejecting a repeated tag.
macro_rules! take_tag {
    ($map:ident, $slot:ident, $tag:expr) => {{
        if $slot.is_some() {
            return Err(de::Error::custom(format!("duplicate snapshot tag {}", $tag)));
        }
        $slot = Some($map.next_value()?);
    }};
}

impl<'de> Visitor<'de> for SnapshotVisitor {
    type Value = TableSnapshot;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a routing table snapshot map with eight tagged fields")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut by_logarithm = None;
        let mut by_hamming = None;
        let mut known_peers = None;
        let mut known_uris = None;
        let mut connection_expiry = None;
        let mut desired_uri_expiry = None;
        let mut desired_peers = None;
        let mut desired_uris = None;

        while let Some(tag) = map.next_key::<u8>()? {
            match tag {
                TAG_BY_LOGARITHM => take_tag!(map, by_logarithm, tag),
                TAG_BY_HAMMING => take_tag!(map, by_hamming, tag),
                TAG_KNOWN_PEERS => take_tag!(map, known_peers, tag),
                TAG_KNOWN_URIS => take_tag!(map, known_uris, tag),
                TAG_CONNECTION_EXPIRY => take_tag!(map, connection_expiry, tag),
                TAG_DESIRED_URI_EXPIRY => take_tag!(map, desired_uri_expiry, tag),
                TAG_DESIRED_PEERS => take_tag!(map, desired_peers, tag),
                TAG_DESIRED_URIS => take_tag!(map, desired_uris, tag),
                other => {
                    return Err(de::Error::custom(format!("unknown snapshot tag {other}")));
                }
            }
        }

        let missing = |tag: u8| de::Error::custom(format!("missing snapshot tag {tag}"));
        Ok(TableSnapshot {
            by_logarithm: by_logarithm.ok_or_else(|| missing(TAG_BY_LOGARITHM))?,
            by_hamming: by_hamming.ok_or_else(|| missing(TAG_BY_HAMMING))?,
            known_peers: known_peers.ok_or_else(|| missing(TAG_KNOWN_PEERS))?,
            known_uris: known_uris.ok_or_else(|| missing(TAG_KNOWN_URIS))?,
            connection_expiry: connection_expiry.ok_or_else(|| missing(TAG_CONNECTION_EXPIRY))?,
            desired_uri_expiry: desired_uri_expiry
                .ok_or_else(|| missing(TAG_DESIRED_URI_EXPIRY))?,
            desired_peers: desired_peers.ok_or_else(|| missing(TAG_DESIRED_PEERS))?,
            desired_uris: desired_uris.ok_or_else(|| missing(TAG_DESIRED_URIS))?,
        })
    }
}

impl<'de> Deserialize<'de> for TableSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(SnapshotVisitor)
    }
}
