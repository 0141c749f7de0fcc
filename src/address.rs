//! Peer identities and the Kademlia metric space.
//!
//! A peer is known to the outside world by an opaque, variable-length
//! [`Address`] (typically a public key). Internally every address is mapped
//! through SHA-1 to a fixed-width [`KademliaAddress`], the element type of the
//! metric space: the routing table buckets peers by the logarithmic and
//! Hamming distances between Kademlia addresses.

use std::cmp::Ordering;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::TableError;

/// Width of the identifier space in bits.
pub const KADEMLIA_ID_BITS: usize = 160;

/// Width of the identifier space in bytes.
pub const KADEMLIA_ID_BYTES: usize = KADEMLIA_ID_BITS / 8;

/// Opaque public identity of a peer.
///
/// Addresses are variable-length and never interpreted; the table only hashes
/// them into [`KademliaAddress`] form and compares them for equality. An
/// empty address is rejected at construction.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(Vec<u8>);

impl Address {
    /// Wrap raw identity bytes, rejecting the empty string.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, TableError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(TableError::InvalidAddress);
        }
        Ok(Address(bytes))
    }

    /// The raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = &self.0[..self.0.len().min(8)];
        write!(f, "Address({})", hex::encode(head))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Address::new(bytes).map_err(D::Error::custom)
    }
}

/// Fixed-width form of an [`Address`] used for all distance computations.
///
/// Derived deterministically (SHA-1 over the raw address bytes), so a
/// persisted table deserializes into the same bucket layout it was dumped
/// from. Total ordering is byte-lexicographic and is used for stable
/// tie-breaks when two peers are equidistant from a lookup target.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KademliaAddress([u8; KADEMLIA_ID_BYTES]);

impl KademliaAddress {
    /// Hash an address into the identifier space.
    pub fn from_address(address: &Address) -> Self {
        let digest = Sha1::digest(address.as_bytes());
        KademliaAddress(digest.into())
    }

    /// Build from raw identifier bytes.
    pub fn from_bytes(bytes: [u8; KADEMLIA_ID_BYTES]) -> Self {
        KademliaAddress(bytes)
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; KADEMLIA_ID_BYTES] {
        &self.0
    }

    fn xor(&self, other: &Self) -> [u8; KADEMLIA_ID_BYTES] {
        let mut out = [0u8; KADEMLIA_ID_BYTES];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Logarithmic distance: the bit length of `self XOR other`.
    ///
    /// Ranges over `[0, 160]`; zero means the identifiers are equal, 160 that
    /// they differ in the most significant bit.
    pub fn log_distance(&self, other: &Self) -> usize {
        let xor = self.xor(other);
        for (byte_idx, byte) in xor.iter().enumerate() {
            if *byte != 0 {
                return KADEMLIA_ID_BITS - (byte_idx * 8 + byte.leading_zeros() as usize);
            }
        }
        0
    }

    /// Hamming distance: the number of differing bits, in `[0, 160]`.
    pub fn hamming_distance(&self, other: &Self) -> usize {
        self.xor(other)
            .iter()
            .map(|byte| byte.count_ones() as usize)
            .sum()
    }

    /// Byte-lexicographic comparison, exposed for explicit tie-breaking.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for KademliaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for KademliaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KademliaAddress({})", hex::encode(&self.0[..8]))
    }
}
