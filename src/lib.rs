//! # Kademlia routing table
//!
//! This crate implements the peer routing table of an overlay network node:
//! the shared structure through which a node remembers other peers, decides
//! which are closest to a given identifier, tracks their liveness, and
//! persists that knowledge across restarts. Transport, identity generation,
//! and the tracker driving periodic maintenance stay outside; the table only
//! consumes their observations and answers their queries.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`address`]: opaque peer identities and the 160-bit metric space with
//!   its logarithmic and Hamming distances.
//! - [`table`]: [`KademliaTable`] itself — the dual bucket index, the query
//!   engine, liveness reporting, and the desired-peer overlay.
//! - [`peer`]: [`PeerInfo`] records and validated [`Uri`] endpoints.
//! - [`clock`]: the [`Clock`] capability so tests can step time manually.
//!
//! ## Getting started
//!
//! Construct a table with the local identity, feed it peer observations, and
//! query for the nearest peers to any address:
//!
//! ```
//! use kademlia_table::{Address, KademliaTable, PeerInfo};
//!
//! # fn main() -> Result<(), kademlia_table::TableError> {
//! let own = Address::new(b"own-identity")?;
//! let table = KademliaTable::new(own, "demo");
//!
//! let peer = Address::new(b"remote-peer")?;
//! table.report_existence(PeerInfo::new(peer.clone()), &peer);
//!
//! let closest = table.find_peer(&peer);
//! assert_eq!(closest[0].address, peer);
//! # Ok(())
//! # }
//! ```
//!
//! All operations are synchronous and thread-safe; share the table between a
//! network receive thread and a tracker thread behind an `Arc`.

pub mod address;
pub mod clock;
pub mod error;
pub mod peer;
mod snapshot;
pub mod table;

pub use address::{Address, KademliaAddress, KADEMLIA_ID_BITS, KADEMLIA_ID_BYTES};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use error::TableError;
pub use peer::{PeerInfo, Uri, INITIAL_LIVENESS};
pub use table::{
    KademliaTable, TableConfig, DEFAULT_LIVENESS_DECAY, DEFAULT_LIVENESS_GAIN,
    DEFAULT_LIVENESS_THRESHOLD, DEFAULT_MAX_PEERS_PER_BUCKET,
};
