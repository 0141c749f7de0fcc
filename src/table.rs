//! The Kademlia routing table.
//!
//! [`KademliaTable`] is the shared structure through which a node remembers
//! the peers of its overlay. Peer records are owned by an address-keyed
//! registry; two parallel bucket arrays index the same records by logarithmic
//! and by Hamming distance to the local node, so lookups can converge the
//! classic Kademlia way or sample peers by bit-flip count during connection
//! maintenance.
//!
//! Concurrency follows a two-lock split: a primary mutex guards the routing
//! index, the registry, and the URI map; a second mutex guards the
//! desired-peer overlay so user intent can be edited without stalling query
//! traffic. Lock order is always primary first, desired second. No file or
//! network I/O happens while either lock is held.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::address::{Address, KademliaAddress, KADEMLIA_ID_BITS};
use crate::clock::{Clock, SystemClock, Timestamp};
use crate::error::TableError;
use crate::peer::{PeerInfo, Uri};
use crate::snapshot::TableSnapshot;

/// Number of buckets per index: one for every distance in `[0, 160]`.
const BUCKET_COUNT: usize = KADEMLIA_ID_BITS + 1;

/// Default maximum number of peers held per bucket (the Kademlia `k`).
pub const DEFAULT_MAX_PEERS_PER_BUCKET: usize = 20;

/// Default liveness score below which a peer is evicted.
pub const DEFAULT_LIVENESS_THRESHOLD: f64 = 0.1;

/// Default additive bump applied on a successful liveliness report.
pub const DEFAULT_LIVENESS_GAIN: f64 = 0.2;

/// Default multiplicative decay applied on a failure report.
pub const DEFAULT_LIVENESS_DECAY: f64 = 0.5;

/// Construction-time tuning knobs for a [`KademliaTable`].
#[derive(Clone, Copy, Debug)]
pub struct TableConfig {
    /// Bucket capacity `k`.
    pub max_peers_per_bucket: usize,
    /// Liveness score below which a peer is dropped from the buckets.
    pub liveness_threshold: f64,
    /// Added to the liveness score per liveliness report, clipped to 1.0.
    pub liveness_gain: f64,
    /// Multiplied into the liveness score per failure report.
    pub liveness_decay: f64,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            max_peers_per_bucket: DEFAULT_MAX_PEERS_PER_BUCKET,
            liveness_threshold: DEFAULT_LIVENESS_THRESHOLD,
            liveness_gain: DEFAULT_LIVENESS_GAIN,
            liveness_decay: DEFAULT_LIVENESS_DECAY,
        }
    }
}

/// One routing bucket: peer addresses ordered freshest-first.
///
/// Entries are keys into the table's registry, never owning records. Every
/// operation preserves uniqueness by address and non-increasing last-heard
/// order from head to tail (the table touches a bucket whenever it refreshes
/// a record's `last_heard`).
#[derive(Clone, Debug, Default)]
struct Bucket {
    entries: VecDeque<Address>,
}

impl Bucket {
    fn contains(&self, address: &Address) -> bool {
        self.entries.iter().any(|entry| entry == address)
    }

    /// Move an existing entry to the head, or insert at the head.
    ///
    /// Inserting into a full bucket applies eager replacement: the tail
    /// (oldest last-heard) is dropped and returned so the table can finish
    /// evicting it.
    fn touch(&mut self, address: &Address, capacity: usize) -> Option<Address> {
        if let Some(pos) = self.entries.iter().position(|entry| entry == address) {
            if let Some(existing) = self.entries.remove(pos) {
                self.entries.push_front(existing);
            }
            return None;
        }
        self.entries.push_front(address.clone());
        if self.entries.len() > capacity {
            self.entries.pop_back()
        } else {
            None
        }
    }

    fn remove(&mut self, address: &Address) -> bool {
        if let Some(pos) = self.entries.iter().position(|entry| entry == address) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    fn head(&self) -> Option<&Address> {
        self.entries.front()
    }

    fn iter(&self) -> impl Iterator<Item = &Address> + '_ {
        self.entries.iter()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append without ordering checks; restore-path only.
    fn push_back(&mut self, address: Address) {
        self.entries.push_back(address);
    }

    fn truncate(&mut self, capacity: usize) {
        self.entries.truncate(capacity);
    }
}

/// State behind the primary mutex.
struct TableState {
    by_logarithm: Vec<Bucket>,
    by_hamming: Vec<Bucket>,
    known_peers: HashMap<Address, PeerInfo>,
    known_uris: HashMap<Uri, Address>,
    cache_file: Option<PathBuf>,
}

impl TableState {
    fn empty() -> Self {
        TableState {
            by_logarithm: vec![Bucket::default(); BUCKET_COUNT],
            by_hamming: vec![Bucket::default(); BUCKET_COUNT],
            known_peers: HashMap::new(),
            known_uris: HashMap::new(),
            cache_file: None,
        }
    }
}

/// State behind the desired mutex.
#[derive(Default)]
struct DesiredState {
    connection_expiry: HashMap<Address, Timestamp>,
    desired_uri_expiry: HashMap<Uri, Timestamp>,
    desired_peers: HashSet<Address>,
    desired_uris: HashSet<Uri>,
}

/// Which buckets a nearest-peer gather may visit.
struct BucketScan {
    start: usize,
    scan_left: bool,
    scan_right: bool,
}

/// Thread-safe Kademlia routing table with dual distance indexing.
pub struct KademliaTable {
    own_address: Address,
    own_kad_address: KademliaAddress,
    label: String,
    config: TableConfig,
    clock: Arc<dyn Clock>,
    // Lock order: `state` before `desired`, never the reverse.
    state: Mutex<TableState>,
    desired: Mutex<DesiredState>,
}

impl KademliaTable {
    /// Create a table for `own_address` on the system clock with default
    /// configuration. `label` names the overlay network in log output.
    pub fn new(own_address: Address, label: impl Into<String>) -> Self {
        Self::with_clock(
            own_address,
            label,
            TableConfig::default(),
            Arc::new(SystemClock),
        )
    }

    /// Create a table with explicit configuration.
    pub fn with_config(own_address: Address, label: impl Into<String>, config: TableConfig) -> Self {
        Self::with_clock(own_address, label, config, Arc::new(SystemClock))
    }

    /// Create a table with explicit configuration and clock.
    pub fn with_clock(
        own_address: Address,
        label: impl Into<String>,
        mut config: TableConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        config.max_peers_per_bucket = config.max_peers_per_bucket.max(1);
        let own_kad_address = KademliaAddress::from_address(&own_address);
        KademliaTable {
            own_address,
            own_kad_address,
            label: label.into(),
            config,
            clock,
            state: Mutex::new(TableState::empty()),
            desired: Mutex::new(DesiredState::default()),
        }
    }

    /// The local node's identity.
    pub fn own_address(&self) -> &Address {
        &self.own_address
    }

    /// The local node's position in the metric space.
    pub fn own_kademlia_address(&self) -> &KademliaAddress {
        &self.own_kad_address
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────

    /// The nearest `k` known peers to `address` by logarithmic distance.
    pub fn find_peer(&self, address: &Address) -> Vec<PeerInfo> {
        let target = KademliaAddress::from_address(address);
        let start = self.own_kad_address.log_distance(&target);
        self.find_peer_in_bucket(address, start, true, true)
    }

    /// [`find_peer`](Self::find_peer) with an explicit starting bucket and
    /// the outward scan directions individually enabled.
    pub fn find_peer_in_bucket(
        &self,
        address: &Address,
        bucket_index: usize,
        scan_left: bool,
        scan_right: bool,
    ) -> Vec<PeerInfo> {
        let target = KademliaAddress::from_address(address);
        let state = self.state.lock();
        nearest_peers(
            &state.by_logarithm,
            &state.known_peers,
            &target,
            BucketScan {
                start: bucket_index.min(KADEMLIA_ID_BITS),
                scan_left,
                scan_right,
            },
            self.config.max_peers_per_bucket,
            KademliaAddress::log_distance,
        )
    }

    /// The nearest `k` known peers to `address` by Hamming distance.
    pub fn find_peer_by_hamming(&self, address: &Address) -> Vec<PeerInfo> {
        let target = KademliaAddress::from_address(address);
        let start = self.own_kad_address.hamming_distance(&target);
        self.find_peer_by_hamming_in_bucket(address, start, true, true)
    }

    /// [`find_peer_by_hamming`](Self::find_peer_by_hamming) with an explicit
    /// starting bucket and scan directions.
    pub fn find_peer_by_hamming_in_bucket(
        &self,
        address: &Address,
        bucket_index: usize,
        scan_left: bool,
        scan_right: bool,
    ) -> Vec<PeerInfo> {
        let target = KademliaAddress::from_address(address);
        let state = self.state.lock();
        nearest_peers(
            &state.by_hamming,
            &state.known_peers,
            &target,
            BucketScan {
                start: bucket_index.min(KADEMLIA_ID_BITS),
                scan_left,
                scan_right,
            },
            self.config.max_peers_per_bucket,
            KademliaAddress::hamming_distance,
        )
    }

    /// A copy of the record for `address`, if the peer is known.
    pub fn peer_details(&self, address: &Address) -> Option<PeerInfo> {
        self.state.lock().known_peers.get(address).cloned()
    }

    /// Whether any known peer currently claims `uri`.
    pub fn has_uri(&self, uri: &Uri) -> bool {
        self.state.lock().known_uris.contains_key(uri)
    }

    /// The address currently bound to `uri`.
    pub fn address_from_uri(&self, uri: &Uri) -> Option<Address> {
        self.state.lock().known_uris.get(uri).cloned()
    }

    /// The endpoint recorded for `address`.
    pub fn uri_of(&self, address: &Address) -> Option<Uri> {
        self.state
            .lock()
            .known_peers
            .get(address)
            .and_then(|info| info.uri.clone())
    }

    /// Number of known peers, bucketed or retained as desired.
    pub fn len(&self) -> usize {
        self.state.lock().known_peers.len()
    }

    /// Whether no peer is known at all.
    pub fn is_empty(&self) -> bool {
        self.state.lock().known_peers.is_empty()
    }

    /// Number of non-empty logarithmic buckets.
    pub fn active_buckets(&self) -> usize {
        let state = self.state.lock();
        state
            .by_logarithm
            .iter()
            .filter(|bucket| !bucket.is_empty())
            .count()
    }

    /// Index of the first non-empty logarithmic bucket, or
    /// [`KADEMLIA_ID_BITS`] when every bucket is empty.
    pub fn first_non_empty_bucket(&self) -> usize {
        let state = self.state.lock();
        state
            .by_logarithm
            .iter()
            .position(|bucket| !bucket.is_empty())
            .unwrap_or(KADEMLIA_ID_BITS)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Liveness reporting
    // ─────────────────────────────────────────────────────────────────────

    /// Record a ping from `address` claiming `ports`, creating the record if
    /// the peer was unknown. Returns the local address so the remote can
    /// confirm who it reached.
    pub fn ping(&self, address: &Address, ports: &[u16]) -> Address {
        if *address != self.own_address {
            let now = self.clock.now();
            let mut state = self.state.lock();
            if state.known_peers.contains_key(address) {
                if let Some(record) = state.known_peers.get_mut(address) {
                    record.last_heard = now;
                    record.merge_ports(ports);
                }
                self.admit_locked(&mut state, address);
            } else {
                let info = PeerInfo::new(address.clone()).with_ports(ports.to_vec());
                self.report_existence_locked(&mut state, info, address, now);
            }
        }
        self.own_address.clone()
    }

    /// A peer has been observed (directly or through gossip).
    ///
    /// Unknown peers get a fresh record and a place in both bucket arrays;
    /// known peers are refreshed and moved to their bucket heads. A changed
    /// URI takes over the binding: the previous owner of that URI keeps its
    /// record but loses the endpoint reference.
    pub fn report_existence(&self, info: PeerInfo, reporter: &Address) {
        if info.address == self.own_address {
            return;
        }
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.report_existence_locked(&mut state, info, reporter, now);
    }

    /// A peer answered a probe and is definitely alive.
    ///
    /// Requires the peer to be known; an unknown peer is registered first
    /// when `info` carries its record, and dropped otherwise.
    pub fn report_liveliness(&self, address: &Address, reporter: &Address, info: Option<&PeerInfo>) {
        if *address == self.own_address {
            return;
        }
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.known_peers.contains_key(address) {
            match info {
                Some(seed) if seed.address == *address => {
                    self.report_existence_locked(&mut state, seed.clone(), reporter, now);
                }
                _ => {
                    trace!(
                        table = %self.label,
                        peer = %address,
                        "liveliness report for unknown peer dropped"
                    );
                    return;
                }
            }
        }
        if let Some(record) = state.known_peers.get_mut(address) {
            record.last_heard = now;
            record.liveness = (record.liveness + self.config.liveness_gain).min(1.0);
            record.verified = true;
            if let Some(seed) = info {
                record.merge_ports(&seed.ports);
            }
        }
        if let Some(uri) = info.and_then(|seed| seed.uri.clone()) {
            self.bind_uri_locked(&mut state, address, uri);
        }
        self.admit_locked(&mut state, address);
    }

    /// A peer failed to answer. Decays its liveness score and evicts it once
    /// the score falls below the configured threshold.
    pub fn report_failure(&self, address: &Address, reporter: &Address) {
        let mut state = self.state.lock();
        let Some(record) = state.known_peers.get_mut(address) else {
            return;
        };
        record.liveness *= self.config.liveness_decay;
        let score = record.liveness;
        if score < self.config.liveness_threshold {
            debug!(
                table = %self.label,
                peer = %address,
                reporter = %reporter,
                score,
                "peer fell below liveness threshold"
            );
            self.evict_locked(&mut state, address);
        }
    }

    fn report_existence_locked(
        &self,
        state: &mut TableState,
        info: PeerInfo,
        reporter: &Address,
        now: Timestamp,
    ) {
        let address = info.address.clone();
        trace!(table = %self.label, peer = %address, reporter = %reporter, "peer reported");
        match state.known_peers.entry(address.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.last_heard = now;
                record.merge_ports(&info.ports);
            }
            Entry::Vacant(slot) => {
                let mut record = PeerInfo::new(address.clone()).with_ports(info.ports.clone());
                record.last_heard = now;
                record.uptime_start = now;
                slot.insert(record);
            }
        }
        if let Some(uri) = info.uri {
            self.bind_uri_locked(state, &address, uri);
        }
        self.admit_locked(state, &address);
    }

    /// Point `uri` at `address`, releasing any previous binding in both
    /// directions.
    fn bind_uri_locked(&self, state: &mut TableState, address: &Address, uri: Uri) {
        let current = state
            .known_peers
            .get(address)
            .and_then(|record| record.uri.clone());
        if current.as_ref() == Some(&uri) {
            return;
        }
        if let Some(old) = current {
            if state.known_uris.get(&old) == Some(address) {
                state.known_uris.remove(&old);
            }
        }
        if let Some(previous_owner) = state.known_uris.insert(uri.clone(), address.clone()) {
            if previous_owner != *address {
                if let Some(record) = state.known_peers.get_mut(&previous_owner) {
                    record.uri = None;
                }
            }
        }
        if let Some(record) = state.known_peers.get_mut(address) {
            record.uri = Some(uri);
        }
    }

    /// Place `address` at the head of both bucket arrays, evicting bucket
    /// tails displaced by eager replacement.
    fn admit_locked(&self, state: &mut TableState, address: &Address) {
        let Some(record) = state.known_peers.get(address) else {
            debug_assert!(false, "admitting a peer absent from the registry");
            return;
        };
        let kad = *record.kademlia_address();
        let log_index = self.own_kad_address.log_distance(&kad);
        let hamming_index = self.own_kad_address.hamming_distance(&kad);
        let capacity = self.config.max_peers_per_bucket;

        let mut displaced = Vec::new();
        if let Some(victim) = state.by_logarithm[log_index].touch(address, capacity) {
            displaced.push(victim);
        }
        if let Some(victim) = state.by_hamming[hamming_index].touch(address, capacity) {
            displaced.push(victim);
        }
        for victim in displaced {
            if victim == *address {
                continue;
            }
            debug!(
                table = %self.label,
                peer = %victim,
                replaced_by = %address,
                "bucket tail displaced"
            );
            self.evict_locked(&mut *state, &victim);
        }
    }

    /// Drop `address` from both bucket arrays; the record itself survives
    /// only while the address is desired.
    fn evict_locked(&self, state: &mut TableState, address: &Address) {
        let Some(record) = state.known_peers.get(address) else {
            return;
        };
        let kad = *record.kademlia_address();
        let log_index = self.own_kad_address.log_distance(&kad);
        let hamming_index = self.own_kad_address.hamming_distance(&kad);
        state.by_logarithm[log_index].remove(address);
        state.by_hamming[hamming_index].remove(address);

        let retained = self.desired.lock().desired_peers.contains(address);
        if retained {
            debug!(table = %self.label, peer = %address, "evicted peer retained as desired");
            return;
        }
        if let Some(record) = state.known_peers.remove(address) {
            if let Some(uri) = record.uri {
                if state.known_uris.get(&uri) == Some(address) {
                    state.known_uris.remove(&uri);
                }
            }
        }
        debug!(table = %self.label, peer = %address, "peer forgotten");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Peers the tracker should try to hold permanent connections to:
    /// desired peers known to the registry (most recently heard first),
    /// followed by the head of every non-empty logarithmic bucket in
    /// ascending index order, deduplicated by address.
    pub fn propose_permanent_connections(&self) -> Vec<PeerInfo> {
        let state = self.state.lock();
        let desired_addresses: Vec<Address> = {
            let desired = self.desired.lock();
            desired.desired_peers.iter().cloned().collect()
        };

        let mut proposals: Vec<PeerInfo> = desired_addresses
            .iter()
            .filter_map(|address| state.known_peers.get(address).cloned())
            .collect();
        proposals.sort_by(|a, b| {
            b.last_heard
                .cmp(&a.last_heard)
                .then_with(|| a.kademlia_address().compare(b.kademlia_address()))
        });

        let mut seen: HashSet<Address> = proposals.iter().map(|p| p.address.clone()).collect();
        for bucket in &state.by_logarithm {
            if let Some(head) = bucket.head() {
                if seen.insert(head.clone()) {
                    if let Some(info) = state.known_peers.get(head) {
                        proposals.push(info.clone());
                    }
                }
            }
        }
        proposals
    }

    // ─────────────────────────────────────────────────────────────────────
    // Desired-peer overlay
    // ─────────────────────────────────────────────────────────────────────

    /// Pin `address` as a desired peer until `now + expiry`; re-adding
    /// refreshes the deadline.
    pub fn add_desired_peer(&self, address: &Address, expiry: Duration) {
        let deadline = self.clock.now().saturating_add(expiry);
        let mut desired = self.desired.lock();
        desired
            .connection_expiry
            .insert(address.clone(), deadline);
        desired.desired_peers.insert(address.clone());
    }

    /// Pin `address` with a transport hint. When the peer is unknown, or
    /// known without an endpoint, a `tcp://` URI built from the hint is
    /// recorded so the tracker has somewhere to dial.
    pub fn add_desired_peer_with_hint(
        &self,
        address: &Address,
        hint: SocketAddr,
        expiry: Duration,
    ) {
        if *address != self.own_address {
            let now = self.clock.now();
            let mut state = self.state.lock();
            if !state.known_peers.contains_key(address) {
                let info = PeerInfo::new(address.clone()).with_uri(Uri::from_socket(hint));
                self.report_existence_locked(&mut state, info, address, now);
            } else if state
                .known_peers
                .get(address)
                .is_some_and(|record| record.uri.is_none())
            {
                self.bind_uri_locked(&mut state, address, Uri::from_socket(hint));
            }
        }
        self.add_desired_peer(address, expiry);
    }

    /// Pin an endpoint whose address is not yet known. Once the URI shows up
    /// in the table, [`Self::convert_desired_uris_to_addresses`] materializes
    /// the address-level entry.
    pub fn add_desired_uri(&self, uri: Uri, expiry: Duration) {
        let deadline = self.clock.now().saturating_add(expiry);
        let mut desired = self.desired.lock();
        desired.desired_uri_expiry.insert(uri.clone(), deadline);
        desired.desired_uris.insert(uri);
    }

    /// Unpin `address` immediately.
    pub fn remove_desired_peer(&self, address: &Address) {
        let mut desired = self.desired.lock();
        desired.connection_expiry.remove(address);
        desired.desired_peers.remove(address);
    }

    /// Drop every pinned address and URI.
    pub fn clear_desired(&self) {
        let mut desired = self.desired.lock();
        desired.connection_expiry.clear();
        desired.desired_uri_expiry.clear();
        desired.desired_peers.clear();
        desired.desired_uris.clear();
    }

    /// Drop pinned entries whose expiry has passed.
    pub fn trim_desired_peers(&self) {
        let now = self.clock.now();
        let mut desired = self.desired.lock();
        desired.connection_expiry.retain(|_, deadline| *deadline > now);
        let connection_expiry = std::mem::take(&mut desired.connection_expiry);
        desired
            .desired_peers
            .retain(|address| connection_expiry.contains_key(address));
        desired.connection_expiry = connection_expiry;

        desired.desired_uri_expiry.retain(|_, deadline| *deadline > now);
        let desired_uri_expiry = std::mem::take(&mut desired.desired_uri_expiry);
        desired
            .desired_uris
            .retain(|uri| desired_uri_expiry.contains_key(uri));
        desired.desired_uri_expiry = desired_uri_expiry;
    }

    /// Materialize an address-level desired entry for every pinned URI that
    /// has since become resolvable, carrying the URI's expiry over.
    pub fn convert_desired_uris_to_addresses(&self) {
        // Lock order: primary before desired.
        let state = self.state.lock();
        let mut desired = self.desired.lock();
        let now = self.clock.now();
        let resolved: Vec<(Address, Timestamp)> = desired
            .desired_uris
            .iter()
            .filter_map(|uri| {
                state.known_uris.get(uri).map(|address| {
                    let deadline = desired
                        .desired_uri_expiry
                        .get(uri)
                        .copied()
                        .unwrap_or(now);
                    (address.clone(), deadline)
                })
            })
            .collect();
        for (address, deadline) in resolved {
            desired.desired_peers.insert(address.clone());
            desired.connection_expiry.insert(address, deadline);
        }
    }

    /// The currently pinned addresses.
    pub fn desired_peers(&self) -> HashSet<Address> {
        self.desired.lock().desired_peers.clone()
    }

    /// The currently pinned URIs.
    pub fn desired_uris(&self) -> HashSet<Uri> {
        self.desired.lock().desired_uris.clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    /// Point `dump`/`load` at a cache file.
    pub fn set_cache_file(&self, path: impl Into<PathBuf>) {
        self.state.lock().cache_file = Some(path.into());
    }

    /// Write the whole table to the cache file.
    ///
    /// The snapshot is taken under both locks; the file write happens after
    /// they are released.
    pub fn dump(&self) -> Result<(), TableError> {
        let (snapshot, path) = {
            let state = self.state.lock();
            let path = state.cache_file.clone().ok_or(TableError::NoCacheFile)?;
            let desired = self.desired.lock();
            (capture_snapshot(&state, &desired), path)
        };
        let bytes = snapshot.encode()?;
        fs::write(&path, bytes)?;
        info!(
            table = %self.label,
            path = %path.display(),
            peers = snapshot.known_peers.len(),
            "routing table dumped"
        );
        Ok(())
    }

    /// Replace the table contents with the cache file.
    ///
    /// Decoding and validation run before any lock is taken: on failure the
    /// in-memory table is left exactly as it was.
    pub fn load(&self) -> Result<(), TableError> {
        let path = self
            .state
            .lock()
            .cache_file
            .clone()
            .ok_or(TableError::NoCacheFile)?;
        let bytes = fs::read(&path)?;
        let snapshot = TableSnapshot::decode(&bytes)?;
        let restored = self.rebuild_from_snapshot(snapshot)?;

        let peers = restored.known_peers.len();
        let mut state = self.state.lock();
        let mut desired = self.desired.lock();
        state.by_logarithm = restored.by_logarithm;
        state.by_hamming = restored.by_hamming;
        state.known_peers = restored.known_peers;
        state.known_uris = restored.known_uris;
        *desired = restored.desired;
        drop(desired);
        drop(state);

        info!(
            table = %self.label,
            path = %path.display(),
            peers,
            "routing table loaded"
        );
        Ok(())
    }

    fn rebuild_from_snapshot(&self, snapshot: TableSnapshot) -> Result<RestoredState, TableError> {
        let mut known_peers = snapshot.known_peers;
        for (address, record) in known_peers.iter_mut() {
            if record.address != *address {
                return Err(TableError::Corrupt(format!(
                    "registry key {address} does not match its record"
                )));
            }
            if !(0.0..=1.0).contains(&record.liveness) {
                return Err(TableError::Corrupt(format!(
                    "peer {address} has liveness {} outside [0, 1]",
                    record.liveness
                )));
            }
            record.refresh_kademlia_address();
        }

        let mut known_uris = HashMap::new();
        for (uri, record) in snapshot.known_uris {
            if !known_peers.contains_key(&record.address) {
                return Err(TableError::Corrupt(format!(
                    "uri {uri} bound to unknown peer {}",
                    record.address
                )));
            }
            known_uris.insert(uri, record.address);
        }

        let by_logarithm = self.rebuild_buckets(
            snapshot.by_logarithm,
            &known_peers,
            KademliaAddress::log_distance,
            "logarithm",
        )?;
        let by_hamming = self.rebuild_buckets(
            snapshot.by_hamming,
            &known_peers,
            KademliaAddress::hamming_distance,
            "hamming",
        )?;

        Ok(RestoredState {
            by_logarithm,
            by_hamming,
            known_peers,
            known_uris,
            desired: DesiredState {
                connection_expiry: snapshot.connection_expiry,
                desired_uri_expiry: snapshot.desired_uri_expiry,
                desired_peers: snapshot.desired_peers,
                desired_uris: snapshot.desired_uris,
            },
        })
    }

    fn rebuild_buckets(
        &self,
        raw: Vec<Vec<Address>>,
        known_peers: &HashMap<Address, PeerInfo>,
        distance: fn(&KademliaAddress, &KademliaAddress) -> usize,
        index_name: &str,
    ) -> Result<Vec<Bucket>, TableError> {
        if raw.len() != BUCKET_COUNT {
            return Err(TableError::Corrupt(format!(
                "{index_name} index has {} buckets, expected {BUCKET_COUNT}",
                raw.len()
            )));
        }
        let mut buckets = vec![Bucket::default(); BUCKET_COUNT];
        for (index, members) in raw.into_iter().enumerate() {
            for address in members {
                let record = known_peers.get(&address).ok_or_else(|| {
                    TableError::Corrupt(format!(
                        "{index_name} bucket {index} references unknown peer {address}"
                    ))
                })?;
                let expected = distance(&self.own_kad_address, record.kademlia_address());
                if expected != index {
                    return Err(TableError::Corrupt(format!(
                        "peer {address} stored in {index_name} bucket {index}, belongs in {expected}"
                    )));
                }
                if buckets[index].contains(&address) {
                    return Err(TableError::Corrupt(format!(
                        "duplicate peer {address} in {index_name} bucket {index}"
                    )));
                }
                buckets[index].push_back(address);
            }
            buckets[index].truncate(self.config.max_peers_per_bucket);
        }
        Ok(buckets)
    }
}

/// Everything `load` swaps into place at once.
struct RestoredState {
    by_logarithm: Vec<Bucket>,
    by_hamming: Vec<Bucket>,
    known_peers: HashMap<Address, PeerInfo>,
    known_uris: HashMap<Uri, Address>,
    desired: DesiredState,
}

fn capture_snapshot(state: &TableState, desired: &DesiredState) -> TableSnapshot {
    TableSnapshot {
        by_logarithm: state
            .by_logarithm
            .iter()
            .map(|bucket| bucket.iter().cloned().collect())
            .collect(),
        by_hamming: state
            .by_hamming
            .iter()
            .map(|bucket| bucket.iter().cloned().collect())
            .collect(),
        known_peers: state.known_peers.clone(),
        known_uris: state
            .known_uris
            .iter()
            .filter_map(|(uri, address)| {
                state
                    .known_peers
                    .get(address)
                    .map(|info| (uri.clone(), info.clone()))
            })
            .collect(),
        connection_expiry: desired.connection_expiry.clone(),
        desired_uri_expiry: desired.desired_uri_expiry.clone(),
        desired_peers: desired.desired_peers.clone(),
        desired_uris: desired.desired_uris.clone(),
    }
}

fn collect_bucket(bucket: &Bucket, known: &HashMap<Address, PeerInfo>, out: &mut Vec<PeerInfo>) {
    for address in bucket.iter() {
        match known.get(address) {
            Some(info) => out.push(info.clone()),
            None => debug_assert!(false, "bucket entry {address} missing from registry"),
        }
    }
}

/// Gather the nearest peers to `target`: the starting bucket first, then one
/// step right and one step left per sweep until `limit` peers are gathered or
/// both directions are exhausted, sorted by distance with byte-lexicographic
/// tie-breaks and truncated to `limit`.
fn nearest_peers(
    buckets: &[Bucket],
    known: &HashMap<Address, PeerInfo>,
    target: &KademliaAddress,
    scan: BucketScan,
    limit: usize,
    distance: fn(&KademliaAddress, &KademliaAddress) -> usize,
) -> Vec<PeerInfo> {
    let mut gathered = Vec::new();
    collect_bucket(&buckets[scan.start], known, &mut gathered);

    let mut left = scan.start;
    let mut right = scan.start;
    let mut scan_left = scan.scan_left && left > 0;
    let mut scan_right = scan.scan_right && right < KADEMLIA_ID_BITS;
    while gathered.len() < limit && (scan_left || scan_right) {
        if scan_right {
            right += 1;
            collect_bucket(&buckets[right], known, &mut gathered);
            scan_right = right < KADEMLIA_ID_BITS;
        }
        if scan_left {
            left -= 1;
            collect_bucket(&buckets[left], known, &mut gathered);
            scan_left = left > 0;
        }
    }

    gathered.sort_by(|a, b| {
        distance(target, a.kademlia_address())
            .cmp(&distance(target, b.kademlia_address()))
            .then_with(|| a.kademlia_address().compare(b.kademlia_address()))
    });
    gathered.truncate(limit);
    gathered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(tag: &str) -> Address {
        Address::new(tag.as_bytes().to_vec()).expect("test addresses are non-empty")
    }

    #[test]
    fn bucket_touch_prepends_and_deduplicates() {
        let mut bucket = Bucket::default();
        let (a, b) = (address("a"), address("b"));

        assert_eq!(bucket.touch(&a, 4), None);
        assert_eq!(bucket.touch(&b, 4), None);
        assert_eq!(bucket.head(), Some(&b));

        // Touching an existing entry moves it back to the head.
        assert_eq!(bucket.touch(&a, 4), None);
        assert_eq!(bucket.head(), Some(&a));
        assert_eq!(bucket.iter().count(), 2);
    }

    #[test]
    fn bucket_full_insert_drops_the_tail() {
        let mut bucket = Bucket::default();
        let (a, b, c) = (address("a"), address("b"), address("c"));

        assert_eq!(bucket.touch(&a, 2), None);
        assert_eq!(bucket.touch(&b, 2), None);
        // a is now the tail (oldest); inserting c displaces it.
        assert_eq!(bucket.touch(&c, 2), Some(a.clone()));

        let entries: Vec<&Address> = bucket.iter().collect();
        assert_eq!(entries, vec![&c, &b]);
        assert!(!bucket.contains(&a));
    }

    #[test]
    fn bucket_remove_is_idempotent() {
        let mut bucket = Bucket::default();
        let a = address("a");
        bucket.touch(&a, 2);
        assert!(bucket.remove(&a));
        assert!(!bucket.remove(&a));
        assert!(bucket.is_empty());
    }

    #[test]
    fn config_normalizes_zero_capacity() {
        let config = TableConfig {
            max_peers_per_bucket: 0,
            ..TableConfig::default()
        };
        let table = KademliaTable::with_config(address("self"), "test", config);
        let peer = address("peer");
        table.report_existence(PeerInfo::new(peer.clone()), &peer);
        assert_eq!(table.len(), 1);
    }
}
