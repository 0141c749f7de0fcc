#![allow(dead_code)]

use std::sync::Arc;

use kademlia_table::{
    Address, KademliaAddress, KademliaTable, ManualClock, PeerInfo, TableConfig, Timestamp,
    KADEMLIA_ID_BITS,
};

pub fn address(tag: &str) -> Address {
    Address::new(tag.as_bytes().to_vec()).expect("test addresses are non-empty")
}

pub fn kad(address: &Address) -> KademliaAddress {
    KademliaAddress::from_address(address)
}

/// A table for `own` on a manual clock starting at t = 1s.
pub fn table(own: &str) -> (KademliaTable, Arc<ManualClock>) {
    table_with_config(own, TableConfig::default())
}

pub fn table_with_config(own: &str, config: TableConfig) -> (KademliaTable, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let table = KademliaTable::with_clock(address(own), "test-net", config, clock.clone());
    (table, clock)
}

/// Report `name` as an existing peer and return its address.
pub fn report(table: &KademliaTable, name: &str) -> Address {
    let peer = address(name);
    table.report_existence(PeerInfo::new(peer.clone()), &peer);
    peer
}

/// Find `count` addresses that all land in the same (maximum-distance)
/// logarithmic bucket relative to the table's own address.
pub fn same_log_bucket_addresses(table: &KademliaTable, count: usize) -> Vec<Address> {
    let own = table.own_kademlia_address();
    let mut found = Vec::new();
    for i in 0u32.. {
        let candidate = address(&format!("bucket-mate-{i}"));
        if own.log_distance(&kad(&candidate)) == KADEMLIA_ID_BITS {
            found.push(candidate);
            if found.len() == count {
                break;
            }
        }
    }
    found
}

/// Find `count` addresses in pairwise-distinct logarithmic buckets relative
/// to the table's own address, sorted by ascending bucket index.
pub fn distinct_log_bucket_addresses(table: &KademliaTable, count: usize) -> Vec<(Address, usize)> {
    let own = table.own_kademlia_address();
    let mut found: Vec<(Address, usize)> = Vec::new();
    for i in 0u32.. {
        let candidate = address(&format!("loner-{i}"));
        let index = own.log_distance(&kad(&candidate));
        if !found.iter().any(|(_, existing)| *existing == index) {
            found.push((candidate, index));
            if found.len() == count {
                break;
            }
        }
    }
    found.sort_by_key(|(_, index)| *index);
    found
}
