mod common;

use std::time::Duration;

use kademlia_table::{Clock, PeerInfo, Uri};

use common::{address, report, same_log_bucket_addresses, table};

#[test]
fn repeated_failures_evict_the_peer() {
    let (table, _clock) = table("self");
    let peer = report(&table, "flaky");
    assert_eq!(table.len(), 1);

    for _ in 0..10 {
        table.report_failure(&peer, &peer);
    }

    assert_eq!(table.len(), 0);
    assert!(table.peer_details(&peer).is_none());
    assert!(table.find_peer(&peer).is_empty());
}

#[test]
fn desired_peer_survives_eviction_as_registry_only_record() {
    let (table, _clock) = table("self");
    let peer = report(&table, "pinned");
    table.add_desired_peer(&peer, Duration::from_secs(600));

    for _ in 0..10 {
        table.report_failure(&peer, &peer);
    }

    // Still known, but no longer routable.
    assert_eq!(table.len(), 1);
    assert!(table.peer_details(&peer).is_some());
    assert!(!table.find_peer(&peer).iter().any(|info| info.address == peer));

    // The next observation re-admits it.
    table.report_existence(PeerInfo::new(peer.clone()), &peer);
    assert!(table.find_peer(&peer).iter().any(|info| info.address == peer));
}

#[test]
fn liveliness_bumps_the_score_and_verifies() {
    let (table, clock) = table("self");
    let peer = report(&table, "alive");

    clock.advance(Duration::from_secs(5));
    table.report_liveliness(&peer, &peer, None);

    let details = table.peer_details(&peer).expect("peer is known");
    assert!((details.liveness - 0.7).abs() < 1e-9, "0.5 + 0.2 gain");
    assert!(details.verified);
    assert_eq!(details.last_heard, clock.now());
}

#[test]
fn liveliness_score_is_clipped_at_one() {
    let (table, _clock) = table("self");
    let peer = report(&table, "very-alive");

    for _ in 0..10 {
        table.report_liveliness(&peer, &peer, None);
    }

    let details = table.peer_details(&peer).expect("peer is known");
    assert!((details.liveness - 1.0).abs() < 1e-9);
}

#[test]
fn liveliness_for_unknown_peer_needs_a_record() {
    let (table, _clock) = table("self");
    let peer = address("stranger");

    // Without a record the report is dropped.
    table.report_liveliness(&peer, &peer, None);
    assert_eq!(table.len(), 0);

    // With one, the peer is registered first.
    let seed = PeerInfo::new(peer.clone()).with_ports(vec![9000]);
    table.report_liveliness(&peer, &peer, Some(&seed));
    let details = table.peer_details(&peer).expect("registered via liveliness");
    assert!(details.verified);
    assert_eq!(details.ports, vec![9000]);
}

#[test]
fn ping_registers_the_caller_and_returns_own_address() {
    let (table, _clock) = table("self");
    let peer = address("caller");

    let answered = table.ping(&peer, &[7000, 7001]);
    assert_eq!(&answered, table.own_address());

    let details = table.peer_details(&peer).expect("ping creates the record");
    assert_eq!(details.ports, vec![7000, 7001]);

    // A second ping merges ports instead of duplicating them.
    table.ping(&peer, &[7001, 7002]);
    let details = table.peer_details(&peer).expect("still known");
    assert_eq!(details.ports, vec![7000, 7001, 7002]);
}

#[test]
fn buckets_keep_the_most_recently_heard_peer_in_front() {
    let (table, clock) = table("self");
    let mates = same_log_bucket_addresses(&table, 2);

    table.report_existence(PeerInfo::new(mates[0].clone()), &mates[0]);
    clock.advance(Duration::from_secs(1));
    table.report_existence(PeerInfo::new(mates[1].clone()), &mates[1]);

    let proposals = table.propose_permanent_connections();
    assert_eq!(proposals[0].address, mates[1]);

    clock.advance(Duration::from_secs(1));
    table.report_liveliness(&mates[0], &mates[0], None);
    let proposals = table.propose_permanent_connections();
    assert_eq!(proposals[0].address, mates[0]);
}

#[test]
fn a_reassigned_uri_follows_the_latest_owner() {
    let (table, _clock) = table("self");
    let uri = Uri::parse("tcp://198.51.100.4:9000").expect("well-formed");

    let first = address("first-owner");
    table.report_existence(PeerInfo::new(first.clone()).with_uri(uri.clone()), &first);
    assert!(table.has_uri(&uri));
    assert_eq!(table.address_from_uri(&uri), Some(first.clone()));
    assert_eq!(table.uri_of(&first), Some(uri.clone()));

    let second = address("second-owner");
    table.report_existence(PeerInfo::new(second.clone()).with_uri(uri.clone()), &second);
    assert_eq!(table.address_from_uri(&uri), Some(second.clone()));
    assert_eq!(table.uri_of(&second), Some(uri.clone()));

    // The previous owner keeps its record but loses the endpoint.
    assert!(table.peer_details(&first).is_some());
    assert_eq!(table.uri_of(&first), None);
}

#[test]
fn repeated_existence_refreshes_last_heard_only() {
    let (table, clock) = table("self");
    let peer = report(&table, "steady");
    let born = table.peer_details(&peer).expect("known").uptime_start;

    clock.advance(Duration::from_secs(30));
    table.report_existence(PeerInfo::new(peer.clone()), &peer);

    let details = table.peer_details(&peer).expect("known");
    assert_eq!(details.last_heard, clock.now());
    assert_eq!(details.uptime_start, born, "uptime start is not reset");
}
