//! Integration test: end-to-end placement.
//!
//! Build the reference five-server ring, resolve keys, remove and re-add
//! targets, and check that placement is stable and minimally disrupted.

use std::collections::{HashMap, HashSet};

use chash_integration_tests::{HealthBoard, SERVERS, build_ring, keys};
use chash_ring::{HashRing, RingStatus, TargetId};

/// 5 servers, 500 shadows: "chash_test" lands on 192.168.106.64, then on
/// 10.11.5.145 once that server is removed.
#[test]
fn test_reference_ring_resolution() {
    let ring = build_ring(500, &SERVERS);
    assert_eq!(ring.node_count(), 10_000);
    assert_eq!(
        ring.resolve("chash_test").as_deref(),
        Some("192.168.106.64:2181")
    );

    assert!(ring.remove_target("192.168.106.64:2181").unwrap());
    assert_eq!(ring.node_count(), 8_000);
    assert_eq!(
        ring.resolve("chash_test").as_deref(),
        Some("10.11.5.145:2181")
    );
    let replicas = ring.resolve_n("chash_test", 3);
    let replicas: Vec<&str> = replicas.iter().map(|t| &**t).collect();
    assert_eq!(
        replicas,
        vec!["10.11.5.145:2181", "192.168.106.63:2181", "10.11.156.71:2181"]
    );
}

/// Insertion order does not affect placement.
#[test]
fn test_insertion_order_is_irrelevant() {
    let forward = build_ring(200, &SERVERS);
    let mut reversed_servers = SERVERS;
    reversed_servers.reverse();
    let reversed = build_ring(200, &reversed_servers);

    for key in keys(2_000) {
        assert_eq!(forward.resolve(&key), reversed.resolve(&key), "key {key}");
        assert_eq!(
            forward.resolve_n(&key, 3),
            reversed.resolve_n(&key, 3),
            "key {key}"
        );
    }
}

/// Removing a target only moves the keys it owned.
#[test]
fn test_removal_moves_only_orphaned_keys() {
    let ring = build_ring(300, &SERVERS);
    let keys = keys(5_000);
    let before: HashMap<&str, TargetId> = keys
        .iter()
        .map(|k| (k.as_str(), ring.resolve(k).unwrap()))
        .collect();

    let victim = SERVERS[3];
    ring.remove_target(victim).unwrap();

    for key in &keys {
        let after = ring.resolve(key).unwrap();
        let old = &before[key.as_str()];
        if &**old == victim {
            assert_ne!(&*after, victim);
        } else {
            assert_eq!(&after, old, "key {key} moved without cause");
        }
    }
}

/// Remove then re-add restores the original placement exactly.
#[test]
fn test_remove_and_readd_restores_placement() {
    let ring = build_ring(200, &SERVERS);
    let keys = keys(3_000);
    let before: Vec<_> = keys.iter().map(|k| ring.resolve_n(k, 2)).collect();
    let snapshot = ring.snapshot();

    ring.remove_target(SERVERS[0]).unwrap();
    ring.add_target(SERVERS[0]).unwrap();

    assert_eq!(ring.snapshot(), snapshot);
    let after: Vec<_> = keys.iter().map(|k| ring.resolve_n(k, 2)).collect();
    assert_eq!(before, after);
}

/// Keys spread across every target with no target starved.
#[test]
fn test_keys_are_balanced() {
    let ring = build_ring(1000, &SERVERS);
    let mut counts: HashMap<TargetId, usize> = HashMap::new();
    for key in keys(20_000) {
        *counts.entry(ring.resolve(&key).unwrap()).or_default() += 1;
    }

    assert_eq!(counts.len(), SERVERS.len());
    for (target, count) in &counts {
        // Even share is 4000.
        assert!(
            (3_000..=5_000).contains(count),
            "{target} owns {count} of 20000 keys"
        );
    }
}

/// Every replica set is distinct and starts with the primary owner.
#[test]
fn test_replica_sets() {
    let ring = build_ring(100, &SERVERS);
    for key in keys(1_000) {
        let all = ring.resolve_n(&key, SERVERS.len());
        assert_eq!(all.len(), SERVERS.len());
        let distinct: HashSet<&TargetId> = all.iter().collect();
        assert_eq!(distinct.len(), SERVERS.len());
        assert_eq!(Some(&all[0]), ring.resolve(&key).as_ref());

        // Shorter lists are prefixes of longer ones.
        assert_eq!(ring.resolve_n(&key, 2), all[..2]);
    }
}

/// Flapping a target through quarantine leaves placement untouched.
#[test]
fn test_flapping_target_keeps_placement() {
    let ring = build_ring(200, &SERVERS);
    let board = HealthBoard::new();
    let keys = keys(2_000);
    let baseline: Vec<_> = keys.iter().map(|k| ring.resolve(k)).collect();

    for round in 0..5 {
        let flapping = SERVERS[round % SERVERS.len()];
        board.mark_down(flapping);
        let summary = ring.reconcile(board.predicate()).unwrap();
        assert_eq!(summary.quarantined.len(), 1);
        assert_eq!(ring.active_targets().len(), SERVERS.len() - 1);
        for key in &keys {
            assert_ne!(ring.resolve(key).as_deref(), Some(flapping));
        }

        board.mark_up(flapping);
        let summary = ring.reconcile(board.predicate()).unwrap();
        assert_eq!(summary.restored.len(), 1);
        let current: Vec<_> = keys.iter().map(|k| ring.resolve(k)).collect();
        assert_eq!(current, baseline, "round {round}");
    }
}

/// A destroyed ring can be rebuilt with a different shape.
#[test]
fn test_destroy_and_rebuild() {
    let ring = build_ring(100, &SERVERS);
    assert!(ring.destroy());
    assert_eq!(ring.status(), RingStatus::Destroyed);
    assert_eq!(ring.resolve("chash_test"), None);

    ring.build(500).unwrap();
    for server in SERVERS {
        ring.add_target(server).unwrap();
    }
    assert_eq!(
        ring.resolve("chash_test").as_deref(),
        Some("192.168.106.64:2181")
    );
}

/// Two rings built the same way agree; rings are independent values.
#[test]
fn test_separate_rings_agree() {
    let a = build_ring(250, &SERVERS);
    let b = HashRing::new();
    b.build(250).unwrap();
    for server in SERVERS {
        b.add_target(server).unwrap();
    }
    assert_eq!(a.snapshot(), b.snapshot());

    b.remove_target(SERVERS[0]).unwrap();
    assert_eq!(a.active_targets().len(), 5);
    assert_eq!(b.active_targets().len(), 4);
}
