//! Integration test: concurrent readers and writers.
//!
//! Readers resolve random keys while writers change the topology. Every
//! answer must match the ring either before or after a whole change, never
//! a half-applied one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chash_integration_tests::{HealthBoard, SERVERS, build_ring, keys};
use chash_ring::TargetId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SHADOWS: u16 = 100;
const READERS: u64 = 4;

/// Expected `resolve_n(key, 3)` with and without the toggled server.
struct Expectations {
    keys: Vec<String>,
    with: HashMap<String, Vec<TargetId>>,
    without: HashMap<String, Vec<TargetId>>,
}

impl Expectations {
    fn new(toggled: &str, count: usize) -> Self {
        let full = build_ring(SHADOWS, &SERVERS);
        let reduced = build_ring(SHADOWS, &SERVERS);
        reduced.remove_target(toggled).unwrap();

        let keys = keys(count);
        let with = keys
            .iter()
            .map(|k| (k.clone(), full.resolve_n(k, 3)))
            .collect();
        let without = keys
            .iter()
            .map(|k| (k.clone(), reduced.resolve_n(k, 3)))
            .collect();
        Self {
            keys,
            with,
            without,
        }
    }

    fn check(&self, key: &str, got: &[TargetId]) {
        assert!(
            got == self.with[key].as_slice() || got == self.without[key].as_slice(),
            "{key} resolved to {got:?}, expected {:?} or {:?}",
            self.with[key],
            self.without[key]
        );
    }
}

/// Readers race a writer that repeatedly removes and re-adds one server.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_readers_never_see_partial_add_or_remove() {
    let toggled = SERVERS[2];
    let expectations = Arc::new(Expectations::new(toggled, 1_000));
    let ring = build_ring(SHADOWS, &SERVERS);
    let stop = Arc::new(AtomicBool::new(false));
    let lookups = Arc::new(AtomicU64::new(0));

    let mut readers = Vec::new();
    for seed in 0..READERS {
        let ring = ring.clone();
        let expectations = expectations.clone();
        let stop = stop.clone();
        let lookups = lookups.clone();
        readers.push(tokio::task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            while !stop.load(Ordering::Relaxed) {
                let key = &expectations.keys[rng.random_range(0..expectations.keys.len())];
                let replicas = ring.resolve_n(key, 3);
                expectations.check(key, &replicas);

                let owner = ring.resolve(key).unwrap();
                let with = &expectations.with[key][0];
                let without = &expectations.without[key][0];
                assert!(&owner == with || &owner == without, "{key} -> {owner}");
                lookups.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    let writer = {
        let ring = ring.clone();
        tokio::task::spawn_blocking(move || {
            for _ in 0..200 {
                assert!(ring.remove_target(toggled).unwrap());
                assert!(ring.add_target(toggled).unwrap());
            }
        })
    };

    writer.await.unwrap();
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.await.unwrap();
    }

    assert!(lookups.load(Ordering::Relaxed) > 0);
    assert_eq!(ring.node_count(), SERVERS.len() * SHADOWS as usize * 4);
}

/// Readers race the background checker flapping one server.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_readers_never_see_partial_quarantine() {
    let toggled = SERVERS[0];
    let expectations = Arc::new(Expectations::new(toggled, 1_000));
    let ring = build_ring(SHADOWS, &SERVERS);
    let board = HealthBoard::new();
    ring.start_check(board.predicate(), Duration::from_millis(2))
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for seed in 0..READERS {
        let ring = ring.clone();
        let expectations = expectations.clone();
        let stop = stop.clone();
        readers.push(tokio::task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(100 + seed);
            while !stop.load(Ordering::Relaxed) {
                let key = &expectations.keys[rng.random_range(0..expectations.keys.len())];
                expectations.check(key, &ring.resolve_n(key, 3));
            }
        }));
    }

    for _ in 0..20 {
        board.mark_down(toggled);
        while !ring.is_pending(toggled) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        board.mark_up(toggled);
        while !ring.is_active(toggled) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.await.unwrap();
    }
    ring.stop_check();
}

/// Writers adding distinct targets concurrently all land.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_concurrent_writers() {
    let ring = build_ring(20, &[]);
    let mut writers = Vec::new();
    for w in 0..8 {
        let ring = ring.clone();
        writers.push(tokio::task::spawn_blocking(move || {
            for i in 0..10 {
                ring.add_target(&format!("node-{w}-{i}")).unwrap();
            }
            for i in (0..10).step_by(2) {
                assert!(ring.remove_target(&format!("node-{w}-{i}")).unwrap());
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let active = ring.active_targets();
    assert_eq!(active.len(), 40);
    let owned: usize = active
        .iter()
        .map(|t| ring.target_coordinates(t).unwrap().len())
        .sum();
    assert_eq!(owned, ring.node_count());
    for node in ring.snapshot() {
        assert!(
            ring.is_active(&node.target),
            "{} is not active",
            node.target
        );
    }
}
