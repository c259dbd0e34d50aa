use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chainmap::{ChainedTable, LockFreeTable, StripedTable, TableConfig, INVALID_VALUE};

fn expected_value(key: u64) -> u64 {
    key.wrapping_mul(31).wrapping_add(7)
}

fn disjoint_concurrent_inserts<T: ChainedTable + 'static>() {
    let table: Arc<T> = Arc::new(T::with_config(
        64,
        8,
        TableConfig {
            resize_enabled: false,
            track_items: true,
        },
    ));
    let n_threads = 8;
    let per_thread = 10_000u64;
    let barrier = Arc::new(Barrier::new(n_threads));

    let mut handles = Vec::new();
    for t in 0..n_threads as u64 {
        let b = barrier.clone();
        let table = table.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            for i in 0..per_thread {
                let key = t * per_thread + i;
                table.insert(key, expected_value(key));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(table.num_items(), n_threads as u64 * per_thread);
    for key in 0..(n_threads as u64 * per_thread) {
        assert_eq!(table.lookup(key), expected_value(key));
    }
}

#[test]
fn striped_disjoint_inserts() {
    disjoint_concurrent_inserts::<StripedTable>();
}

#[test]
fn lockfree_disjoint_inserts() {
    disjoint_concurrent_inserts::<LockFreeTable>();
}

fn mixed_readers_never_see_foreign_values<T: ChainedTable + 'static>() {
    const KEYS: u64 = 1024;
    let table: Arc<T> = Arc::new(T::with_config(
        64,
        8,
        TableConfig {
            resize_enabled: false,
            track_items: true,
        },
    ));
    let stop = Arc::new(AtomicBool::new(false));
    let anomalies = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();

    // Inserters write a key-derived value; after an insert returns, the writer's own
    // lookup must already observe it.
    for t in 0..4u64 {
        let table = table.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            let mut i = t;
            while !stop.load(Ordering::Relaxed) {
                let key = i % KEYS;
                table.insert(key, expected_value(key));
                assert_eq!(table.lookup(key), expected_value(key));
                i += 5;
            }
        }));
    }

    // Readers may race an insert and miss, but a present key must carry exactly the
    // value some insert wrote, never a torn or foreign one.
    for _ in 0..4 {
        let table = table.clone();
        let stop = stop.clone();
        let anomalies = anomalies.clone();
        handles.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                for key in 0..KEYS {
                    let found = table.lookup(key);
                    if found != INVALID_VALUE && found != expected_value(key) {
                        anomalies.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    thread::sleep(Duration::from_millis(300));
    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(anomalies.load(Ordering::Relaxed), 0);
    assert_eq!(table.num_items(), KEYS);
}

#[test]
fn striped_mixed_readers() {
    mixed_readers_never_see_foreign_values::<StripedTable>();
}

#[test]
fn lockfree_mixed_readers() {
    mixed_readers_never_see_foreign_values::<LockFreeTable>();
}

/// Between resizes a chain only grows at the head, so a key observed once stays
/// reachable for the rest of the run.
#[test]
fn lockfree_observed_keys_stay_reachable() {
    const KEYS: u64 = 512;
    let table: Arc<LockFreeTable> = Arc::new(LockFreeTable::with_config(
        8,
        1,
        TableConfig {
            resize_enabled: false,
            track_items: true,
        },
    ));
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();

    {
        let table = table.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            for key in 0..KEYS {
                table.insert(key, expected_value(key));
                thread::yield_now();
            }
            stop.store(true, Ordering::Relaxed);
        }));
    }

    for _ in 0..4 {
        let table = table.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            let mut seen = vec![false; KEYS as usize];
            while !stop.load(Ordering::Relaxed) {
                for key in 0..KEYS {
                    let found = table.lookup(key);
                    if found != INVALID_VALUE {
                        seen[key as usize] = true;
                    } else {
                        assert!(
                            !seen[key as usize],
                            "key {key} vanished after being observed"
                        );
                    }
                }
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(table.num_items(), KEYS);
}

fn concurrent_overwrites_settle<T: ChainedTable + 'static>() {
    const KEY: u64 = 99;
    let table: Arc<T> = Arc::new(T::with_config(16, 4, TableConfig::default()));
    table.insert(KEY, 1);

    let barrier = Arc::new(Barrier::new(4));
    let mut handles = Vec::new();
    for t in 0..4u64 {
        let table = table.clone();
        let b = barrier.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            for i in 0..5_000u64 {
                table.insert(KEY, t * 1_000_000 + i);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Exactly one node for the key ever existed, so the settled value is one of the
    // writers' last stores and the item count never moved.
    let settled = table.lookup(KEY);
    assert!((0..4).any(|t| settled == t * 1_000_000 + 4_999));
    assert_eq!(table.num_items(), 1);
}

#[test]
fn striped_concurrent_overwrites() {
    concurrent_overwrites_settle::<StripedTable>();
}

#[test]
fn lockfree_concurrent_overwrites() {
    concurrent_overwrites_settle::<LockFreeTable>();
}
