//! Demonstrates concurrent operations on the transactionally elided map.
//!
//! Multiple threads insert, read and erase at once; operations on distinct
//! buckets never block each other, and on TSX hardware most same-bucket
//! operations commit as transactions without touching the lock.

use elide::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn main() {
    println!("=== Transactionally Elided HashMap Demo ===\n");
    println!(
        "Hardware transactions: {}\n",
        if elide::htm_available() {
            "available"
        } else {
            "unavailable (pessimistic paths only)"
        }
    );

    let map = Arc::new(HashMap::with_buckets(256));

    println!("Benchmarking concurrent inserts...");
    let start = Instant::now();
    let mut handles = Vec::new();

    for thread_id in 0..8u64 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..10_000 {
                let key = thread_id * 10_000 + i;
                map.insert(key, key * 2);
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let elapsed = start.elapsed();
    println!(
        "  inserted {} entries in {:?} ({:.0} ops/s)\n",
        map.len(),
        elapsed,
        map.len() as f64 / elapsed.as_secs_f64()
    );

    println!("Benchmarking concurrent reads with one writer...");
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..7 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            let mut hits = 0u64;
            for key in 0..80_000 {
                if map.get(&key).is_some() {
                    hits += 1;
                }
            }
            hits
        }));
    }
    {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            let mut churned = 0u64;
            for key in (0..80_000u64).step_by(16) {
                if let Some(cursor) = map.find(&key) {
                    map.erase(cursor);
                    map.insert(key, key * 2);
                    churned += 1;
                }
            }
            churned
        }));
    }

    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    println!(
        "  {} successful operations in {:?}\n",
        total,
        start.elapsed()
    );

    println!("Final state: {} entries", map.len());
    let sample = map.read(map.find(&42).unwrap(), |k, v| (*k, *v));
    println!("  entry 42 -> {:?}", sample);
}
