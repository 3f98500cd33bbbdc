//! Benchmark: elide::HashMap against dashmap and a mutexed std map.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use std::collections::HashMap as StdHashMap;
use std::sync::{Arc, Mutex};
use std::thread;

const OPS: usize = 10_000;
const THREAD_COUNTS: &[usize] = &[1, 2, 4, 8];

fn bench_concurrent_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_insert");
    group.sample_size(20);

    for &threads in THREAD_COUNTS {
        let ops = OPS / threads;
        group.throughput(Throughput::Elements((ops * threads) as u64));

        group.bench_with_input(BenchmarkId::new("elide", threads), &threads, |b, &threads| {
            b.iter(|| {
                let map = Arc::new(elide::HashMap::with_buckets(1024));
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let map = map.clone();
                        thread::spawn(move || {
                            for i in 0..ops {
                                map.insert(t * ops + i, i);
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
                map
            });
        });

        group.bench_with_input(
            BenchmarkId::new("dashmap", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let map = Arc::new(dashmap::DashMap::new());
                    let handles: Vec<_> = (0..threads)
                        .map(|t| {
                            let map = map.clone();
                            thread::spawn(move || {
                                for i in 0..ops {
                                    map.insert(t * ops + i, i);
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                    map
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("mutex_std", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let map = Arc::new(Mutex::new(StdHashMap::new()));
                    let handles: Vec<_> = (0..threads)
                        .map(|t| {
                            let map = map.clone();
                            thread::spawn(move || {
                                for i in 0..ops {
                                    map.lock().unwrap().insert(t * ops + i, i);
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                    map
                });
            },
        );
    }

    group.finish();
}

fn bench_read_heavy(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_heavy");
    group.sample_size(20);

    let keys: Vec<usize> = {
        let mut rng = rand::rng();
        (0..OPS).map(|_| rng.random_range(0..OPS)).collect()
    };

    for &threads in THREAD_COUNTS {
        group.throughput(Throughput::Elements((OPS * threads) as u64));

        group.bench_with_input(BenchmarkId::new("elide", threads), &threads, |b, &threads| {
            let map = Arc::new(elide::HashMap::with_buckets(1024));
            for i in 0..OPS {
                map.insert(i, i);
            }
            let keys = Arc::new(keys.clone());
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let map = map.clone();
                        let keys = keys.clone();
                        thread::spawn(move || {
                            let mut sum = 0usize;
                            for &k in keys.iter() {
                                if let Some(v) = map.get(&k) {
                                    sum = sum.wrapping_add(v);
                                }
                            }
                            sum
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap())
                    .sum::<usize>()
            });
        });

        group.bench_with_input(
            BenchmarkId::new("dashmap", threads),
            &threads,
            |b, &threads| {
                let map = Arc::new(dashmap::DashMap::new());
                for i in 0..OPS {
                    map.insert(i, i);
                }
                let keys = Arc::new(keys.clone());
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let map = map.clone();
                            let keys = keys.clone();
                            thread::spawn(move || {
                                let mut sum = 0usize;
                                for &k in keys.iter() {
                                    if let Some(v) = map.get(&k) {
                                        sum = sum.wrapping_add(*v);
                                    }
                                }
                                sum
                            })
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| h.join().unwrap())
                        .sum::<usize>()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_concurrent_insert, bench_read_heavy);
criterion_main!(benches);
