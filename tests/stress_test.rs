use elide::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
#[cfg_attr(miri, ignore)]
fn test_disjoint_ranges_all_land() {
    let map = Arc::new(HashMap::new());
    let mut handles = vec![];

    for t in 0..4u64 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..10_000 {
                let key = t * 10_000 + i;
                let (_, inserted) = m.insert(key, key * 2);
                assert!(inserted);
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(map.len(), 40_000);
    for key in 0..40_000u64 {
        assert_eq!(map.get(&key), Some(key * 2));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_readers_never_see_torn_entries() {
    // One writer churns a handful of keys; readers must only ever observe
    // fully constructed pairs.
    let map = Arc::new(HashMap::with_buckets(2));
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = vec![];

    for _ in 0..6 {
        let m = map.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                for key in 0..16u32 {
                    if let Some(cursor) = m.find(&key) {
                        if let Some((k, v)) = m.read(cursor, |k, v: &String| (*k, v.clone())) {
                            assert_eq!(v, format!("value_{}", k));
                        }
                    }
                }
            }
        }));
    }

    {
        let m = map.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            for round in 0..2_000u32 {
                let key = round % 16;
                m.insert(key, format!("value_{}", key));
                if round % 3 == 0 {
                    m.remove(&key);
                }
            }
            stop.store(true, Ordering::Relaxed);
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_same_key_first_come_first_served() {
    let map = Arc::new(HashMap::new());
    let mut handles = vec![];

    for t in 0..8u32 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            let (_, inserted) = m.insert(0u32, t);
            inserted
        }));
    }

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&won| won)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(map.len(), 1);
    let value = map.get(&0).unwrap();
    assert!(value < 8);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_mixed_insert_remove_cycles() {
    let map = Arc::new(HashMap::with_buckets(13));
    let mut handles = vec![];

    for t in 0..4u64 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..2_000 {
                let key = t * 2_000 + i;
                m.insert(key, key);
                if i % 2 == 0 {
                    assert_eq!(m.remove(&key), Some(key));
                }
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(map.len(), 4_000);
    for t in 0..4u64 {
        for i in (1..2_000).step_by(2) {
            let key = t * 2_000 + i;
            assert_eq!(map.get(&key), Some(key));
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_erase_under_contention_counts_once() {
    let map = Arc::new(HashMap::new());
    for i in 0..1_000u32 {
        map.insert(i, i);
    }

    // Two threads race to erase every cursor; each slot must be erased by
    // exactly one of them.
    let mut handles = vec![];
    for _ in 0..2 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            let mut erased = 0usize;
            for i in 0..1_000u32 {
                if let Some(cursor) = m.find(&i) {
                    if m.erase(cursor) {
                        erased += 1;
                    }
                }
            }
            erased
        }));
    }

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 1_000);
    assert_eq!(map.len(), 0);
}
