//! Concurrent hash map built on transactionally elided per-bucket spinlocks.
//!
//! # Architecture
//!
//! - **Buckets**: a fixed array chosen at construction (no rehashing while
//!   populated). Each bucket owns a [`SpinLock`], a live-slot counter and a
//!   flat slot array, and is padded to its own cache line.
//! - **Slots**: `(hash, entry)` pairs probed linearly inside the bucket. A
//!   recorded hash of zero marks an empty slot, so the occupancy check is a
//!   single word compare; hashers that produce zero are remapped to a fixed
//!   nonzero value.
//! - **Concurrency**: every operation runs inside its bucket's transacted
//!   critical section. Operations on distinct buckets never serialize; on
//!   TSX hardware, reads and non-growing writes to the *same* bucket
//!   usually commit as transactions without taking the lock either. Bucket
//!   growth allocates, which is hostile to a hardware transaction, so that
//!   path always falls back to the lock.

use core::borrow::Borrow;
use core::cell::UnsafeCell;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::io;

use foldhash::fast::FixedState;

use crate::spinlock::SpinLock;
use crate::transact::{transact, transact_if, Entered, Fallback};
use crate::utils::CacheAligned;

/// Default number of buckets. Prime, so sequential hashes spread out.
const DEFAULT_BUCKETS: usize = 13;

/// Stand-in for a raw hash of zero, which is reserved for empty slots.
const ZERO_HASH: u64 = 0x9e37_79b9_7f4a_7c15;

/// One probe position in a bucket's slot array.
///
/// `hash == 0` means empty and `entry` is uninitialized; any nonzero hash
/// means `entry` is live. The drop impl keys off the same word, so plain
/// `Vec` teardown reclaims exactly the live entries.
struct Slot<K, V> {
    hash: u64,
    entry: MaybeUninit<(K, V)>,
}

impl<K, V> Slot<K, V> {
    #[inline]
    fn occupied(hash: u64, entry: (K, V)) -> Self {
        Self {
            hash,
            entry: MaybeUninit::new(entry),
        }
    }

    /// # Safety
    ///
    /// `self.hash` must be nonzero.
    #[inline]
    unsafe fn entry_ref(&self) -> &(K, V) {
        &*self.entry.as_ptr()
    }

    /// Moves the entry out and marks the slot empty.
    ///
    /// # Safety
    ///
    /// `self.hash` must be nonzero.
    #[inline]
    unsafe fn take(&mut self) -> (K, V) {
        let entry = ptr::read(self.entry.as_ptr());
        self.hash = 0;
        entry
    }
}

impl<K, V> Drop for Slot<K, V> {
    fn drop(&mut self) {
        if self.hash != 0 {
            // SAFETY: nonzero hash marks an initialized entry.
            unsafe { ptr::drop_in_place(self.entry.as_mut_ptr()) };
        }
    }
}

/// A bucket: one lock, one live counter, one slot array.
///
/// `capacity` mirrors `slots.capacity()` atomically so the insert predicate
/// can consult it outside the critical section without racing the `Vec`
/// metadata. It is advisory there; the authoritative check repeats inside
/// the section.
struct Bucket<K, V> {
    lock: SpinLock,
    count: AtomicUsize,
    capacity: AtomicUsize,
    slots: UnsafeCell<Vec<Slot<K, V>>>,
}

impl<K, V> Bucket<K, V> {
    fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            count: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            slots: UnsafeCell::new(Vec::new()),
        }
    }
}

/// Weak reference to an occupied slot: `(bucket index, slot offset)`.
///
/// A cursor stays valid across mutations of *other* slots, but erasing its
/// slot or growing its bucket can invalidate or repoint it. Treat cursors
/// as advisory unless the map is externally quiesced; [`HashMap::read`] and
/// [`HashMap::erase`] re-validate under the bucket's critical section and
/// report staleness instead of misbehaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    bucket: usize,
    offset: usize,
}

/// Error returned by [`HashMap::reserve`] on a populated map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// Re-bucketing would have to rehash live entries, which is unsupported.
    NonEmpty,
}

impl fmt::Display for ReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReserveError::NonEmpty => {
                write!(f, "cannot change the bucket count of a non-empty map")
            }
        }
    }
}

impl std::error::Error for ReserveError {}

/// A concurrent hash map whose operations are mostly wait-free.
///
/// `find`, `insert` and `erase` on distinct buckets proceed fully in
/// parallel. Within a bucket they are elided into hardware transactions
/// where TSX is available and serialize on the bucket's spinlock where it
/// is not (or when a transaction cannot commit). Same-key operations are
/// serialized first come, first served.
///
/// # Example
///
/// ```
/// let map = elide::HashMap::new();
/// let (_, inserted) = map.insert(1, "one");
/// assert!(inserted);
/// assert_eq!(map.get(&1), Some("one"));
///
/// if let Some(cursor) = map.find(&1) {
///     assert!(map.erase(cursor));
/// }
/// assert!(map.is_empty());
/// ```
pub struct HashMap<K, V, S = FixedState> {
    buckets: Box<[CacheAligned<Bucket<K, V>>]>,
    size: AtomicUsize,
    hasher: S,
}

// SAFETY: all shared mutation funnels through each bucket's transacted
// critical section; entries move across threads, hence Send bounds on K/V
// for both impls.
unsafe impl<K: Send, V: Send, S: Send> Send for HashMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for HashMap<K, V, S> {}

impl<K, V> HashMap<K, V, FixedState>
where
    K: Hash + Eq,
{
    /// Creates a map with the default bucket count.
    pub fn new() -> Self {
        Self::with_hasher(FixedState::default())
    }

    /// Creates a map with `n` buckets (at least one).
    pub fn with_buckets(n: usize) -> Self {
        Self::with_buckets_and_hasher(n, FixedState::default())
    }
}

impl<K, V> Default for HashMap<K, V, FixedState>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates a map with the default bucket count and the given hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_buckets_and_hasher(DEFAULT_BUCKETS, hasher)
    }

    /// Creates a map with `n` buckets (at least one) and the given hasher.
    pub fn with_buckets_and_hasher(n: usize, hasher: S) -> Self {
        Self {
            buckets: Self::alloc_buckets(n.max(1)),
            size: AtomicUsize::new(0),
            hasher,
        }
    }

    fn alloc_buckets(n: usize) -> Box<[CacheAligned<Bucket<K, V>>]> {
        (0..n)
            .map(|_| CacheAligned::new(Bucket::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice()
    }

    /// Number of live entries. Advisory under concurrency: exact whenever
    /// the map is quiesced.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether the map holds no entries (advisory, like [`len`](Self::len)).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn hash_of<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        match self.hasher.hash_one(key) {
            0 => ZERO_HASH,
            h => h,
        }
    }

    #[inline]
    fn bucket_index(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    /// Looks up `key`, returning a cursor to its slot.
    pub fn find<Q>(&self, key: &Q) -> Option<Cursor>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.size.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let hash = self.hash_of(key);
        let bi = self.bucket_index(hash);
        let bucket = &*self.buckets[bi];
        if bucket.count.load(Ordering::Acquire) == 0 {
            return None;
        }

        // Read-only: always eligible to run as a transaction, fully
        // concurrent with other finds on the same bucket.
        transact(&bucket.lock, || {
            // SAFETY: inside the bucket's critical section.
            let slots = unsafe { &*bucket.slots.get() };
            for offset in 0..slots.len() {
                let slot = &slots[offset];
                if slot.hash == hash {
                    // SAFETY: nonzero hash marks an initialized entry.
                    let (k, _) = unsafe { slot.entry_ref() };
                    if k.borrow() == key {
                        return Some(Cursor { bucket: bi, offset });
                    }
                }
            }
            None
        })
    }

    /// Runs `f` on the entry under `cursor`, inside the bucket's critical
    /// section. Returns `None` if the cursor no longer points at a live
    /// slot.
    ///
    /// `f` may run speculatively and be rolled back before the surviving
    /// execution; keep it cheap and free of side effects.
    pub fn read<R>(&self, cursor: Cursor, f: impl FnOnce(&K, &V) -> R) -> Option<R> {
        let bucket = match self.buckets.get(cursor.bucket) {
            Some(b) => &**b,
            None => return None,
        };
        // FnOnce in a re-runnable body: the `take` below is rolled back
        // together with everything else when an attempt aborts.
        let mut f = Some(f);
        transact(&bucket.lock, || {
            // SAFETY: inside the bucket's critical section.
            let slots = unsafe { &*bucket.slots.get() };
            match slots.get(cursor.offset) {
                Some(slot) if slot.hash != 0 => {
                    // SAFETY: nonzero hash marks an initialized entry.
                    let (k, v) = unsafe { slot.entry_ref() };
                    f.take().map(|f| f(k, v))
                }
                _ => None,
            }
        })
    }

    /// Looks up `key` and clones its value out.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        if self.size.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let hash = self.hash_of(key);
        let bucket = &*self.buckets[self.bucket_index(hash)];
        if bucket.count.load(Ordering::Acquire) == 0 {
            return None;
        }

        transact(&bucket.lock, || {
            // SAFETY: inside the bucket's critical section.
            let slots = unsafe { &*bucket.slots.get() };
            for slot in slots.iter() {
                if slot.hash == hash {
                    // SAFETY: nonzero hash marks an initialized entry.
                    let (k, v) = unsafe { slot.entry_ref() };
                    if k.borrow() == key {
                        return Some(v.clone());
                    }
                }
            }
            None
        })
    }

    /// Whether `key` is present.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some()
    }

    /// Inserts `key → value` unless the key is already present.
    ///
    /// Returns a cursor to the slot holding the key and whether this call
    /// inserted it. On a duplicate the map keeps the existing entry and
    /// drops the offered pair.
    ///
    /// The common case commits as a hardware transaction; only a bucket
    /// whose slot array must grow takes the bucket lock (allocation cannot
    /// run speculatively).
    pub fn insert(&self, key: K, value: V) -> (Cursor, bool) {
        let hash = self.hash_of(&key);
        let bi = self.bucket_index(hash);
        let bucket = &*self.buckets[bi];
        // Bucket-local high/low start so concurrent inserts of distinct
        // keys touch disjoint cache lines and rarely conflict under HTM.
        let start_low = (hash / self.buckets.len() as u64) & 1 == 0;

        // Consumed exactly once, by the surviving execution of the body.
        let mut pair = Some((key, value));

        let (cursor, inserted) = transact_if(
            &bucket.lock,
            // Transact while the bucket has spare capacity; a full bucket
            // almost certainly needs to grow, so go straight to the lock.
            // Both loads are advisory; the body re-checks under protection.
            |_spin| {
                bucket.count.load(Ordering::Acquire) < bucket.capacity.load(Ordering::Acquire)
            },
            |entered| {
                // SAFETY: inside the bucket's critical section.
                let slots = unsafe { &mut *bucket.slots.get() };
                let len = slots.len();
                let mut empty_idx = usize::MAX;

                // One pass, in the bucket-local direction: find the key,
                // recording the first empty slot seen on the way.
                if start_low {
                    for offset in 0..len {
                        let slot = &slots[offset];
                        if slot.hash == 0 {
                            if empty_idx == usize::MAX {
                                empty_idx = offset;
                            }
                        } else if slot.hash == hash {
                            // SAFETY: nonzero hash marks an initialized entry.
                            let existing = unsafe { slot.entry_ref() };
                            let hit = match pair.as_ref() {
                                Some((k, _)) => existing.0 == *k,
                                None => false,
                            };
                            if hit {
                                return Ok((Cursor { bucket: bi, offset }, false));
                            }
                        }
                    }
                } else {
                    for offset in (0..len).rev() {
                        let slot = &slots[offset];
                        if slot.hash == 0 {
                            if empty_idx == usize::MAX {
                                empty_idx = offset;
                            }
                        } else if slot.hash == hash {
                            // SAFETY: nonzero hash marks an initialized entry.
                            let existing = unsafe { slot.entry_ref() };
                            let hit = match pair.as_ref() {
                                Some((k, _)) => existing.0 == *k,
                                None => false,
                            };
                            if hit {
                                return Ok((Cursor { bucket: bi, offset }, false));
                            }
                        }
                    }
                }

                // New key. Reuse a hole if the scan saw one.
                if empty_idx != usize::MAX {
                    if let Some(entry) = pair.take() {
                        slots[empty_idx] = Slot::occupied(hash, entry);
                    }
                    return Ok((
                        Cursor {
                            bucket: bi,
                            offset: empty_idx,
                        },
                        true,
                    ));
                }

                // No hole: append, growing first if the array is full.
                // Growth allocates and moves slots, so it only happens with
                // the lock held.
                if slots.len() == slots.capacity() {
                    if entered == Entered::Optimistic {
                        return Err(Fallback);
                    }
                    let new_cap = match slots.capacity() {
                        0 => 1,
                        cap => cap * 2,
                    };
                    slots.reserve_exact(new_cap - slots.len());
                    bucket.capacity.store(slots.capacity(), Ordering::Release);
                }
                let offset = slots.len();
                if let Some(entry) = pair.take() {
                    slots.push(Slot::occupied(hash, entry));
                }
                Ok((Cursor { bucket: bi, offset }, true))
            },
        );

        if inserted {
            bucket.count.fetch_add(1, Ordering::Release);
            self.size.fetch_add(1, Ordering::Release);
        }
        (cursor, inserted)
    }

    /// Erases the slot under `cursor`.
    ///
    /// Returns false if the cursor is stale (its slot was already emptied
    /// or its bucket shrank past it). The entry's destructor runs after the
    /// critical section exits, since dropping user types may allocate or
    /// free.
    pub fn erase(&self, cursor: Cursor) -> bool {
        let bucket = match self.buckets.get(cursor.bucket) {
            Some(b) => &**b,
            None => return false,
        };

        let removed = transact(&bucket.lock, || {
            // SAFETY: inside the bucket's critical section.
            let slots = unsafe { &mut *bucket.slots.get() };
            if cursor.offset < slots.len() && slots[cursor.offset].hash != 0 {
                // SAFETY: just checked the slot is occupied.
                let entry = unsafe { slots[cursor.offset].take() };
                if cursor.offset == slots.len() - 1 {
                    Self::pop_trailing(slots);
                }
                Some(entry)
            } else {
                None
            }
        });

        match removed {
            Some(entry) => {
                bucket.count.fetch_sub(1, Ordering::Release);
                self.size.fetch_sub(1, Ordering::Release);
                drop(entry);
                true
            }
            None => false,
        }
    }

    /// Removes `key`, returning its value.
    ///
    /// Lookup and erase run in a single critical section, so this cannot
    /// remove an entry that replaced the key's slot in between.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.size.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let hash = self.hash_of(key);
        let bucket = &*self.buckets[self.bucket_index(hash)];
        if bucket.count.load(Ordering::Acquire) == 0 {
            return None;
        }

        let removed = transact(&bucket.lock, || {
            // SAFETY: inside the bucket's critical section.
            let slots = unsafe { &mut *bucket.slots.get() };
            for offset in 0..slots.len() {
                if slots[offset].hash == hash {
                    // SAFETY: nonzero hash marks an initialized entry.
                    let hit = unsafe { slots[offset].entry_ref() }.0.borrow() == key;
                    if hit {
                        // SAFETY: occupied, as established above.
                        let entry = unsafe { slots[offset].take() };
                        if offset == slots.len() - 1 {
                            Self::pop_trailing(slots);
                        }
                        return Some(entry);
                    }
                }
            }
            None
        });

        removed.map(|(_key, value)| {
            bucket.count.fetch_sub(1, Ordering::Release);
            self.size.fetch_sub(1, Ordering::Release);
            value
        })
    }

    /// Drops trailing empty slots so the array's live region stays tight.
    /// Capacity is kept; only growth changes it.
    fn pop_trailing(slots: &mut Vec<Slot<K, V>>) {
        while slots.last().is_some_and(|slot| slot.hash == 0) {
            slots.pop();
        }
    }

    /// Removes every entry. Each bucket is drained under its lock.
    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            let _guard = bucket.lock.lock();
            // SAFETY: the bucket lock is held.
            let slots = unsafe { &mut *bucket.slots.get() };
            slots.clear();
            bucket.count.store(0, Ordering::Release);
        }
        self.size.store(0, Ordering::Release);
    }

    /// Changes the bucket count to `n` (at least one).
    ///
    /// Only allowed while the map is empty: entries are never rehashed.
    pub fn reserve(&mut self, n: usize) -> Result<(), ReserveError> {
        if *self.size.get_mut() != 0 {
            return Err(ReserveError::NonEmpty);
        }
        self.buckets = Self::alloc_buckets(n.max(1));
        Ok(())
    }

    /// Iterates over clones of the live entries.
    ///
    /// Each step enters one bucket's critical section; the traversal as a
    /// whole is not a snapshot. Under quiescence it visits every occupied
    /// slot exactly once.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            map: self,
            bucket: 0,
            offset: 0,
        }
    }

    /// Iterates over clones of the live keys.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_
    where
        K: Clone,
        V: Clone,
    {
        self.iter().map(|(key, _)| key)
    }

    /// Writes one line per bucket: index, slot-array length, live count.
    pub fn dump_buckets<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        for (index, bucket) in self.buckets.iter().enumerate() {
            let slots = transact(&bucket.lock, || {
                // SAFETY: inside the bucket's critical section.
                unsafe { &*bucket.slots.get() }.len()
            });
            writeln!(
                out,
                "bucket {}: slots={} count={}",
                index,
                slots,
                bucket.count.load(Ordering::Acquire)
            )?;
        }
        Ok(())
    }

    /// Returns a reference to the map's hasher.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }
}

/// Iterator over clones of a map's entries. See [`HashMap::iter`].
pub struct Iter<'a, K, V, S> {
    map: &'a HashMap<K, V, S>,
    bucket: usize,
    offset: usize,
}

impl<K, V, S> Iterator for Iter<'_, K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        while self.bucket < self.map.buckets.len() {
            let bucket = &*self.map.buckets[self.bucket];
            let start = self.offset;
            let found = if bucket.count.load(Ordering::Acquire) == 0 {
                None
            } else {
                transact(&bucket.lock, || {
                    // SAFETY: inside the bucket's critical section.
                    let slots = unsafe { &*bucket.slots.get() };
                    for offset in start..slots.len() {
                        let slot = &slots[offset];
                        if slot.hash != 0 {
                            // SAFETY: nonzero hash marks an initialized entry.
                            let (k, v) = unsafe { slot.entry_ref() };
                            return Some((offset, (k.clone(), v.clone())));
                        }
                    }
                    None
                })
            };
            match found {
                Some((offset, entry)) => {
                    self.offset = offset + 1;
                    return Some(entry);
                }
                None => {
                    self.bucket += 1;
                    self.offset = 0;
                }
            }
        }
        None
    }
}
