//! Test-test-and-set exclusive spinlock.
//!
//! Unlike a data-owning mutex, [`SpinLock`] guards nothing by itself: the
//! transacted critical section reads and writes the protected state both
//! with and without holding the lock, so ownership of the data cannot be
//! tied to the guard. The lock is a single atomic flag; callers pair it
//! with the state it protects.

use core::sync::atomic::{AtomicBool, Ordering};
use crossbeam_utils::Backoff;

/// A non-reentrant exclusive lock over a single atomic flag.
///
/// Acquisition spins with exponential backoff and yields the scheduler once
/// the backoff is exhausted. Holder identity is not tracked.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Attempts to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquires the lock, spinning until it is free.
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_> {
        let backoff = Backoff::new();
        loop {
            // Test phase: wait on a relaxed load so the flag stays cached.
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            backoff.spin();
        }
    }

    /// Whether the lock is currently held by some thread.
    ///
    /// A relaxed load: the answer is advisory for diagnostics, and exact at
    /// the points the transacted protocol needs it (inside a hardware
    /// transaction the load joins the read set, so a stale `false` is
    /// corrected by an abort).
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for [`SpinLock`]. Releases the lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
