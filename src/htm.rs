//! Hardware transactional memory probe and raw RTM primitives.
//!
//! The probe answers one question: can this process start a hardware
//! transaction right now? The CPUID check runs at most once per process; a
//! writable kill switch ([`set_htm_disabled`]) forces the answer to `false`
//! so tests and baseline benchmarks can exercise the pessimistic paths on
//! TSX-capable machines.
//!
//! The rest of the module wraps the four RTM instructions the transacted
//! critical section needs. On non-x86_64 targets the wrappers degrade to
//! "transaction never starts", which routes every caller through the lock.

use core::sync::atomic::{AtomicBool, Ordering};
use once_cell::race::OnceBool;

/// Value of the status word while a transaction is executing.
pub(crate) const STARTED: u32 = u32::MAX;

/// Abort was requested by an `xabort` instruction; the code byte is valid.
pub(crate) const ABORT_EXPLICIT: u32 = 1 << 0;
/// The CPU hints that an immediate retry may succeed.
pub(crate) const ABORT_RETRY: u32 = 1 << 1;
/// Another thread touched a cache line in our read/write set.
pub(crate) const ABORT_CONFLICT: u32 = 1 << 2;
/// The transaction outgrew the speculative buffer.
pub(crate) const ABORT_CAPACITY: u32 = 1 << 3;
/// Abort happened in a nested transaction.
pub(crate) const ABORT_NESTED: u32 = 1 << 5;

/// Explicit abort code: the elided lock was observed held.
pub(crate) const CODE_LOCK_BUSY: u8 = 0xfe;
/// Explicit abort code: the caller asked to finish under the lock.
pub(crate) const CODE_FALLBACK: u8 = 0xff;

static PROBE: OnceBool = OnceBool::new();
static DISABLED: AtomicBool = AtomicBool::new(false);

/// Returns whether hardware transactions can be attempted.
///
/// True iff the CPU reports RTM support and [`set_htm_disabled`] has not been
/// used to force the feature off. The hardware probe is memoized; the
/// kill switch is consulted on every call.
pub fn htm_available() -> bool {
    if DISABLED.load(Ordering::Relaxed) {
        return false;
    }
    PROBE.get_or_init(probe)
}

/// Process-wide kill switch forcing [`htm_available`] to report `false`.
pub fn set_htm_disabled(disabled: bool) {
    DISABLED.store(disabled, Ordering::Relaxed);
}

/// Returns whether the kill switch is currently set.
pub fn htm_disabled() -> bool {
    DISABLED.load(Ordering::Relaxed)
}

#[cfg(target_arch = "x86_64")]
fn probe() -> bool {
    std::arch::is_x86_feature_detected!("rtm")
}

#[cfg(not(target_arch = "x86_64"))]
fn probe() -> bool {
    false
}

/// Extracts the `xabort` code byte from an abort status word.
#[inline]
pub(crate) fn abort_code(status: u32) -> u8 {
    (status >> 24) as u8
}

/// Whether retrying the transaction after this abort can possibly help.
///
/// Conflicts, CPU retry hints and lock-busy aborts are transient. Capacity
/// and nesting aborts, and explicit fallback requests, will recur on every
/// attempt, so the caller should take the lock instead.
#[inline]
pub(crate) fn may_retry(status: u32) -> bool {
    if status & ABORT_EXPLICIT != 0 {
        return match abort_code(status) {
            CODE_LOCK_BUSY => true,
            CODE_FALLBACK => false,
            _ => false,
        };
    }
    if status & (ABORT_CAPACITY | ABORT_NESTED) != 0 {
        return false;
    }
    status & (ABORT_RETRY | ABORT_CONFLICT) != 0
}

#[cfg(target_arch = "x86_64")]
mod rtm {
    use core::arch::asm;

    /// Starts a transaction.
    ///
    /// Returns [`super::STARTED`] on the speculative path. When the
    /// transaction aborts, control reappears here with the abort status
    /// word instead, all speculative state discarded.
    ///
    /// # Safety
    ///
    /// Caller must pair the speculative path with exactly one `xend` and
    /// must not run allocation, I/O or syscalls before it commits.
    #[inline]
    pub(crate) unsafe fn xbegin() -> u32 {
        let mut status: u32 = super::STARTED;
        asm!("xbegin 2f", "2:", inout("eax") status, options(nostack));
        status
    }

    /// Commits the innermost transaction.
    ///
    /// # Safety
    ///
    /// Faults unless the thread is currently executing transactionally.
    #[inline]
    pub(crate) unsafe fn xend() {
        asm!("xend", options(nostack));
    }

    /// Returns whether the thread is executing transactionally.
    #[inline]
    pub(crate) fn xtest() -> bool {
        let active: u8;
        // ZF is clear while in transactional execution.
        unsafe {
            asm!("xtest", "setnz {}", out(reg_byte) active, options(nostack));
        }
        active != 0
    }

    /// Aborts with [`super::CODE_LOCK_BUSY`]. No-op outside a transaction.
    #[inline]
    pub(crate) fn xabort_lock_busy() {
        unsafe {
            asm!("xabort 0xfe", options(nostack));
        }
    }

    /// Aborts with [`super::CODE_FALLBACK`]. No-op outside a transaction.
    #[inline]
    pub(crate) fn xabort_fallback() {
        unsafe {
            asm!("xabort 0xff", options(nostack));
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod rtm {
    /// Transactions never start off x86_64; report a non-retryable abort.
    #[inline]
    pub(crate) unsafe fn xbegin() -> u32 {
        0
    }

    /// # Safety
    ///
    /// Unreachable: `xbegin` never reports a started transaction here.
    #[inline]
    pub(crate) unsafe fn xend() {}

    #[inline]
    pub(crate) fn xtest() -> bool {
        false
    }

    #[inline]
    pub(crate) fn xabort_lock_busy() {}

    #[inline]
    pub(crate) fn xabort_fallback() {}
}

pub(crate) use rtm::{xabort_fallback, xabort_lock_busy, xbegin, xend, xtest};
