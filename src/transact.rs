//! Transacted critical sections: hardware lock elision with a pessimistic
//! fallback.
//!
//! A section guarded by a [`SpinLock`] can be entered two ways:
//!
//! - **Optimistic**: as a hardware transaction. The lock is only *read*
//!   (which places it in the transaction's read set), the body runs
//!   speculatively, and the commit publishes every write atomically. Any
//!   concurrent acquisition of the lock aborts the transaction, so
//!   transacting and locking threads compose correctly.
//! - **Pessimistic**: by acquiring the lock. This path always completes,
//!   which bounds starvation: transient aborts retry a few times, then take
//!   the lock.
//!
//! The optimistic path must not allocate, free, perform I/O or syscalls, or
//! touch more than a handful of cache lines; a body that discovers it needs
//! any of those returns [`Fallback`] and is re-entered pessimistically.

use crate::htm;
use crate::spinlock::SpinLock;
use crossbeam_utils::Backoff;

/// Transient aborts are retried this many times before taking the lock.
const MAX_TX_RETRIES: u32 = 4;

/// How a critical section body was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entered {
    /// Running speculatively inside a hardware transaction.
    Optimistic,
    /// Running with the lock held.
    Pessimistic,
}

/// Request to abort the transaction and finish the section under the lock.
///
/// Only meaningful from an [`Entered::Optimistic`] call; a pessimistic body
/// has the lock and can perform the operation it was about to fall back for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fallback;

/// Runs `body` as a transacted critical section guarded by `lock`.
///
/// The body may be executed several times: speculative attempts that abort
/// leave no trace (their memory effects are rolled back), and exactly one
/// execution — the committed transaction or the locked run — takes effect.
///
/// For sections that sometimes need the lock (e.g. to allocate), see
/// [`transact_if`].
#[inline]
pub fn transact<R>(lock: &SpinLock, mut body: impl FnMut() -> R) -> R {
    transact_if(lock, |_| true, |_| Ok(body()))
}

/// Runs `body` as a transacted critical section, entering optimistically
/// only while `pred` approves.
///
/// `pred` is evaluated before every speculative attempt and receives the
/// attempt number; returning `false` routes the call straight to the lock.
/// It runs outside the transaction, so anything it reads is advisory — the
/// body must re-check whatever the predicate decided on.
///
/// The body receives how it was entered and may return `Err(Fallback)` from
/// an optimistic run to abort the transaction and be re-entered with the
/// lock held. A pessimistic run must return `Ok`.
pub fn transact_if<R, P, F>(lock: &SpinLock, mut pred: P, mut body: F) -> R
where
    P: FnMut(u32) -> bool,
    F: FnMut(Entered) -> Result<R, Fallback>,
{
    if htm::htm_available() {
        // Already transacting: flatten into the enclosing transaction. The
        // lock still has to be free, and reading it here subscribes the
        // enclosing transaction to it.
        if htm::xtest() {
            if lock.is_locked() {
                htm::xabort_lock_busy();
            }
            if let Ok(r) = body(Entered::Optimistic) {
                return r;
            }
            htm::xabort_fallback();
            // An explicit abort inside a transaction does not return.
            unreachable!("xabort fell through outside a transaction");
        }

        let backoff = Backoff::new();
        let mut attempt = 0;
        while pred(attempt) {
            // Starting while the lock is held would abort immediately; wait
            // for the holder, bounded like any other transient failure.
            if lock.is_locked() {
                attempt += 1;
                if attempt >= MAX_TX_RETRIES {
                    break;
                }
                backoff.snooze();
                continue;
            }

            // SAFETY: the speculative path below commits with `xend` before
            // returning, and the body contract forbids allocation and
            // syscalls on the optimistic path.
            let status = unsafe { htm::xbegin() };
            if status == htm::STARTED {
                // Subscribe to the lock: a concurrent `lock()` aborts us.
                if lock.is_locked() {
                    htm::xabort_lock_busy();
                }
                match body(Entered::Optimistic) {
                    Ok(r) => {
                        // SAFETY: still on the speculative path of the
                        // `xbegin` above.
                        unsafe { htm::xend() };
                        return r;
                    }
                    Err(Fallback) => htm::xabort_fallback(),
                }
            }

            // Aborted; `status` explains why.
            if !htm::may_retry(status) {
                break;
            }
            attempt += 1;
            if attempt >= MAX_TX_RETRIES {
                break;
            }
            backoff.spin();
        }
    }

    let _guard = lock.lock();
    loop {
        match body(Entered::Pessimistic) {
            Ok(r) => return r,
            Err(Fallback) => {
                // Contract violation: with the lock held there is nothing to
                // fall back to. Re-running converges for any body that only
                // requests fallback to reach the lock.
                debug_assert!(false, "Fallback returned from a pessimistic section");
            }
        }
    }
}
