use std::{mem, sync::atomic::Ordering};

use linux_futex::{Futex, Private};

use crate::util::hint::cold;

/// Nobody holds the lock
const FUTEX_UNLOCKED: u32 = 0;

/// Somebody holds the lock, and nobody is asleep waiting for it
const FUTEX_LOCKED: u32 = 1;

/// Somebody holds the lock, and there might be sleepers, so `unlock()` has to
/// go to the kernel to wake one
const FUTEX_CONTENDED: u32 = 2;

/// A mutex built directly on a futex word. Unlike `std::sync::Mutex` there is
/// no poisoning and no data attached, and it never allocates, which matters
/// because it is taken from inside `malloc()`.
///
/// The fast path (uncontended lock/unlock) stays entirely in userspace.
pub struct RawLock {
    futex: Futex<Private>,
}

impl RawLock {
    pub const fn new() -> Self {
        Self {
            futex: Futex::new(FUTEX_UNLOCKED),
        }
    }

    /// Block until we hold the lock. The lock is not re-entrant: locking it
    /// twice on the same thread hangs forever.
    pub fn lock(&self) -> RawLockGuard<'_> {
        if self
            .futex
            .value
            .compare_exchange(
                FUTEX_UNLOCKED,
                FUTEX_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            cold(|| self.lock_contended());
        }
        RawLockGuard { lock: self }
    }

    /// Take the lock only if nobody holds it right now.
    pub fn try_lock(&self) -> Option<RawLockGuard<'_>> {
        self.futex
            .value
            .compare_exchange(
                FUTEX_UNLOCKED,
                FUTEX_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| RawLockGuard { lock: self })
    }

    /// Take the lock and keep it past the end of any scope, for holding it
    /// across `fork()`. Release it with [`RawLock::release`] or, in the
    /// child, [`RawLock::reset`].
    pub fn acquire(&self) {
        mem::forget(self.lock());
    }

    /// # Safety
    ///
    /// This thread took the lock with [`RawLock::acquire`].
    pub unsafe fn release(&self) {
        self.unlock();
    }

    /// Mark the lock free whoever held it. Only sound where the holder can
    /// never run again, as in a freshly forked child.
    pub fn reset(&self) {
        self.futex.value.store(FUTEX_UNLOCKED, Ordering::Release);
    }

    fn lock_contended(&self) {
        // Once we've had to wait, we can't know whether there are other
        // sleepers, so we always leave the word as CONTENDED. That costs at
        // most one spurious wake.
        while self.futex.value.swap(FUTEX_CONTENDED, Ordering::Acquire) != FUTEX_UNLOCKED {
            _ = self.futex.wait(FUTEX_CONTENDED);
        }
    }

    fn unlock(&self) {
        if self.futex.value.swap(FUTEX_UNLOCKED, Ordering::Release) == FUTEX_CONTENDED {
            self.futex.wake(1);
        }
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for [`RawLock`]. Dropping it releases the lock.
pub struct RawLockGuard<'a> {
    lock: &'a RawLock,
}

impl Drop for RawLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
