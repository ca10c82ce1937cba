//! Process-shared spin lock living inside the segment header.
//!
//! The lock word holds the pid of the current holder (`0` when free), which
//! makes a stuck lock attributable in diagnostics. Critical sections are a
//! single table operation, so waiters spin briefly and then yield.

use crate::pid::Pid;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

/// Spins before a waiter starts yielding its time slice.
const SPIN_LIMIT: u32 = 128;

/// Lock word stored in shared memory. All-zero is unlocked.
#[repr(C)]
pub struct SegmentLock {
    holder: AtomicI32,
}

impl SegmentLock {
    /// Try to take the lock without waiting.
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        let me = Pid::current().as_raw();
        self.holder
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| LockGuard { lock: self })
    }

    /// Take the lock, waiting as long as needed.
    pub fn lock(&self) -> LockGuard<'_> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            backoff(&mut spins);
        }
    }

    /// Take the lock, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<LockGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock() {
                return Some(guard);
            }
            if Instant::now() >= deadline {
                return None;
            }
            backoff(&mut spins);
        }
    }

    /// Pid currently holding the lock.
    pub fn holder(&self) -> Option<Pid> {
        Pid::from_raw(self.holder.load(Ordering::Relaxed)).get()
    }

    /// Whether the lock is held.
    pub fn is_locked(&self) -> bool {
        self.holder.load(Ordering::Relaxed) != 0
    }

    fn unlock(&self) {
        self.holder.store(0, Ordering::Release);
    }
}

fn backoff(spins: &mut u32) {
    if *spins < SPIN_LIMIT {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// Scoped ownership of a [`SegmentLock`]; releases on drop, including unwinding.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a SegmentLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
