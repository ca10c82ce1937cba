//! FIFO of waiting process ids.
//!
//! Used as the per-CPU list of processes waiting to become guest. Removal
//! leaves [`Pid::NOBODY`] tombstones in place; tombstones at the oldest end
//! are compacted immediately so `len` reflects live waiters there.

use super::ring::{GrowthPolicy, RingBuffer};
use crate::error::{Error, Result};
use crate::pid::Pid;

/// Fixed-capacity FIFO of pids, suitable for shared memory.
#[repr(C)]
pub struct PidQueue<const N: usize> {
    ring: RingBuffer<Pid, [Pid; N]>,
}

impl<const N: usize> Default for PidQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PidQueue<N> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            ring: RingBuffer::inline(GrowthPolicy::Fixed),
        }
    }

    /// Append `pid` (duplicates allowed).
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if all `N` slots are taken.
    pub fn push(&mut self, pid: Pid) -> Result<()> {
        if pid.is_nobody() {
            return Ok(());
        }
        self.ring.push_head(pid).map(|_| ()).ok_or(Error::QueueFull)
    }

    /// Remove and return the oldest live pid.
    pub fn pop(&mut self) -> Option<Pid> {
        while let Some(pid) = self.ring.take_tail() {
            if !pid.is_nobody() {
                return Some(pid);
            }
        }
        None
    }

    /// Tombstone every occurrence of `pid`.
    pub fn remove(&mut self, pid: Pid) {
        if pid.is_nobody() {
            return;
        }
        for slot in self.ring.iter_mut() {
            if *slot == pid {
                *slot = Pid::NOBODY;
            }
        }
        self.compact();
    }

    /// Whether `pid` is waiting.
    pub fn contains(&self, pid: Pid) -> bool {
        !pid.is_nobody() && self.ring.iter().any(|&p| p == pid)
    }

    /// Slots in use, including tombstones not yet compacted.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether no slot is in use.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Maximum number of waiters.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Live pids, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.ring.iter().copied().filter(|p| !p.is_nobody())
    }

    /// Drop every waiter.
    pub fn clear(&mut self) {
        self.ring.clear();
    }

    fn compact(&mut self) {
        while self.ring.peek_tail().is_some_and(|p| p.is_nobody()) {
            self.ring.take_tail();
        }
    }
}
