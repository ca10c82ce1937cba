//! Per-process "N more CPUs, any of them" accumulator.
//!
//! Entries are unordered and keyed by pid. [`AggregateQueue::pop_ncpus`]
//! hands a batch of freed CPUs out fairly:
//!
//! ```text
//! sorted desc:  [222:5] [111:3] [333:1]      ncpus = 6
//! visit i=2     333 gets min(6/3, 1) = 1     remaining 5
//! visit i=1     111 gets min(5/2, 3) = 2     remaining 3
//! visit i=0     222 gets min(3/1, 5) = 3     remaining 0
//! ```
//!
//! Visiting from the smallest request with divisor `i + 1` keeps a large
//! requester from starving the small ones, while whatever a small request
//! did not use rolls forward to the larger ones.

use super::ring::{GrowthPolicy, RingBuffer};
use crate::error::{Error, Result};
use crate::pid::Pid;
use smallvec::SmallVec;

/// Pending count for one process, also used as a grant record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregateRequest {
    /// Requesting process.
    pub pid: Pid,
    /// Number of CPUs.
    pub howmany: u32,
}

impl AggregateRequest {
    /// Shorthand constructor.
    pub fn new(pid: Pid, howmany: u32) -> Self {
        Self { pid, howmany }
    }
}

/// Grants produced by one [`AggregateQueue::pop_ncpus`] call.
pub type Grants = SmallVec<[AggregateRequest; 8]>;

/// Fixed-capacity aggregate queue, suitable for shared memory.
#[repr(C)]
pub struct AggregateQueue<const N: usize> {
    ring: RingBuffer<AggregateRequest, [AggregateRequest; N]>,
}

impl<const N: usize> Default for AggregateQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> AggregateQueue<N> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            ring: RingBuffer::inline(GrowthPolicy::Fixed),
        }
    }

    fn position(&self, pid: Pid) -> Option<usize> {
        self.ring.iter().position(|r| r.pid == pid)
    }

    /// Add `howmany` to the request of `pid`. Zero removes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if `pid` has no entry and there is no room.
    pub fn push(&mut self, pid: Pid, howmany: u32) -> Result<()> {
        if pid.is_nobody() {
            return Ok(());
        }
        if howmany == 0 {
            self.remove(pid);
            return Ok(());
        }
        if let Some(i) = self.position(pid)
            && let Some(entry) = self.ring.get_mut(i)
        {
            entry.howmany = entry.howmany.saturating_add(howmany);
            return Ok(());
        }
        self.ring
            .push_head(AggregateRequest::new(pid, howmany))
            .map(|_| ())
            .ok_or(Error::QueueFull)
    }

    /// Drop the request of `pid`, returning how many CPUs it still wanted.
    pub fn remove(&mut self, pid: Pid) -> u32 {
        if pid.is_nobody() {
            return 0;
        }
        let Some(i) = self.position(pid) else {
            return 0;
        };
        // Order does not matter: move the newest entry into the hole
        let last = self.ring.take_head().unwrap_or_default();
        if last.pid == pid {
            return last.howmany;
        }
        match self.ring.get_mut(i) {
            Some(slot) => std::mem::replace(slot, last).howmany,
            None => 0,
        }
    }

    /// CPUs still wanted by `pid`.
    pub fn get(&self, pid: Pid) -> u32 {
        self.ring
            .iter()
            .find(|r| r.pid == pid)
            .map_or(0, |r| r.howmany)
    }

    /// Hand out up to `ncpus` CPUs, producing at most `max_out` grants.
    ///
    /// Returns the grants (smallest request served first) and the number
    /// of the `ncpus` that nobody received.
    pub fn pop_ncpus(&mut self, ncpus: u32, max_out: usize) -> (Grants, u32) {
        self.pop_ncpus_except(ncpus, max_out, Pid::NOBODY)
    }

    /// [`AggregateQueue::pop_ncpus`] leaving the request of `except` untouched.
    ///
    /// Used when the CPUs being handed out belong to `except` itself.
    pub fn pop_ncpus_except(&mut self, ncpus: u32, max_out: usize, except: Pid) -> (Grants, u32) {
        let mut grants = Grants::new();
        let mut remaining = ncpus;
        if self.ring.is_empty() {
            return (grants, remaining);
        }

        // Excluded entry sorts last so it never takes part in the split
        let entries = self.ring.make_contiguous();
        entries.sort_by(|a, b| {
            (a.pid == except)
                .cmp(&(b.pid == except))
                .then(b.howmany.cmp(&a.howmany))
        });
        let eligible = entries.iter().filter(|r| r.pid != except).count();

        for i in (0..eligible).rev() {
            if remaining == 0 || grants.len() >= max_out {
                break;
            }
            let entry = &mut entries[i];
            let popped = (remaining / (i as u32 + 1)).min(entry.howmany);
            if popped > 0 {
                grants.push(AggregateRequest::new(entry.pid, popped));
                entry.howmany -= popped;
                remaining -= popped;
            }
        }

        self.ring.retain(|r| r.howmany > 0);
        (grants, remaining)
    }

    /// Total CPUs wanted by every process.
    pub fn total(&self) -> u32 {
        self.ring
            .iter()
            .fold(0u32, |acc, r| acc.saturating_add(r.howmany))
    }

    /// Number of processes with a request.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Maximum number of processes.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// All requests, in storage order.
    pub fn iter(&self) -> impl Iterator<Item = &AggregateRequest> {
        self.ring.iter()
    }

    /// Drop every request.
    pub fn clear(&mut self) {
        self.ring.clear();
    }
}
