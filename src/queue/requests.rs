//! FIFO of "N units of any CPU in this mask" requests.
//!
//! Answers the question "which waiting process, if any, may use *this*
//! CPU right now". Requests are served oldest first; consecutive pushes
//! by the same pid merge into one entry. Cancelled and drained entries
//! become tombstones (`pid == NOBODY`) that are compacted from the oldest
//! end.

use super::ring::{GrowthPolicy, RingBuffer};
use crate::cpuset::CpuSet;
use crate::error::{Error, Result};
use crate::pid::Pid;

/// One outstanding request.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    /// Requesting process, `NOBODY` for a tombstone.
    pub pid: Pid,
    /// Units still wanted.
    pub howmany: u32,
    /// CPUs the requester accepts.
    pub allowed: CpuSet,
}

impl ResourceRequest {
    fn is_live(&self) -> bool {
        !self.pid.is_nobody()
    }
}

/// Fixed-capacity request queue, suitable for shared memory.
#[repr(C)]
pub struct RequestQueue<const N: usize> {
    ring: RingBuffer<ResourceRequest, [ResourceRequest; N]>,
}

impl<const N: usize> Default for RequestQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RequestQueue<N> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            ring: RingBuffer::inline(GrowthPolicy::Fixed),
        }
    }

    /// Queue `howmany` units for `pid`, restricted to `allowed`.
    ///
    /// A zero count cancels every request of `pid`. If the newest entry
    /// already belongs to `pid` its count grows in place and its mask is
    /// left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if a new entry is needed and there is no room.
    pub fn push(&mut self, pid: Pid, howmany: u32, allowed: &CpuSet) -> Result<()> {
        if pid.is_nobody() {
            return Ok(());
        }
        if howmany == 0 {
            self.remove(pid);
            return Ok(());
        }
        if let Some(newest) = self.ring.peek_head_mut()
            && newest.pid == pid
        {
            newest.howmany = newest.howmany.saturating_add(howmany);
            return Ok(());
        }
        self.ring
            .push_head(ResourceRequest {
                pid,
                howmany,
                allowed: *allowed,
            })
            .map(|_| ())
            .ok_or(Error::QueueFull)
    }

    /// Cancel every request of `pid`.
    pub fn remove(&mut self, pid: Pid) {
        if pid.is_nobody() {
            return;
        }
        for request in self.ring.iter_mut() {
            if request.pid == pid {
                *request = ResourceRequest::default();
            }
        }
        self.compact();
    }

    /// Take one unit for `cpu` from the oldest request that accepts it.
    pub fn get(&mut self, cpu: usize) -> Option<Pid> {
        let mut found = None;
        for request in self.ring.iter_mut() {
            if request.is_live() && request.allowed.contains(cpu) {
                found = Some(request.pid);
                request.howmany -= 1;
                if request.howmany == 0 {
                    *request = ResourceRequest::default();
                }
                break;
            }
        }
        self.compact();
        found
    }

    /// Units still requested by `pid` across all its entries.
    pub fn pending(&self, pid: Pid) -> u32 {
        self.iter()
            .filter(|r| r.pid == pid)
            .fold(0u32, |acc, r| acc.saturating_add(r.howmany))
    }

    /// Whether `pid` has any outstanding entry.
    pub fn contains(&self, pid: Pid) -> bool {
        !pid.is_nobody() && self.iter().any(|r| r.pid == pid)
    }

    /// Slots in use, including tombstones behind the oldest live entry.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether no slot is in use.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Maximum number of entries.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Live requests, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceRequest> {
        self.ring.iter().filter(|r| r.is_live())
    }

    /// Drop every request.
    pub fn clear(&mut self) {
        self.ring.clear();
    }

    fn compact(&mut self) {
        while self.ring.peek_tail().is_some_and(|r| !r.is_live()) {
            self.ring.take_tail();
        }
    }
}
