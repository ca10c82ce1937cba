//! Thread index → CPU id resolution for one process.
//!
//! A process runs `k` worker threads on the `k` CPUs it may use: the owned
//! CPUs it has claimed, in id order, then the CPUs it guests. When that set
//! changes the resolver reassigns threads, keeping every thread whose CPU
//! is still usable where it is so only the displaced ones migrate.
//!
//! ```text
//! eligible: [0 1 2]      →  [0 2 5]
//! thread 0: 0               0   (kept)
//! thread 1: 1               5   (moved to the new CPU)
//! thread 2: 2               2   (kept)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use corelend::binding::BindingResolver;
//!
//! let mut resolver = BindingResolver::new(table.clone(), pid);
//! for thread in 0..workers {
//!     match resolver.thread_binding(thread)? {
//!         Some(cpu) => pin(thread, cpu),
//!         None => park(thread),
//!     }
//! }
//! ```

use crate::cpuinfo::{BatchOutcome, CpuTable};
use crate::cpuset::CpuSet;
use crate::error::Result;
use crate::pid::Pid;
use std::sync::Arc;

/// Cached thread bindings for one pid.
#[derive(Debug)]
pub struct BindingResolver {
    table: Arc<CpuTable>,
    pid: Pid,
    eligible: Vec<usize>,
    bindings: Vec<Option<usize>>,
    /// Thread indices resolved since the last change.
    resolved: Vec<bool>,
    generation: Option<u64>,
    dirty: bool,
}

impl BindingResolver {
    /// Create a resolver for `pid`. Nothing is read until the first call.
    pub fn new(table: Arc<CpuTable>, pid: Pid) -> Self {
        Self {
            table,
            pid,
            eligible: Vec::new(),
            bindings: Vec::new(),
            resolved: Vec::new(),
            generation: None,
            dirty: true,
        }
    }

    /// Process this resolver works for.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether bindings changed and not every thread has picked its new CPU.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current bindings, indexed by thread.
    pub fn bindings(&self) -> &[Option<usize>] {
        &self.bindings
    }

    /// Make `mask` the exact owned set of the pid and recompute bindings.
    ///
    /// # Errors
    ///
    /// Whatever [`CpuTable::update_ownership`] reports.
    pub fn update_ownership(&mut self, mask: &CpuSet) -> Result<BatchOutcome> {
        let batch = self.table.update_ownership(self.pid, mask)?;
        self.refresh()?;
        Ok(batch)
    }

    /// CPU thread `thread` should run on, or `None` if the process has fewer
    /// CPUs than threads.
    ///
    /// # Errors
    ///
    /// [`crate::Error::NotRegistered`] if the pid has no record.
    pub fn thread_binding(&mut self, thread: usize) -> Result<Option<usize>> {
        let (eligible, generation) = self.table.eligible_cpus(self.pid)?;
        let moved = self.generation != Some(generation);
        if self.dirty || moved {
            self.apply(eligible, generation);
        }

        let cpu = self.bindings.get(thread).copied().flatten();
        if let Some(done) = self.resolved.get_mut(thread) {
            *done = true;
        }
        if self.dirty && !moved && self.resolved.iter().all(|&r| r) {
            tracing::trace!(pid = %self.pid, "all threads rebound");
            self.dirty = false;
        }
        Ok(cpu)
    }

    fn refresh(&mut self) -> Result<()> {
        let (eligible, generation) = self.table.eligible_cpus(self.pid)?;
        self.apply(eligible, generation);
        Ok(())
    }

    /// Reassign threads to `eligible`, keeping threads on CPUs that stay.
    fn apply(&mut self, eligible: Vec<usize>, generation: u64) {
        self.generation = Some(generation);
        if eligible == self.eligible && self.bindings.len() == eligible.len() {
            return;
        }

        let mut bindings: Vec<Option<usize>> = (0..eligible.len())
            .map(|i| {
                self.bindings
                    .get(i)
                    .copied()
                    .flatten()
                    .filter(|cpu| eligible.contains(cpu))
            })
            .collect();
        let unassigned: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|cpu| !bindings.contains(&Some(*cpu)))
            .collect();
        let mut unassigned = unassigned.into_iter();
        for slot in bindings.iter_mut().filter(|s| s.is_none()) {
            *slot = unassigned.next();
        }

        tracing::debug!(
            pid = %self.pid,
            threads = bindings.len(),
            "thread bindings changed"
        );
        self.resolved = vec![false; bindings.len()];
        self.bindings = bindings;
        self.eligible = eligible;
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn table(dir: &std::path::Path, key: &str) -> Arc<CpuTable> {
        let config = Config::new().shm_dir(dir).shm_key(key).system_size(8);
        Arc::new(CpuTable::attach(&config).unwrap())
    }

    #[test]
    fn test_initial_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(dir.path(), "initial");
        let pid = Pid::from_raw(21);
        table.register(pid, None, &[1, 3, 4].into_iter().collect(), false).unwrap();

        let mut resolver = BindingResolver::new(table, pid);
        assert!(resolver.is_dirty());
        assert_eq!(resolver.thread_binding(0).unwrap(), Some(1));
        assert_eq!(resolver.thread_binding(1).unwrap(), Some(3));
        assert!(resolver.is_dirty());
        assert_eq!(resolver.thread_binding(2).unwrap(), Some(4));
        assert!(!resolver.is_dirty());
        assert_eq!(resolver.thread_binding(3).unwrap(), None);
    }

    #[test]
    fn test_kept_threads_stay() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(dir.path(), "kept");
        let pid = Pid::from_raw(22);
        let other = Pid::from_raw(23);
        table.register(pid, None, &CpuSet::first_n(3), false).unwrap();
        table.register(other, None, &[5].into_iter().collect(), false).unwrap();

        let mut resolver = BindingResolver::new(table.clone(), pid);
        for thread in 0..3 {
            resolver.thread_binding(thread).unwrap();
        }
        assert!(!resolver.is_dirty());

        // CPU 1 is lent away, CPU 5 is borrowed
        table.lend_cpu(pid, 1).unwrap();
        table.lend_cpu(other, 5).unwrap();
        table.borrow_cpu(pid, 5).unwrap();

        assert_eq!(resolver.thread_binding(0).unwrap(), Some(0));
        assert!(resolver.is_dirty());
        assert_eq!(resolver.thread_binding(1).unwrap(), Some(5));
        assert_eq!(resolver.thread_binding(2).unwrap(), Some(2));
        assert!(!resolver.is_dirty());
    }

    #[test]
    fn test_update_ownership_raises_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(dir.path(), "ownership");
        let pid = Pid::from_raw(24);
        table.register(pid, None, &CpuSet::first_n(2), false).unwrap();

        let mut resolver = BindingResolver::new(table.clone(), pid);
        resolver.thread_binding(0).unwrap();
        resolver.thread_binding(1).unwrap();
        assert!(!resolver.is_dirty());

        resolver
            .update_ownership(&[0, 1, 6].into_iter().collect())
            .unwrap();
        assert!(resolver.is_dirty());
        assert_eq!(resolver.bindings(), &[Some(0), Some(1), Some(6)]);
        assert_eq!(table.owner(6), Some(pid));
    }

    #[test]
    fn test_unregistered_pid() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(dir.path(), "unregistered");
        let mut resolver = BindingResolver::new(table, Pid::from_raw(99));
        assert!(resolver.thread_binding(0).is_err());
    }
}
