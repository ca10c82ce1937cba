//! The negotiation protocol over the shared table.
//!
//! [`Negotiator`] borrows every part of the table mutably for the duration
//! of one locked operation. It never blocks and never performs I/O; the
//! caller holds the segment lock while it exists.

use super::outcome::{BatchOutcome, Outcome, Status};
use super::priority::{Affinity, CpuPriority, Topology};
use super::slot::{CpuSlot, CpuSnapshot, SlotState, StatsState};
use crate::clock::Timestamp;
use crate::cpuset::CpuSet;
use crate::error::{Error, Result};
use crate::observability::trace_queued;
use crate::pid::Pid;
use crate::queue::{AggregateQueue, RequestQueue};

/// Entries of the per-resource request queue.
pub const REQUEST_QUEUE_CAPACITY: usize = 1024;

/// Entries of the aggregate request queue.
pub const AGGREGATE_QUEUE_CAPACITY: usize = 256;

/// Process records in one table.
pub const MAX_PROCESSES: usize = 256;

pub(crate) type Requests = RequestQueue<REQUEST_QUEUE_CAPACITY>;
pub(crate) type Aggregate = AggregateQueue<AGGREGATE_QUEUE_CAPACITY>;

/// Table-wide fields, first in the payload.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct TableHeader {
    pub request_queues: u32,
    pub _pad: u32,
    /// Last time a CPU became free.
    pub timestamp_cpu_lent: Timestamp,
    pub initial_time: Timestamp,
}

/// Per-process bookkeeping. A `NOBODY` pid marks a free record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ProcessRecord {
    pub pid: Pid,
    pub preinit: u32,
    pub owned: CpuSet,
    pub dirty: u32,
    /// Zero means unlimited.
    pub max_parallelism: u32,
    pub generation: u64,
    /// Last time a count-based borrow came back empty.
    pub last_borrow: Timestamp,
}

/// Per-process switches that shape the protocol.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Options {
    pub respect_cpuset: bool,
    pub public_post_mortem: bool,
    pub cpu_stats: bool,
    pub affinity: Affinity,
}

/// Mutable view of the table for one locked operation.
pub(crate) struct Negotiator<'a> {
    pub header: &'a mut TableHeader,
    pub slots: &'a mut [CpuSlot],
    pub requests: &'a mut Requests,
    pub aggregate: &'a mut Aggregate,
    pub records: &'a mut [ProcessRecord],
    pub opts: Options,
    pub topology: &'a Topology,
    pub now: Timestamp,
}

impl Negotiator<'_> {
    pub fn system_size(&self) -> usize {
        self.slots.len()
    }

    pub fn queues_enabled(&self) -> bool {
        self.header.request_queues != 0
    }

    fn in_range(&self, cpu: usize) -> bool {
        cpu < self.slots.len()
    }

    fn record_index(&self, pid: Pid) -> Option<usize> {
        if pid.is_nobody() {
            return None;
        }
        self.records.iter().position(|r| r.pid == pid)
    }

    pub fn record(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.record_index(pid).map(|i| &self.records[i])
    }

    /// Flag that the CPUs usable by `pid` changed.
    fn touch(&mut self, pid: Pid) {
        if let Some(i) = self.record_index(pid) {
            let record = &mut self.records[i];
            record.dirty = 1;
            record.generation = record.generation.wrapping_add(1);
        }
    }

    fn stats_state(slot: &CpuSlot) -> StatsState {
        if slot.guest.is_nobody() {
            StatsState::Idle
        } else if slot.guest == slot.owner {
            StatsState::Owned
        } else {
            StatsState::Guested
        }
    }

    fn set_guest(&mut self, cpu: usize, guest: Pid) {
        let slot = &mut self.slots[cpu];
        let old = slot.guest;
        if old == guest {
            return;
        }
        slot.guest = guest;
        if self.opts.cpu_stats {
            let next = Self::stats_state(slot);
            slot.account(next, self.now);
        }
        crate::observability::trace_transition(cpu, guest.get(), old.get());
        self.touch(old);
        self.touch(guest);
    }

    fn set_state(&mut self, cpu: usize, state: SlotState) {
        let slot = &mut self.slots[cpu];
        if slot.state != state {
            slot.state = state;
            let owner = slot.owner;
            self.touch(owner);
        }
    }

    fn set_owner(&mut self, cpu: usize, owner: Pid) {
        let slot = &mut self.slots[cpu];
        let old = slot.owner;
        if old == owner {
            return;
        }
        slot.owner = owner;
        if self.opts.cpu_stats {
            let next = Self::stats_state(slot);
            slot.account(next, self.now);
        }
        if let Some(i) = self.record_index(old) {
            self.records[i].owned.remove(cpu);
        }
        if let Some(i) = self.record_index(owner) {
            self.records[i].owned.insert(cpu);
        }
        crate::observability::trace_ownership(owner, cpu, !owner.is_nobody());
        self.touch(old);
        self.touch(owner);
    }

    /// A CPU became free; wakes up borrowers that gave up earlier.
    fn mark_free(&mut self) {
        self.header.timestamp_cpu_lent = self.now;
    }

    /// Pick who should run on a CPU nobody is guesting.
    ///
    /// A claimed CPU goes to its owner. Otherwise the CPU's own waiters come
    /// first, then the per-resource queue, then (if `use_aggregate`) the
    /// aggregate queue. A lent CPU is never handed back to its owner through
    /// the aggregate queue.
    fn find_new_guest(&mut self, cpu: usize, use_aggregate: bool) -> Pid {
        let queues = self.queues_enabled();
        let slot = &mut self.slots[cpu];
        let owner = slot.owner;
        match slot.state {
            SlotState::Busy => slot.owner,
            SlotState::Disabled if self.opts.respect_cpuset => Pid::NOBODY,
            _ if !queues => Pid::NOBODY,
            _ => {
                if let Some(pid) = slot.pending.pop() {
                    return pid;
                }
                if let Some(pid) = self.requests.get(cpu) {
                    return pid;
                }
                if use_aggregate {
                    let (grants, _) = self.aggregate.pop_ncpus_except(1, 1, owner);
                    if let Some(grant) = grants.first() {
                        return grant.pid;
                    }
                }
                Pid::NOBODY
            }
        }
    }

    /// Offer a free CPU to the next requester.
    fn offer(&mut self, cpu: usize, use_aggregate: bool) -> Option<Pid> {
        if !self.slots[cpu].guest.is_nobody() {
            return None;
        }
        let new_guest = self.find_new_guest(cpu, use_aggregate).get()?;
        self.set_guest(cpu, new_guest);
        Some(new_guest)
    }

    /// Hand the CPUs of `cpus` that are still free to the aggregate queue.
    ///
    /// CPUs are split per owner so no process receives a CPU it owns.
    fn distribute_free(&mut self, cpus: &CpuSet, batch: &mut BatchOutcome) {
        if !self.queues_enabled() {
            return;
        }
        let mut free: Vec<usize> = cpus
            .iter()
            .filter(|&cpu| self.in_range(cpu) && self.slots[cpu].is_free())
            .collect();
        while let Some(&first) = free.first() {
            if self.aggregate.is_empty() {
                return;
            }
            let owner = self.slots[first].owner;
            let (group, rest): (Vec<usize>, Vec<usize>) = free
                .into_iter()
                .partition(|&cpu| self.slots[cpu].owner == owner);
            free = rest;

            let (grants, _) =
                self.aggregate
                    .pop_ncpus_except(group.len() as u32, group.len(), owner);
            let mut group = group.into_iter();
            for grant in grants {
                for cpu in group.by_ref().take(grant.howmany as usize) {
                    self.set_guest(cpu, grant.pid);
                    batch.record(cpu, Outcome::new(Status::Success, Some(grant.pid), None));
                }
            }
        }
    }

    fn any_free(&self, cpus: &CpuSet) -> bool {
        cpus.iter()
            .any(|cpu| self.in_range(cpu) && self.slots[cpu].guest.is_nobody())
    }

    // ------------------------------------------------------------------
    // Single-CPU primitives
    // ------------------------------------------------------------------

    /// Owner lends `cpu`. `use_aggregate` selects whether the aggregate
    /// queue is consulted right away or left to a batch distribution.
    pub fn lend(&mut self, pid: Pid, cpu: usize, use_aggregate: bool) -> Result<Outcome> {
        if !self.in_range(cpu) || self.slots[cpu].owner != pid {
            return Err(Error::Permission { pid, cpu });
        }
        if self.slots[cpu].state == SlotState::Lent && self.slots[cpu].guest != pid {
            return Ok(Outcome::NO_UPDATE);
        }
        self.set_state(cpu, SlotState::Lent);
        if self.slots[cpu].guest == pid {
            self.set_guest(cpu, Pid::NOBODY);
        }
        let new_guest = self.offer(cpu, use_aggregate);
        self.mark_free();
        Ok(Outcome::new(Status::Success, new_guest, None))
    }

    /// A non-owner stops using `cpu` and withdraws its wait on it.
    fn release(&mut self, pid: Pid, cpu: usize, use_aggregate: bool) -> Option<Pid> {
        self.slots[cpu].pending.remove(pid);
        if self.slots[cpu].guest != pid {
            return None;
        }
        self.set_guest(cpu, Pid::NOBODY);
        self.offer(cpu, use_aggregate)
    }

    pub fn reclaim(&mut self, pid: Pid, cpu: usize) -> Result<Outcome> {
        if !self.in_range(cpu) || self.slots[cpu].owner != pid {
            return Err(Error::Permission { pid, cpu });
        }
        self.set_state(cpu, SlotState::Busy);
        let guest = self.slots[cpu].guest;
        if guest == pid {
            Ok(Outcome::NO_UPDATE)
        } else if guest.is_nobody() {
            self.set_guest(cpu, pid);
            Ok(Outcome::new(Status::Success, Some(pid), None))
        } else {
            Ok(Outcome::new(Status::Noted, Some(pid), Some(guest)))
        }
    }

    /// Whether a non-owner may take an unguested `cpu` right away.
    fn is_available(&self, cpu: usize) -> bool {
        let slot = &self.slots[cpu];
        slot.guest.is_nobody()
            && (slot.state == SlotState::Lent
                || (!self.opts.respect_cpuset && slot.state == SlotState::Disabled))
    }

    pub fn acquire(&mut self, pid: Pid, cpu: usize) -> Result<Outcome> {
        if !self.in_range(cpu) {
            return Err(Error::Permission { pid, cpu });
        }
        let slot = &self.slots[cpu];
        if slot.guest == pid {
            return Ok(Outcome::NO_UPDATE);
        }
        if slot.owner == pid {
            return self.reclaim(pid, cpu);
        }
        if self.is_available(cpu) {
            self.set_guest(cpu, pid);
            return Ok(Outcome::new(Status::Success, Some(pid), None));
        }
        if slot.state != SlotState::Disabled || !self.opts.respect_cpuset {
            if !self.queues_enabled() {
                return Ok(Outcome::NO_UPDATE);
            }
            let pending = &mut self.slots[cpu].pending;
            if !pending.contains(pid) {
                pending.push(pid)?;
                trace_queued(pid, 1, "cpu");
            }
            return Ok(Outcome::NOTED);
        }
        Err(Error::Permission { pid, cpu })
    }

    pub fn borrow(&mut self, pid: Pid, cpu: usize) -> Outcome {
        if !self.in_range(cpu) {
            return Outcome::NO_UPDATE;
        }
        let slot = &self.slots[cpu];
        if slot.owner == pid && slot.guest.is_nobody() {
            self.set_state(cpu, SlotState::Busy);
            self.set_guest(cpu, pid);
            Outcome::new(Status::Success, Some(pid), None)
        } else if slot.owner != pid && self.is_available(cpu) {
            self.set_guest(cpu, pid);
            Outcome::new(Status::Success, Some(pid), None)
        } else {
            Outcome::NO_UPDATE
        }
    }

    pub fn return_cpu(&mut self, pid: Pid, cpu: usize) -> Result<Outcome> {
        if !self.in_range(cpu) {
            return Err(Error::Permission { pid, cpu });
        }
        let slot = &self.slots[cpu];
        if slot.owner == pid {
            return Ok(Outcome::NO_UPDATE);
        }
        if slot.guest != pid {
            return if slot.state == SlotState::Lent {
                Ok(Outcome::NO_UPDATE)
            } else {
                Err(Error::Permission { pid, cpu })
            };
        }
        let reclaimed = slot.state == SlotState::Busy;
        self.set_guest(cpu, Pid::NOBODY);
        let new_guest = self.offer(cpu, true);
        if new_guest.is_none() {
            self.mark_free();
        }
        if reclaimed && self.queues_enabled() {
            let pending = &mut self.slots[cpu].pending;
            if !pending.contains(pid) && pending.push(pid).is_err() {
                tracing::warn!(pid = %pid, cpu = cpu, "pending queue full, returned CPU not re-requested");
            }
        }
        Ok(Outcome::new(Status::Success, new_guest, None))
    }

    // ------------------------------------------------------------------
    // Batch forms
    // ------------------------------------------------------------------

    pub fn lend_mask(&mut self, pid: Pid, mask: &CpuSet) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        let size = self.system_size();
        for cpu in mask.iter().filter(|&cpu| cpu < size) {
            match self.lend(pid, cpu, false) {
                Ok(outcome) => batch.record(cpu, outcome),
                Err(_) => {
                    batch.denied.insert(cpu);
                }
            }
        }
        self.distribute_free(mask, &mut batch);
        batch
    }

    /// Lend up to `n` owned CPUs the owner is not lending yet, highest id first.
    pub fn lend_count(&mut self, pid: Pid, n: u32) -> BatchOutcome {
        let mask: CpuSet = (0..self.system_size())
            .rev()
            .filter(|&cpu| {
                let slot = &self.slots[cpu];
                slot.owner == pid && slot.state == SlotState::Busy
            })
            .take(n as usize)
            .collect();
        self.lend_mask(pid, &mask)
    }

    pub fn owned_mask(&self, pid: Pid) -> CpuSet {
        (0..self.system_size())
            .filter(|&cpu| self.slots[cpu].owner == pid)
            .collect()
    }

    pub fn guested_mask(&self, pid: Pid) -> CpuSet {
        (0..self.system_size())
            .filter(|&cpu| self.slots[cpu].guest == pid)
            .collect()
    }

    pub fn reclaim_mask(&mut self, pid: Pid, mask: &CpuSet) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        let size = self.system_size();
        for cpu in mask.iter().filter(|&cpu| cpu < size) {
            match self.reclaim(pid, cpu) {
                Ok(outcome) => batch.record(cpu, outcome),
                Err(_) => {
                    batch.denied.insert(cpu);
                }
            }
        }
        batch
    }

    pub fn reclaim_count(&mut self, pid: Pid, mut n: u32) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        for cpu in 0..self.system_size() {
            if n == 0 {
                break;
            }
            let slot = &self.slots[cpu];
            if slot.owner != pid || slot.guest == pid {
                continue;
            }
            if let Ok(outcome) = self.reclaim(pid, cpu) {
                if outcome.status.is_progress() {
                    n -= 1;
                }
                batch.record(cpu, outcome);
            }
        }
        batch
    }

    pub fn reclaim_all(&mut self, pid: Pid) -> BatchOutcome {
        let mask: CpuSet = (0..self.system_size())
            .filter(|&cpu| {
                let slot = &self.slots[cpu];
                slot.owner == pid && slot.guest != pid
            })
            .collect();
        self.reclaim_mask(pid, &mask)
    }

    /// Withdraw every outstanding request of `pid`. Returns whether anything
    /// was pending.
    pub fn remove_requests(&mut self, pid: Pid) -> bool {
        let mut removed = self.aggregate.remove(pid) > 0;
        if self.requests.contains(pid) {
            self.requests.remove(pid);
            removed = true;
        }
        for slot in self.slots.iter_mut() {
            if slot.pending.contains(pid) {
                slot.pending.remove(pid);
                removed = true;
            }
        }
        removed
    }

    pub fn acquire_mask(&mut self, pid: Pid, mask: &CpuSet) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        if mask.is_empty() {
            if self.remove_requests(pid) {
                batch.status = Status::Success;
            }
            return batch;
        }
        let size = self.system_size();
        for cpu in mask.iter().filter(|&cpu| cpu < size) {
            match self.acquire(pid, cpu) {
                Ok(outcome) => batch.record(cpu, outcome),
                Err(Error::QueueFull) => batch.queue_full = true,
                Err(_) => {
                    batch.denied.insert(cpu);
                }
            }
        }
        batch
    }

    pub fn priority(&self, pid: Pid) -> CpuPriority {
        let owned = self.record(pid).map(|r| r.owned).unwrap_or_default();
        CpuPriority::build(
            &owned,
            self.topology,
            self.opts.affinity,
            self.system_size(),
        )
    }

    /// How many more CPUs `pid` may guest, or `None` when it already guests
    /// its maximum.
    fn parallelism_budget(&self, pid: Pid, requested: u32) -> Option<u32> {
        let max = self.record(pid).map(|r| r.max_parallelism).unwrap_or(0);
        if max == 0 {
            return Some(requested);
        }
        let guested = self.slots.iter().filter(|s| s.guest == pid).count() as u32;
        if guested >= max {
            None
        } else {
            Some(requested.min(max - guested))
        }
    }

    fn borrow_gave_up_since_last_lend(&self, pid: Pid) -> bool {
        self.record(pid)
            .is_some_and(|r| r.last_borrow > self.header.timestamp_cpu_lent)
    }

    fn note_failed_borrow(&mut self, pid: Pid) {
        if let Some(i) = self.record_index(pid) {
            self.records[i].last_borrow = self.now;
        }
    }

    /// Borrow non-owned candidates of `cpus` in order, then whole free
    /// sockets if the affinity asks for it.
    fn borrow_candidates(
        &mut self,
        pid: Pid,
        cpus: &[usize],
        ncpus: &mut u32,
        batch: &mut BatchOutcome,
    ) {
        for &cpu in cpus {
            if *ncpus == 0 {
                return;
            }
            let outcome = self.borrow(pid, cpu);
            if outcome.status == Status::Success {
                *ncpus -= 1;
                batch.record(cpu, outcome);
            }
        }

        if self.opts.affinity == Affinity::SpreadIfEmpty && *ncpus > 0 {
            let free: CpuSet = (0..self.system_size())
                .filter(|&cpu| self.slots[cpu].is_free())
                .collect();
            let topology = self.topology;
            for socket in topology.parents_inside(&free) {
                if *ncpus == 0 {
                    break;
                }
                for cpu in socket.iter() {
                    let outcome = self.borrow(pid, cpu);
                    if outcome.status == Status::Success {
                        *ncpus = ncpus.saturating_sub(1);
                        batch.record(cpu, outcome);
                    }
                }
            }
        }
    }

    /// Acquire `requested` CPUs (`None`: as many as possible, never queued).
    pub fn acquire_count(&mut self, pid: Pid, requested: Option<u32>) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        if requested == Some(0) {
            if self.remove_requests(pid) {
                batch.status = Status::Success;
            }
            return batch;
        }

        let prio = self.priority(pid);
        if self.borrow_gave_up_since_last_lend(pid)
            && prio.owned().iter().all(|&cpu| self.slots[cpu].guest == pid)
        {
            return batch;
        }
        let wanted = requested.unwrap_or(self.system_size() as u32);
        let Some(mut ncpus) = self.parallelism_budget(pid, wanted) else {
            return batch;
        };

        // Owned CPUs nobody runs on
        for &cpu in prio.owned() {
            if ncpus == 0 {
                break;
            }
            let slot = &self.slots[cpu];
            if slot.owner != pid || !slot.guest.is_nobody() {
                continue;
            }
            if let Ok(outcome) = self.acquire(pid, cpu)
                && outcome.status.is_progress()
            {
                ncpus -= 1;
                batch.record(cpu, outcome);
            }
        }

        // Owned CPUs lent to someone else
        for &cpu in prio.owned() {
            if ncpus == 0 {
                break;
            }
            let slot = &self.slots[cpu];
            if slot.owner != pid || slot.guest == pid {
                continue;
            }
            if let Ok(outcome) = self.acquire(pid, cpu)
                && outcome.status.is_progress()
            {
                ncpus -= 1;
                batch.record(cpu, outcome);
            }
        }

        self.borrow_candidates(pid, prio.others(), &mut ncpus, &mut batch);

        // Owned CPUs are reclaimed on acquire, so only the others can be
        // waited for
        let allowed: CpuSet = prio.others().iter().copied().collect();
        if requested.is_some() && ncpus > 0 && self.queues_enabled() && !allowed.is_empty() {
            let queued = if prio.spans_node(self.system_size()) {
                trace_queued(pid, ncpus, "aggregate");
                self.aggregate.push(pid, ncpus)
            } else {
                trace_queued(pid, ncpus, "resource");
                self.requests.push(pid, ncpus, &allowed)
            };
            match queued {
                Ok(()) => batch.status = batch.status.merge(Status::Noted),
                Err(_) => batch.queue_full = true,
            }
        }

        if !batch.status.is_progress() {
            self.note_failed_borrow(pid);
        }
        batch
    }

    /// Borrow `requested` CPUs (`None`: as many as possible). Never queues.
    pub fn borrow_count(&mut self, pid: Pid, requested: Option<u32>) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        if requested == Some(0) || self.borrow_gave_up_since_last_lend(pid) {
            return batch;
        }
        let wanted = requested.unwrap_or(self.system_size() as u32);
        let Some(mut ncpus) = self.parallelism_budget(pid, wanted) else {
            return batch;
        };
        let prio = self.priority(pid);
        self.borrow_candidates(pid, prio.cpus(), &mut ncpus, &mut batch);
        if batch.status != Status::Success {
            self.note_failed_borrow(pid);
        }
        batch
    }

    pub fn borrow_mask(&mut self, pid: Pid, mask: &CpuSet) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        for cpu in mask.iter() {
            batch.record(cpu, self.borrow(pid, cpu));
        }
        batch
    }

    /// Borrow every CPU that is free right now, within the pid's maximum.
    pub fn borrow_all(&mut self, pid: Pid) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        let Some(mut ncpus) = self.parallelism_budget(pid, self.system_size() as u32) else {
            return batch;
        };
        let all: Vec<usize> = (0..self.system_size()).collect();
        for cpu in all {
            if ncpus == 0 {
                break;
            }
            let outcome = self.borrow(pid, cpu);
            if outcome.status == Status::Success {
                ncpus -= 1;
                batch.record(cpu, outcome);
            }
        }
        batch
    }

    pub fn return_mask(&mut self, pid: Pid, mask: &CpuSet) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        let size = self.system_size();
        for cpu in mask.iter().filter(|&cpu| cpu < size) {
            match self.return_cpu(pid, cpu) {
                Ok(outcome) => batch.record(cpu, outcome),
                Err(Error::Permission { .. }) => {
                    batch.denied.insert(cpu);
                }
                Err(_) => batch.queue_full = true,
            }
        }
        batch
    }

    pub fn return_all(&mut self, pid: Pid) -> BatchOutcome {
        let mask: CpuSet = (0..self.system_size())
            .filter(|&cpu| {
                let slot = &self.slots[cpu];
                slot.guest == pid && slot.owner != pid
            })
            .collect();
        self.return_mask(pid, &mask)
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    /// Claim `mask` for `pid`, optionally taking over `preinit_pid`'s record.
    pub fn register(
        &mut self,
        pid: Pid,
        preinit_pid: Pid,
        mask: &CpuSet,
        steal: bool,
        preinit: bool,
    ) -> Result<BatchOutcome> {
        if pid.is_nobody() {
            return Err(Error::NotRegistered(pid));
        }
        if let Some(cpu) = mask.iter().find(|&cpu| !self.in_range(cpu)) {
            return Err(Error::InvalidCpu(cpu));
        }
        if !steal
            && let Some(cpu) = mask.iter().find(|&cpu| {
                let owner = self.slots[cpu].owner;
                !owner.is_nobody() && owner != pid && owner != preinit_pid
            })
        {
            return Err(Error::Permission { pid, cpu });
        }

        let index = match (self.record_index(preinit_pid), self.record_index(pid)) {
            (Some(i), _) => i,
            (None, Some(i)) => i,
            (None, None) => self
                .records
                .iter()
                .position(|r| r.pid.is_nobody())
                .ok_or(Error::TooManyProcesses(MAX_PROCESSES))?,
        };
        let inherited = self.records[index].pid == preinit_pid && !preinit_pid.is_nobody();
        if self.records[index].pid != pid && !inherited {
            self.records[index] = ProcessRecord {
                pid,
                ..ProcessRecord::default()
            };
        }
        self.records[index].pid = pid;
        self.records[index].preinit = preinit as u32;

        if inherited {
            tracing::debug!(pid = %pid, preinit = %preinit_pid, "inheriting pre-registered mask");
            self.remove_requests(preinit_pid);
            for cpu in 0..self.system_size() {
                if self.slots[cpu].owner == preinit_pid {
                    self.slots[cpu].owner = pid;
                }
                if self.slots[cpu].guest == preinit_pid {
                    self.slots[cpu].guest = pid;
                }
            }
        }

        let mut batch = BatchOutcome::new();
        batch.status = Status::Success;
        for cpu in mask.iter() {
            let previous = self.slots[cpu].owner;
            if !previous.is_nobody() && previous != pid {
                tracing::info!(pid = %pid, cpu = cpu, previous = %previous, "stealing CPU ownership");
            }
            self.set_owner(cpu, pid);
            self.set_state(cpu, SlotState::Busy);
            let guest = self.slots[cpu].guest;
            if guest.is_nobody() {
                self.set_guest(cpu, pid);
                batch.record(cpu, Outcome::new(Status::Success, Some(pid), None));
            } else if guest != pid {
                batch.record(cpu, Outcome::new(Status::Success, Some(pid), Some(guest)));
            }
        }
        self.records[index].owned = self.owned_mask(pid);
        self.touch(pid);
        Ok(batch)
    }

    /// Release everything `pid` holds and free its record.
    pub fn deregister(&mut self, pid: Pid) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        batch.status = Status::Success;
        self.remove_requests(pid);

        let mut freed = CpuSet::new();
        for cpu in 0..self.system_size() {
            let slot = &self.slots[cpu];
            if slot.owner == pid {
                if self.opts.public_post_mortem {
                    if let Ok(outcome) = self.lend(pid, cpu, false) {
                        batch.record(cpu, outcome);
                    }
                } else {
                    let guest = slot.guest;
                    self.set_state(cpu, SlotState::Disabled);
                    if guest == pid {
                        self.set_guest(cpu, Pid::NOBODY);
                    } else if !guest.is_nobody() {
                        batch.record(cpu, Outcome::new(Status::Success, None, Some(guest)));
                    }
                }
                self.set_owner(cpu, Pid::NOBODY);
                freed.insert(cpu);
            } else if slot.guest == pid {
                let new_guest = self.release(pid, cpu, false);
                batch.record(cpu, Outcome::new(Status::Success, new_guest, None));
                freed.insert(cpu);
            }
        }
        self.distribute_free(&freed, &mut batch);
        if self.any_free(&freed) {
            self.mark_free();
        }
        if let Some(i) = self.record_index(pid) {
            self.records[i] = ProcessRecord::default();
        }
        batch
    }

    /// Reclaim every owned CPU, give away every guested one, drop requests.
    pub fn reset(&mut self, pid: Pid) -> BatchOutcome {
        let mut batch = BatchOutcome::new();
        batch.status = Status::Success;
        self.remove_requests(pid);

        let mut freed = CpuSet::new();
        for cpu in 0..self.system_size() {
            let slot = &self.slots[cpu];
            if slot.owner == pid {
                if let Ok(outcome) = self.reclaim(pid, cpu) {
                    batch.record(cpu, outcome);
                }
            } else if slot.guest == pid {
                let new_guest = self.release(pid, cpu, false);
                batch.record(cpu, Outcome::new(Status::Success, new_guest, Some(pid)));
                freed.insert(cpu);
            }
        }
        self.distribute_free(&freed, &mut batch);
        if self.any_free(&freed) {
            self.mark_free();
        }
        batch
    }

    /// Keep at most `max` CPUs for `pid` (owned ones first), lending or
    /// giving away the rest. Zero lifts the limit.
    pub fn update_max_parallelism(&mut self, pid: Pid, max: u32) -> Result<BatchOutcome> {
        let index = self.record_index(pid).ok_or(Error::NotRegistered(pid))?;
        self.records[index].max_parallelism = max;

        let mut batch = BatchOutcome::new();
        batch.status = Status::Success;
        if max == 0 {
            return Ok(batch);
        }

        let mut kept = 0u32;
        let mut guested = Vec::new();
        let mut freed = CpuSet::new();
        for cpu in 0..self.system_size() {
            let slot = &self.slots[cpu];
            if slot.owner == pid {
                kept += 1;
                if kept > max {
                    let was_guest = slot.guest == pid;
                    if let Ok(outcome) = self.lend(pid, cpu, false) {
                        let victim = was_guest.then_some(pid);
                        batch.record(cpu, Outcome { victim, ..outcome });
                        freed.insert(cpu);
                    }
                }
            } else if slot.guest == pid {
                guested.push(cpu);
            }
        }
        for cpu in guested {
            kept += 1;
            if kept > max {
                let new_guest = self.release(pid, cpu, false);
                batch.record(cpu, Outcome::new(Status::Success, new_guest, Some(pid)));
                freed.insert(cpu);
            }
        }
        self.distribute_free(&freed, &mut batch);
        if self.any_free(&freed) {
            self.mark_free();
        }
        Ok(batch)
    }

    /// Make `mask` the exact set of CPUs owned by `pid`.
    pub fn update_ownership(&mut self, pid: Pid, mask: &CpuSet) -> Result<BatchOutcome> {
        if self.record_index(pid).is_none() {
            return Err(Error::NotRegistered(pid));
        }
        let mut batch = BatchOutcome::new();
        for cpu in 0..self.system_size() {
            let slot = &self.slots[cpu];
            if mask.contains(cpu) {
                if slot.owner != pid {
                    let guest = slot.guest;
                    self.set_owner(cpu, pid);
                    self.set_state(cpu, SlotState::Busy);
                    if guest.is_nobody() {
                        self.set_guest(cpu, pid);
                        batch.record(cpu, Outcome::new(Status::Success, Some(pid), None));
                    } else if guest != pid {
                        batch.record(cpu, Outcome::new(Status::Noted, Some(pid), Some(guest)));
                    } else {
                        batch.status = batch.status.merge(Status::Success);
                    }
                }
            } else if slot.owner == pid {
                let was_guest = slot.guest == pid;
                self.set_owner(cpu, Pid::NOBODY);
                self.set_state(cpu, SlotState::Disabled);
                if was_guest {
                    self.set_guest(cpu, Pid::NOBODY);
                }
                batch.record(cpu, Outcome::new(Status::Success, None, was_guest.then_some(pid)));
            } else if slot.guest == pid && slot.state == SlotState::Busy {
                // Stolen or reclaimed while we were running on it
                if let Ok(outcome) = self.return_cpu(pid, cpu) {
                    batch.record(cpu, Outcome { victim: Some(pid), ..outcome });
                }
            }
        }
        self.touch(pid);
        Ok(batch)
    }

    /// Whether `pid` may run on `cpu` now, taking it if it is free.
    pub fn check_cpu_availability(&mut self, pid: Pid, cpu: usize) -> Result<Status> {
        if !self.in_range(cpu) {
            return Err(Error::Permission { pid, cpu });
        }
        let slot = &self.slots[cpu];
        let disabled = slot.state == SlotState::Disabled && self.opts.respect_cpuset;
        if slot.owner != pid && (slot.state == SlotState::Busy || disabled) {
            return Err(Error::Permission { pid, cpu });
        }
        if slot.guest == pid {
            return Ok(Status::Success);
        }
        if slot.guest.is_nobody() {
            if slot.owner == pid {
                self.set_state(cpu, SlotState::Busy);
            }
            self.set_guest(cpu, pid);
            return Ok(Status::Success);
        }
        if slot.owner == pid && slot.state == SlotState::Lent {
            return Ok(Status::NoUpdate);
        }
        Ok(Status::Noted)
    }

    // ------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<CpuSnapshot> {
        self.slots
            .iter()
            .enumerate()
            .map(|(cpu, slot)| slot.snapshot(cpu))
            .collect()
    }

    /// CPUs a thread of `pid` may bind to, in binding order: owned CPUs the
    /// owner has claimed, then CPUs it guests.
    pub fn eligible_cpus(&self, pid: Pid) -> Vec<usize> {
        let owned = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.owner == pid && s.state == SlotState::Busy)
            .map(|(cpu, _)| cpu);
        let guested = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.guest == pid && !(s.owner == pid && s.state == SlotState::Busy))
            .map(|(cpu, _)| cpu);
        owned.chain(guested).collect()
    }

    /// Total CPUs waiting in the aggregate and per-resource queues.
    pub fn pending_total(&self) -> u64 {
        self.aggregate.total() as u64
            + self.requests.iter().map(|r| r.howmany as u64).sum::<u64>()
    }
}
