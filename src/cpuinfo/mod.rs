//! The node-wide CPU ownership table.
//!
//! Every process on the node attaches to the same [`CpuTable`]. Each CPU has
//! an owner (the process whose mask contains it), a guest (the process
//! currently running on it) and a state. Owners lend idle CPUs and reclaim
//! them; other processes acquire or borrow lent CPUs and return them.
//!
//! ```text
//!                 lend                 acquire/borrow
//!   ┌──────────┐ ─────► ┌──────────┐ ──────────────► ┌─────────────┐
//!   │ OwnedIdle│        │ LentIdle │                 │ LentGuested │
//!   └──────────┘ ◄───── └──────────┘ ◄────────────── └─────────────┘
//!        ▲       reclaim              return               │ reclaim
//!        │                                                 ▼
//!        │              return (handed to owner)     ┌───────────┐
//!        └────────────────────────────────────────── │ Reclaimed │
//!                                                    └───────────┘
//! ```
//!
//! Every operation runs under the segment lock and reports which processes
//! must start ([`Outcome::new_guest`]) or stop ([`Outcome::victim`]) running
//! on which CPU. Acting on those reports (waking threads, migrating them)
//! is left to the caller, see [`crate::binding`] and [`crate::policy`].
//!
//! # Example
//!
//! ```rust,ignore
//! use corelend::{Config, CpuSet, CpuTable, Pid};
//!
//! let table = CpuTable::attach(&Config::new().shm_key("job42").system_size(4))?;
//! let me = Pid::current();
//! table.register(me, None, &CpuSet::first_n(2), false)?;
//!
//! // Entering a blocking call: let others use CPU 1
//! table.lend_cpu(me, 1)?;
//! // Back: take it again, possibly evicting a guest
//! let outcome = table.reclaim_cpu(me, 1)?;
//! ```
//!
//! # Shared layout
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ TableHeader   queues flag, last-lend time     │
//! │ CpuSlot × system_size                         │
//! │ RequestQueue<1024>                            │
//! │ AggregateQueue<256>                           │
//! │ ProcessRecord × 256                           │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! An all-zero payload is a valid empty table.

mod outcome;
mod print;
mod priority;
mod protocol;
mod slot;

pub use outcome::{BatchOutcome, Outcome, Status, Transition};
pub use priority::{Affinity, CpuPriority, Topology};
pub use protocol::{AGGREGATE_QUEUE_CAPACITY, MAX_PROCESSES, REQUEST_QUEUE_CAPACITY};
pub use slot::{CpuSnapshot, CpuState, CpuUsage, PENDING_CAPACITY, StatsState};

use crate::clock::Timestamp;
use crate::config::Config;
use crate::cpuset::{CpuSet, MAX_CPUS};
use crate::error::{Error, Result};
use crate::observability::{
    Operation, TableMetrics, instrument_operation, record_pending_requests,
};
use crate::pid::Pid;
use crate::shmem::{Segment, SegmentSpec};
use protocol::{
    Aggregate, Negotiator, Options, ProcessRecord, Requests, TableHeader,
};
use slot::CpuSlot;
use std::alloc::Layout;
use std::path::Path;
use std::ptr::NonNull;

/// Module name used in the segment file name.
const MODULE: &str = "cpuinfo";

/// Version of the payload layout below.
pub const DATA_VERSION: u32 = 1;

/// Byte offsets of each section in the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TableLayout {
    slots: usize,
    requests: usize,
    aggregate: usize,
    records: usize,
    size: usize,
    system_size: usize,
}

impl TableLayout {
    fn new(system_size: usize) -> Result<Self> {
        if system_size == 0 || system_size > MAX_CPUS {
            return Err(Error::InvalidCpu(system_size));
        }
        let invalid = |_| Error::InvalidCpu(system_size);
        let layout = Layout::new::<TableHeader>();
        let (layout, slots) = layout
            .extend(Layout::array::<CpuSlot>(system_size).map_err(invalid)?)
            .map_err(invalid)?;
        let (layout, requests) = layout
            .extend(Layout::new::<Requests>())
            .map_err(invalid)?;
        let (layout, aggregate) = layout
            .extend(Layout::new::<Aggregate>())
            .map_err(invalid)?;
        let (layout, records) = layout
            .extend(Layout::array::<ProcessRecord>(MAX_PROCESSES).map_err(invalid)?)
            .map_err(invalid)?;
        Ok(Self {
            slots,
            requests,
            aggregate,
            records,
            size: layout.pad_to_align().size(),
            system_size,
        })
    }

    /// Borrow every section of the payload at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a 64-byte aligned payload of at least `self.size`
    /// bytes laid out by this layout, and the caller must have exclusive
    /// access to it for `'a` (the segment lock, or init before publication).
    unsafe fn parts<'a>(&self, base: NonNull<u8>) -> Parts<'a> {
        let base = base.as_ptr();
        // SAFETY: offsets come from Layout::extend so every section is in
        // bounds and aligned; zero bytes are valid for every type stored and
        // the segment is only written through these types.
        unsafe {
            Parts {
                header: &mut *base.cast::<TableHeader>(),
                slots: std::slice::from_raw_parts_mut(
                    base.add(self.slots).cast::<CpuSlot>(),
                    self.system_size,
                ),
                requests: &mut *base.add(self.requests).cast::<Requests>(),
                aggregate: &mut *base.add(self.aggregate).cast::<Aggregate>(),
                records: std::slice::from_raw_parts_mut(
                    base.add(self.records).cast::<ProcessRecord>(),
                    MAX_PROCESSES,
                ),
            }
        }
    }
}

struct Parts<'a> {
    header: &'a mut TableHeader,
    slots: &'a mut [CpuSlot],
    requests: &'a mut Requests,
    aggregate: &'a mut Aggregate,
    records: &'a mut [ProcessRecord],
}

/// Handle on the node-wide CPU table.
///
/// Operations take the pid they act for explicitly, so one handle can serve
/// every thread of a process. The handle is `Send + Sync`.
pub struct CpuTable {
    segment: Segment,
    layout: TableLayout,
    config: Config,
    topology: Topology,
    metrics: TableMetrics,
    key: String,
}

impl CpuTable {
    /// Attach to (creating if needed) the table described by `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCpu`] if `system_size` is zero or too large.
    /// - Any error of [`Segment::attach`], e.g. [`Error::VersionMismatch`] if
    ///   the segment was created by an incompatible build.
    pub fn attach(config: &Config) -> Result<Self> {
        let layout = TableLayout::new(config.system_size)?;
        let key = config.effective_key();
        let spec = SegmentSpec::new(
            config.shm_dir.clone(),
            MODULE,
            key.clone(),
            DATA_VERSION,
            layout.size,
            config.system_size,
        )
        .timeout(config.lock_timeout);

        let segment = Segment::attach(&spec, |payload| {
            let now = Timestamp::now();
            // SAFETY: init runs once, before the segment is published, on a
            // zero-filled payload of `layout.size` bytes.
            let parts = unsafe { layout.parts(payload) };
            parts.header.initial_time = now;
            for slot in parts.slots.iter_mut() {
                slot.last_update = now;
            }
        })?;

        let table = Self {
            segment,
            layout,
            config: config.clone(),
            topology: Topology::flat(config.system_size),
            metrics: TableMetrics::new(&key),
            key,
        };
        if config.request_queues {
            table.enable_request_queues();
        }
        tracing::debug!(
            key = %table.key,
            system_size = config.system_size,
            path = %table.segment.path().display(),
            "attached CPU table"
        );
        Ok(table)
    }

    /// Use `topology` for nearby-CPU decisions instead of a single socket.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Remove a table's segment file regardless of who is attached.
    pub fn destroy(config: &Config) -> Result<()> {
        let spec = SegmentSpec::new(
            config.shm_dir.clone(),
            MODULE,
            config.effective_key(),
            DATA_VERSION,
            0,
            config.system_size,
        );
        Segment::destroy(&spec)
    }

    /// Drop this handle. Returns `true` if it was the last one attached, in
    /// which case the segment file is gone.
    pub fn detach(mut self) -> Result<bool> {
        self.segment.detach()
    }

    /// Number of CPUs in the table.
    pub fn system_size(&self) -> usize {
        self.layout.system_size
    }

    /// Configuration this handle was attached with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Socket layout in use.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Segment key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    fn options(&self) -> Options {
        Options {
            respect_cpuset: self.config.respect_cpuset,
            public_post_mortem: self.config.public_post_mortem,
            cpu_stats: self.config.cpu_stats,
            affinity: self.config.affinity,
        }
    }

    fn with_locked<R>(&self, f: impl FnOnce(&mut Negotiator<'_>) -> R) -> R {
        let _guard = self.segment.lock();
        // SAFETY: attach validated that the segment holds `layout.size`
        // bytes for this system size, and the lock is held until `_guard`
        // drops, after `f` and every borrow it made are gone.
        let parts = unsafe { self.layout.parts(self.segment.data_ptr()) };
        let mut negotiator = Negotiator {
            header: parts.header,
            slots: parts.slots,
            requests: parts.requests,
            aggregate: parts.aggregate,
            records: parts.records,
            opts: self.options(),
            topology: &self.topology,
            now: Timestamp::now(),
        };
        f(&mut negotiator)
    }

    fn run_single(
        &self,
        op: Operation,
        pid: Pid,
        f: impl FnOnce(&mut Negotiator<'_>) -> Result<Outcome>,
    ) -> Result<Outcome> {
        let _span = instrument_operation(op, pid);
        let _timer = self.metrics.start_timer();
        let outcome = self.with_locked(f);
        match &outcome {
            Ok(o) if o.new_guest.is_some() || o.victim.is_some() => self.metrics.record(op, 1),
            Ok(o) if o.status == Status::Noted && op == Operation::Acquire => {
                self.metrics.record_queued()
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "operation refused"),
        }
        outcome
    }

    fn run_batch(
        &self,
        op: Operation,
        pid: Pid,
        f: impl FnOnce(&mut Negotiator<'_>) -> Result<BatchOutcome>,
    ) -> Result<BatchOutcome> {
        let _span = instrument_operation(op, pid);
        let _timer = self.metrics.start_timer();
        let (batch, pending) = self.with_locked(|n| {
            let batch = f(n);
            (batch, n.pending_total())
        });
        let batch = batch?;
        self.metrics.record_batch(op, &batch);
        record_pending_requests(&self.key, pending);
        if batch.queue_full {
            tracing::warn!(pid = %pid, op = op.as_str(), "request queue full, request dropped");
        }
        Ok(batch)
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    /// Register `pid` as owner of `mask`.
    ///
    /// With `preinit_pid`, the record and CPUs pre-registered under that pid
    /// are taken over. With `steal`, CPUs owned by other processes change
    /// hands; their current guests are reported as victims.
    ///
    /// # Errors
    ///
    /// - [`Error::Permission`] if a CPU of `mask` has another owner and
    ///   `steal` is false. Nothing is claimed in that case.
    /// - [`Error::InvalidCpu`] if `mask` holds an id beyond the node.
    /// - [`Error::TooManyProcesses`] if every record is taken.
    pub fn register(
        &self,
        pid: Pid,
        preinit_pid: Option<Pid>,
        mask: &CpuSet,
        steal: bool,
    ) -> Result<BatchOutcome> {
        self.run_batch(Operation::Admin, pid, |n| {
            n.register(pid, preinit_pid.into(), mask, steal, false)
        })
    }

    /// Register `mask` ahead of time for a process not started yet.
    ///
    /// The launched process passes `pid` as its `preinit_pid` to
    /// [`CpuTable::register`].
    pub fn preinit(&self, pid: Pid, mask: &CpuSet, steal: bool) -> Result<BatchOutcome> {
        self.run_batch(Operation::Admin, pid, |n| {
            n.register(pid, Pid::NOBODY, mask, steal, true)
        })
    }

    /// Release everything `pid` owns or guests and free its record.
    ///
    /// Owned CPUs become disabled, or stay lent to everyone when
    /// `public_post_mortem` is set.
    pub fn deregister(&self, pid: Pid) -> Result<BatchOutcome> {
        self.run_batch(Operation::Admin, pid, |n| Ok(n.deregister(pid)))
    }

    /// Bring `pid` back to its registered mask: reclaim every owned CPU, give
    /// back every guested one and drop its requests.
    pub fn reset(&self, pid: Pid) -> Result<BatchOutcome> {
        self.run_batch(Operation::Admin, pid, |n| Ok(n.reset(pid)))
    }

    /// Make `mask` the exact set of CPUs `pid` owns.
    pub fn update_ownership(&self, pid: Pid, mask: &CpuSet) -> Result<BatchOutcome> {
        self.run_batch(Operation::Admin, pid, |n| n.update_ownership(pid, mask))
    }

    /// Limit `pid` to `max` CPUs, lending or returning the excess. Zero
    /// removes the limit.
    pub fn update_max_parallelism(&self, pid: Pid, max: u32) -> Result<BatchOutcome> {
        self.run_batch(Operation::Admin, pid, |n| n.update_max_parallelism(pid, max))
    }

    // ------------------------------------------------------------------
    // Lend
    // ------------------------------------------------------------------

    /// Lend one owned CPU.
    ///
    /// # Errors
    ///
    /// [`Error::Permission`] if `pid` does not own `cpu`.
    pub fn lend_cpu(&self, pid: Pid, cpu: usize) -> Result<Outcome> {
        self.run_single(Operation::Lend, pid, |n| n.lend(pid, cpu, true))
    }

    /// Lend up to `count` owned CPUs, highest ids first.
    pub fn lend_cpus(&self, pid: Pid, count: u32) -> Result<BatchOutcome> {
        self.run_batch(Operation::Lend, pid, |n| Ok(n.lend_count(pid, count)))
    }

    /// Lend the CPUs of `mask`. CPUs `pid` does not own land in `denied`.
    pub fn lend_cpu_mask(&self, pid: Pid, mask: &CpuSet) -> Result<BatchOutcome> {
        self.run_batch(Operation::Lend, pid, |n| Ok(n.lend_mask(pid, mask)))
    }

    /// Lend every owned CPU.
    pub fn lend_all(&self, pid: Pid) -> Result<BatchOutcome> {
        self.run_batch(Operation::Lend, pid, |n| {
            let owned = n.owned_mask(pid);
            Ok(n.lend_mask(pid, &owned))
        })
    }

    // ------------------------------------------------------------------
    // Reclaim
    // ------------------------------------------------------------------

    /// Take an owned CPU back. A guest still running on it is reported as
    /// victim and the status is `Noted`.
    ///
    /// # Errors
    ///
    /// [`Error::Permission`] if `pid` does not own `cpu`.
    pub fn reclaim_cpu(&self, pid: Pid, cpu: usize) -> Result<Outcome> {
        self.run_single(Operation::Reclaim, pid, |n| n.reclaim(pid, cpu))
    }

    /// Reclaim up to `count` owned CPUs currently not in use by `pid`.
    pub fn reclaim_cpus(&self, pid: Pid, count: u32) -> Result<BatchOutcome> {
        self.run_batch(Operation::Reclaim, pid, |n| Ok(n.reclaim_count(pid, count)))
    }

    /// Reclaim the CPUs of `mask`. CPUs `pid` does not own land in `denied`.
    pub fn reclaim_cpu_mask(&self, pid: Pid, mask: &CpuSet) -> Result<BatchOutcome> {
        self.run_batch(Operation::Reclaim, pid, |n| Ok(n.reclaim_mask(pid, mask)))
    }

    /// Reclaim every owned CPU not in use by `pid`.
    pub fn reclaim_all(&self, pid: Pid) -> Result<BatchOutcome> {
        self.run_batch(Operation::Reclaim, pid, |n| Ok(n.reclaim_all(pid)))
    }

    // ------------------------------------------------------------------
    // Acquire
    // ------------------------------------------------------------------

    /// Ask for one CPU: reclaim it if owned, take it if free, otherwise
    /// queue on it (status `Noted`) when request queues are enabled.
    ///
    /// # Errors
    ///
    /// - [`Error::Permission`] if `cpu` is disabled (or outside the node).
    /// - [`Error::QueueFull`] if its waiter queue is full.
    pub fn acquire_cpu(&self, pid: Pid, cpu: usize) -> Result<Outcome> {
        self.run_single(Operation::Acquire, pid, |n| n.acquire(pid, cpu))
    }

    /// Ask for `count` CPUs, or as many as possible with `None`.
    ///
    /// Owned CPUs come first, then the candidates of the configured
    /// [`Affinity`]. With `Some(count)` the shortfall is queued when request
    /// queues are enabled; `Some(0)` cancels every outstanding request.
    pub fn acquire_cpus(&self, pid: Pid, count: Option<u32>) -> Result<BatchOutcome> {
        self.run_batch(Operation::Acquire, pid, |n| Ok(n.acquire_count(pid, count)))
    }

    /// [`CpuTable::acquire_cpu`] over a mask. An empty mask cancels every
    /// outstanding request.
    pub fn acquire_cpu_mask(&self, pid: Pid, mask: &CpuSet) -> Result<BatchOutcome> {
        self.run_batch(Operation::Acquire, pid, |n| Ok(n.acquire_mask(pid, mask)))
    }

    // ------------------------------------------------------------------
    // Borrow
    // ------------------------------------------------------------------

    /// Take one CPU if it is free right now. Never queues.
    pub fn borrow_cpu(&self, pid: Pid, cpu: usize) -> Result<Outcome> {
        self.run_single(Operation::Borrow, pid, |n| Ok(n.borrow(pid, cpu)))
    }

    /// Take up to `count` free CPUs (all of them with `None`).
    pub fn borrow_cpus(&self, pid: Pid, count: Option<u32>) -> Result<BatchOutcome> {
        self.run_batch(Operation::Borrow, pid, |n| Ok(n.borrow_count(pid, count)))
    }

    /// Take the free CPUs of `mask`.
    pub fn borrow_cpu_mask(&self, pid: Pid, mask: &CpuSet) -> Result<BatchOutcome> {
        self.run_batch(Operation::Borrow, pid, |n| Ok(n.borrow_mask(pid, mask)))
    }

    /// Take every free CPU, ignoring affinity.
    pub fn borrow_all(&self, pid: Pid) -> Result<BatchOutcome> {
        self.run_batch(Operation::Borrow, pid, |n| Ok(n.borrow_all(pid)))
    }

    // ------------------------------------------------------------------
    // Return
    // ------------------------------------------------------------------

    /// Stop running on a CPU `pid` guests but does not own. The CPU is handed
    /// to its owner if reclaimed, otherwise to the next waiter.
    ///
    /// # Errors
    ///
    /// [`Error::Permission`] if someone else runs on a CPU that is not lent.
    pub fn return_cpu(&self, pid: Pid, cpu: usize) -> Result<Outcome> {
        self.run_single(Operation::Return, pid, |n| n.return_cpu(pid, cpu))
    }

    /// Return the CPUs of `mask`.
    pub fn return_cpu_mask(&self, pid: Pid, mask: &CpuSet) -> Result<BatchOutcome> {
        self.run_batch(Operation::Return, pid, |n| Ok(n.return_mask(pid, mask)))
    }

    /// Return every CPU `pid` guests without owning it.
    pub fn return_all(&self, pid: Pid) -> Result<BatchOutcome> {
        self.run_batch(Operation::Return, pid, |n| Ok(n.return_all(pid)))
    }

    // ------------------------------------------------------------------
    // Queries and maintenance
    // ------------------------------------------------------------------

    /// Check whether `pid` may keep running on `cpu`, taking it if free.
    ///
    /// `Success`: go ahead. `NoUpdate`: it is lent out. `Noted`: it was
    /// reclaimed and the guest has not left yet.
    ///
    /// # Errors
    ///
    /// [`Error::Permission`] if someone else owns it and is using it.
    pub fn check_cpu_availability(&self, pid: Pid, cpu: usize) -> Result<Status> {
        let _span = instrument_operation(Operation::Admin, pid);
        self.with_locked(|n| n.check_cpu_availability(pid, cpu))
    }

    /// Withdraw every queued request of `pid`.
    pub fn remove_requests(&self, pid: Pid) -> bool {
        let _span = instrument_operation(Operation::Admin, pid);
        self.with_locked(|n| n.remove_requests(pid))
    }

    /// Turn request queueing on for every process of the table.
    pub fn enable_request_queues(&self) {
        self.with_locked(|n| n.header.request_queues = 1);
    }

    /// Whether request queueing is on.
    pub fn request_queues_enabled(&self) -> bool {
        self.with_locked(|n| n.queues_enabled())
    }

    /// Copy of every CPU record.
    pub fn snapshot(&self) -> Vec<CpuSnapshot> {
        self.with_locked(|n| n.snapshot())
    }

    /// Derived state of one CPU.
    pub fn cpu_state(&self, cpu: usize) -> Option<CpuState> {
        self.with_locked(|n| n.slots.get(cpu).map(|s| s.cpu_state()))
    }

    /// Owner of one CPU.
    pub fn owner(&self, cpu: usize) -> Option<Pid> {
        self.with_locked(|n| n.slots.get(cpu).and_then(|s| s.owner.get()))
    }

    /// Guest of one CPU.
    pub fn guest(&self, cpu: usize) -> Option<Pid> {
        self.with_locked(|n| n.slots.get(cpu).and_then(|s| s.guest.get()))
    }

    /// CPUs owned by `pid`.
    pub fn owned_cpus(&self, pid: Pid) -> CpuSet {
        self.with_locked(|n| n.owned_mask(pid))
    }

    /// CPUs `pid` runs on.
    pub fn guested_cpus(&self, pid: Pid) -> CpuSet {
        self.with_locked(|n| n.guested_mask(pid))
    }

    /// Candidate ordering `pid` would use for a count-based request.
    pub fn priority(&self, pid: Pid) -> CpuPriority {
        self.with_locked(|n| n.priority(pid))
    }

    /// Whether `pid` still has a process record.
    pub fn is_registered(&self, pid: Pid) -> bool {
        self.with_locked(|n| n.record(pid).is_some())
    }

    /// CPUs `pid`'s threads may bind to, in order, and the record's
    /// generation they were read at.
    ///
    /// # Errors
    ///
    /// [`Error::NotRegistered`] if `pid` has no record.
    pub fn eligible_cpus(&self, pid: Pid) -> Result<(Vec<usize>, u64)> {
        self.with_locked(|n| {
            let generation = n.record(pid).ok_or(Error::NotRegistered(pid))?.generation;
            Ok((n.eligible_cpus(pid), generation))
        })
    }

    /// Generation of `pid`'s record; moves whenever the CPUs usable by `pid`
    /// change.
    pub fn generation(&self, pid: Pid) -> Option<u64> {
        self.with_locked(|n| n.record(pid).map(|r| r.generation))
    }

    /// Fraction of time `cpu` spent idle, owned and guested. `None` until
    /// stats have accumulated.
    pub fn cpu_usage(&self, cpu: usize) -> Option<CpuUsage> {
        self.with_locked(|n| n.slots.get(cpu).and_then(|s| s.usage()))
    }

    /// Time the table was created.
    pub fn initial_time(&self) -> Timestamp {
        self.with_locked(|n| n.header.initial_time)
    }

    /// Render the table, the queues and (with `cpu_stats`) usage as text.
    pub fn print_info(&self) -> String {
        let report = self.with_locked(|n| print::Report {
            cpus: n.snapshot(),
            usage: self
                .config
                .cpu_stats
                .then(|| n.slots.iter().map(|s| s.usage()).collect()),
            aggregate: n.aggregate.iter().copied().collect(),
            requests: n.requests.iter().copied().collect(),
        });
        print::render(&report)
    }
}

impl std::fmt::Debug for CpuTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuTable")
            .field("key", &self.key)
            .field("system_size", &self.layout.system_size)
            .field("segment", &self.segment)
            .finish_non_exhaustive()
    }
}
