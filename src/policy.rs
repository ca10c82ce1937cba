//! Balancing policies driven by application events.
//!
//! A runtime calls the [`BalancePolicy`] hooks at well-known points (start,
//! iteration boundaries, blocking calls). The policy decides what to lend
//! or ask for and forwards it to the [`CpuTable`].
//!
//! - [`NoPolicy`]: every hook is a no-op
//! - [`LewiMask`]: lends the CPU a thread blocks on and takes it back
//!   afterwards
//!
//! # Example
//!
//! ```rust,ignore
//! use corelend::policy::{BalancePolicy, PolicyKind};
//!
//! let mut policy = config.policy.build(table.clone(), pid, mask);
//! policy.init()?;
//! policy.into_blocking_call()?;
//! // ... blocking I/O or communication ...
//! policy.out_of_blocking_call()?;
//! policy.finish()?;
//! ```

use crate::cpuinfo::{BatchOutcome, CpuPriority, CpuTable, Outcome, Status, Transition};
use crate::cpuset::CpuSet;
use crate::error::Result;
use crate::pid::Pid;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Event hooks of a balancing policy.
///
/// Every hook defaults to doing nothing and reporting [`Status::NoUpdate`].
pub trait BalancePolicy: Send {
    /// Policy name for logs.
    fn name(&self) -> &'static str;

    /// The process starts.
    fn init(&mut self) -> Result<Status> {
        Ok(Status::NoUpdate)
    }

    /// The process ends.
    fn finish(&mut self) -> Result<Status> {
        Ok(Status::NoUpdate)
    }

    /// An application iteration starts.
    fn init_iteration(&mut self) -> Result<Status> {
        Ok(Status::NoUpdate)
    }

    /// An application iteration ends.
    fn finish_iteration(&mut self) -> Result<Status> {
        Ok(Status::NoUpdate)
    }

    /// A communication phase starts.
    fn into_communication(&mut self) -> Result<Status> {
        Ok(Status::NoUpdate)
    }

    /// A communication phase ends.
    fn out_of_communication(&mut self) -> Result<Status> {
        Ok(Status::NoUpdate)
    }

    /// The calling thread is about to block.
    fn into_blocking_call(&mut self) -> Result<Status> {
        Ok(Status::NoUpdate)
    }

    /// The calling thread is back from a blocking call.
    fn out_of_blocking_call(&mut self) -> Result<Status> {
        Ok(Status::NoUpdate)
    }

    /// Ownership or topology changed; refresh cached state.
    fn update_resources(&mut self) -> Result<Status> {
        Ok(Status::NoUpdate)
    }
}

/// Policy variant chosen in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// [`NoPolicy`].
    #[default]
    None,
    /// [`LewiMask`].
    LewiMask,
}

impl PolicyKind {
    /// Instantiate the policy for `pid` owning `mask`.
    pub fn build(self, table: Arc<CpuTable>, pid: Pid, mask: CpuSet) -> Box<dyn BalancePolicy> {
        match self {
            PolicyKind::None => Box::new(NoPolicy),
            PolicyKind::LewiMask => Box::new(LewiMask::new(table, pid, mask)),
        }
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "no" => Ok(PolicyKind::None),
            "lewi-mask" | "lewi_mask" => Ok(PolicyKind::LewiMask),
            other => Err(format!("unknown policy '{}'", other)),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PolicyKind::None => "none",
            PolicyKind::LewiMask => "lewi-mask",
        })
    }
}

/// Policy that never touches the table.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPolicy;

impl BalancePolicy for NoPolicy {
    fn name(&self) -> &'static str {
        "none"
    }
}

/// Lend-when-idle policy over explicit CPU masks.
///
/// Tracks the CPUs the process may run on (`active`) from the transitions
/// every table call reports.
#[derive(Debug)]
pub struct LewiMask {
    table: Arc<CpuTable>,
    pid: Pid,
    mask: CpuSet,
    active: CpuSet,
    priority: CpuPriority,
    blocked_on: Option<usize>,
}

impl LewiMask {
    /// Create the policy; nothing is registered until [`BalancePolicy::init`].
    pub fn new(table: Arc<CpuTable>, pid: Pid, mask: CpuSet) -> Self {
        Self {
            table,
            pid,
            mask,
            active: CpuSet::new(),
            priority: CpuPriority::default(),
            blocked_on: None,
        }
    }

    /// CPUs the process may run on.
    pub fn active(&self) -> &CpuSet {
        &self.active
    }

    /// Candidate ordering for count-based requests.
    pub fn priority(&self) -> &CpuPriority {
        &self.priority
    }

    fn apply(&mut self, transitions: &[Transition]) {
        for t in transitions {
            if t.victim == Some(self.pid) {
                self.active.remove(t.cpu);
            }
            if t.new_guest == Some(self.pid) {
                self.active.insert(t.cpu);
            }
        }
    }

    fn apply_outcome(&mut self, cpu: usize, outcome: Outcome) -> Status {
        self.apply(&[Transition {
            cpu,
            new_guest: outcome.new_guest,
            victim: outcome.victim,
        }]);
        outcome.status
    }

    fn apply_batch(&mut self, batch: &BatchOutcome) -> Status {
        self.apply(&batch.transitions);
        batch.status
    }

    /// Give `cpu` away while the calling thread blocks on it: lend it if
    /// owned, return it otherwise.
    pub fn block_on(&mut self, cpu: usize) -> Result<Status> {
        let outcome = if self.table.owner(cpu) == Some(self.pid) {
            self.table.lend_cpu(self.pid, cpu)?
        } else {
            self.table.return_cpu(self.pid, cpu)?
        };
        if outcome.status != Status::NoUpdate {
            self.active.remove(cpu);
            self.blocked_on = Some(cpu);
        }
        Ok(self.apply_outcome(cpu, outcome))
    }

    /// Take back the CPU given away by [`LewiMask::block_on`].
    pub fn unblock(&mut self) -> Result<Status> {
        let Some(cpu) = self.blocked_on.take() else {
            return Ok(Status::NoUpdate);
        };
        let outcome = self.table.acquire_cpu(self.pid, cpu)?;
        Ok(self.apply_outcome(cpu, outcome))
    }
}

impl BalancePolicy for LewiMask {
    fn name(&self) -> &'static str {
        "lewi-mask"
    }

    fn init(&mut self) -> Result<Status> {
        let batch = self.table.register(self.pid, None, &self.mask, false)?;
        self.active = self.table.guested_cpus(self.pid);
        self.priority = self.table.priority(self.pid);
        tracing::info!(pid = %self.pid, mask = %self.mask, policy = self.name(), "policy initialized");
        Ok(self.apply_batch(&batch))
    }

    fn finish(&mut self) -> Result<Status> {
        let batch = self.table.deregister(self.pid)?;
        self.active = CpuSet::new();
        self.blocked_on = None;
        Ok(batch.status)
    }

    fn into_blocking_call(&mut self) -> Result<Status> {
        let cpu = rustix::thread::sched_getcpu();
        if cpu >= self.table.system_size() {
            return Ok(Status::NoUpdate);
        }
        self.block_on(cpu)
    }

    fn out_of_blocking_call(&mut self) -> Result<Status> {
        self.unblock()
    }

    fn update_resources(&mut self) -> Result<Status> {
        self.mask = self.table.owned_cpus(self.pid);
        self.priority = self.table.priority(self.pid);
        self.active = self.table.guested_cpus(self.pid);
        Ok(Status::Success)
    }
}
