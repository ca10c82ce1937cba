//! # corelend
//!
//! Cross-process CPU lending on a single node.
//!
//! Processes sharing a machine attach to one shared-memory table that
//! records, for every CPU, which process owns it and which process is
//! running on it. Owners lend CPUs they are not using; other processes
//! acquire or borrow them and give them back when the owner reclaims.
//!
//! ## Features
//!
//! - **Shared ownership table**: one mmapped segment per node, one lock
//! - **Five verbs**: lend, reclaim, acquire, borrow, return, in single-CPU,
//!   count and mask forms
//! - **Request queues**: unsatisfied acquires are served as CPUs free up,
//!   with fair distribution across processes
//! - **Topology-aware candidates**: nearby-first, nearby-only or whole-socket
//!   spreading
//! - **Thread binding**: stable thread → CPU assignment as the usable set moves
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use corelend::prelude::*;
//!
//! let table = CpuTable::attach(&Config::from_env())?;
//! let me = Pid::current();
//! table.register(me, None, &CpuSet::first_n(4), false)?;
//!
//! // Idle for a while: let others use two of our CPUs
//! table.lend_cpus(me, 2)?;
//!
//! // Busy again
//! let batch = table.reclaim_all(me)?;
//! for t in &batch.transitions {
//!     // t.victim must leave t.cpu
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod binding;
pub mod clock;
pub mod config;
pub mod cpuinfo;
pub mod cpuset;
pub mod error;
pub mod observability;
pub mod pid;
pub mod policy;
pub mod queue;
pub mod shmem;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::binding::BindingResolver;
    pub use crate::config::Config;
    pub use crate::cpuinfo::{
        Affinity, BatchOutcome, CpuState, CpuTable, Outcome, Status, Topology, Transition,
    };
    pub use crate::cpuset::CpuSet;
    pub use crate::error::{Error, Result};
    pub use crate::pid::Pid;
    pub use crate::policy::{BalancePolicy, PolicyKind};
}

pub use config::Config;
pub use cpuinfo::{Affinity, BatchOutcome, CpuTable, Outcome, Status};
pub use cpuset::CpuSet;
pub use error::{Error, Result};
pub use pid::Pid;
