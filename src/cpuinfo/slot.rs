//! Per-CPU record stored in the shared segment.

use crate::clock::Timestamp;
use crate::pid::Pid;
use crate::queue::PidQueue;
use std::fmt;

/// Waiters a single CPU can queue.
pub const PENDING_CAPACITY: usize = 8;

/// Raw slot state. Zero (`Disabled`) is the state of a fresh segment.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Not part of any registered mask.
    #[default]
    Disabled = 0,
    /// In use by, or claimed back by, its owner.
    Busy = 1,
    /// Lent by its owner (or public after the owner finalized).
    Lent = 2,
}

/// What a CPU's time is being accounted to.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatsState {
    /// Nobody runs on it.
    #[default]
    Idle = 0,
    /// Its owner runs on it.
    Owned = 1,
    /// A guest runs on it.
    Guested = 2,
}

/// Negotiation state of a CPU as seen by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuState {
    /// Owned and used by its owner (or unused), nothing on loan.
    OwnedIdle,
    /// Lent by its owner, nobody runs on it.
    LentIdle,
    /// Lent by its owner, a guest runs on it.
    LentGuested,
    /// Its owner asked for it back while a guest still runs on it.
    Reclaimed,
    /// Outside every registered mask.
    Disabled,
}

impl fmt::Display for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            CpuState::OwnedIdle => "busy",
            CpuState::LentIdle => "idle",
            CpuState::LentGuested => "lent",
            CpuState::Reclaimed => "recl",
            CpuState::Disabled => "off",
        })
    }
}

/// Fraction of time a CPU spent in each [`StatsState`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuUsage {
    /// Fraction of time with nobody running.
    pub idle: f32,
    /// Fraction of time used by its owner.
    pub owned: f32,
    /// Fraction of time used by a guest.
    pub guested: f32,
}

/// Copy of one CPU's shared record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuSnapshot {
    /// CPU id.
    pub cpu: usize,
    /// Current owner.
    pub owner: Option<Pid>,
    /// Current guest.
    pub guest: Option<Pid>,
    /// Derived state.
    pub state: CpuState,
    /// Pids waiting for this CPU, oldest first.
    pub pending: Vec<Pid>,
}

/// One CPU in the shared table.
#[repr(C)]
#[derive(Default)]
pub(crate) struct CpuSlot {
    pub owner: Pid,
    pub guest: Pid,
    pub state: SlotState,
    pub stats_state: StatsState,
    pub acc_time: [u64; 3],
    pub last_update: Timestamp,
    pub pending: PidQueue<PENDING_CAPACITY>,
}

impl CpuSlot {
    pub fn cpu_state(&self) -> CpuState {
        match self.state {
            SlotState::Disabled => CpuState::Disabled,
            SlotState::Lent if self.guest.is_nobody() => CpuState::LentIdle,
            SlotState::Lent => CpuState::LentGuested,
            SlotState::Busy if !self.guest.is_nobody() && self.guest != self.owner => {
                CpuState::Reclaimed
            }
            SlotState::Busy => CpuState::OwnedIdle,
        }
    }

    /// Lent and nobody is using it.
    pub fn is_free(&self) -> bool {
        self.state == SlotState::Lent && self.guest.is_nobody()
    }

    pub fn snapshot(&self, cpu: usize) -> CpuSnapshot {
        CpuSnapshot {
            cpu,
            owner: self.owner.get(),
            guest: self.guest.get(),
            state: self.cpu_state(),
            pending: self.pending.iter().collect(),
        }
    }

    /// Close the current accounting interval and start one in `next`.
    pub fn account(&mut self, next: StatsState, now: Timestamp) {
        if !self.last_update.is_zero() {
            let elapsed = now.duration_since(self.last_update).as_nanos() as u64;
            self.acc_time[self.stats_state as usize] += elapsed;
        }
        self.stats_state = next;
        self.last_update = now;
    }

    pub fn usage(&self) -> Option<CpuUsage> {
        let total: u64 = self.acc_time.iter().sum();
        if total == 0 {
            return None;
        }
        let frac = |s: StatsState| (self.acc_time[s as usize] as f64 / total as f64) as f32;
        Some(CpuUsage {
            idle: frac(StatsState::Idle),
            owned: frac(StatsState::Owned),
            guested: frac(StatsState::Guested),
        })
    }
}
