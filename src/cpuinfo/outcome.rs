//! Result types of negotiation operations.

use crate::cpuset::CpuSet;
use crate::pid::Pid;
use std::fmt;

/// How an operation left the table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Status {
    /// The requested transition happened.
    Success,
    /// Nothing needed to change.
    #[default]
    NoUpdate,
    /// The request was recorded and will complete later.
    Noted,
}

impl Status {
    fn rank(self) -> u8 {
        match self {
            Status::NoUpdate => 0,
            Status::Success => 1,
            Status::Noted => 2,
        }
    }

    /// Combine two per-CPU results into a batch result.
    ///
    /// `Noted` beats `Success`, which beats `NoUpdate`.
    #[must_use]
    pub fn merge(self, other: Status) -> Status {
        if other.rank() > self.rank() { other } else { self }
    }

    /// Whether the table changed or will change.
    pub fn is_progress(self) -> bool {
        self != Status::NoUpdate
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Success => "success",
            Status::NoUpdate => "noupdate",
            Status::Noted => "noted",
        })
    }
}

/// Result of a single-CPU operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Overall result.
    pub status: Status,
    /// Process that now runs (or should start running) on the CPU.
    pub new_guest: Option<Pid>,
    /// Process that must stop running on the CPU.
    pub victim: Option<Pid>,
}

impl Outcome {
    /// Nothing happened.
    pub const NO_UPDATE: Outcome = Outcome {
        status: Status::NoUpdate,
        new_guest: None,
        victim: None,
    };

    /// Request recorded, nothing moved yet.
    pub const NOTED: Outcome = Outcome {
        status: Status::Noted,
        new_guest: None,
        victim: None,
    };

    /// Transition with optional guest changes.
    pub fn new(status: Status, new_guest: Option<Pid>, victim: Option<Pid>) -> Self {
        Self {
            status,
            new_guest,
            victim,
        }
    }

    /// Successful transition with no guest changes.
    pub fn success() -> Self {
        Self::new(Status::Success, None, None)
    }
}

/// A guest change on one CPU, reported so callers can act on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// CPU whose guest changed.
    pub cpu: usize,
    /// Process that should start running on it.
    pub new_guest: Option<Pid>,
    /// Process that should stop running on it.
    pub victim: Option<Pid>,
}

/// Result of a count, mask or bulk operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Merged status of every CPU touched.
    pub status: Status,
    /// Guest changes, in the order they happened.
    pub transitions: Vec<Transition>,
    /// CPUs of the request the caller had no right to touch.
    pub denied: CpuSet,
    /// A request could not be queued because its queue was full.
    pub queue_full: bool,
}

impl BatchOutcome {
    /// Empty batch (`NoUpdate`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a per-CPU outcome in.
    pub fn record(&mut self, cpu: usize, outcome: Outcome) {
        self.status = self.status.merge(outcome.status);
        if outcome.new_guest.is_some() || outcome.victim.is_some() {
            self.transitions.push(Transition {
                cpu,
                new_guest: outcome.new_guest,
                victim: outcome.victim,
            });
        }
    }

    /// Merge another batch into this one.
    pub fn extend(&mut self, other: BatchOutcome) {
        self.status = self.status.merge(other.status);
        self.transitions.extend(other.transitions);
        self.denied = self.denied.union(&other.denied);
        self.queue_full |= other.queue_full;
    }

    /// CPUs on which `pid` became guest.
    pub fn gained_by(&self, pid: Pid) -> CpuSet {
        self.transitions
            .iter()
            .filter(|t| t.new_guest == Some(pid))
            .map(|t| t.cpu)
            .collect()
    }

    /// CPUs `pid` must stop running on.
    pub fn lost_by(&self, pid: Pid) -> CpuSet {
        self.transitions
            .iter()
            .filter(|t| t.victim == Some(pid))
            .map(|t| t.cpu)
            .collect()
    }
}
