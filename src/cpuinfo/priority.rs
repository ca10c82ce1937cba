//! Candidate ordering for count-based acquire and borrow.
//!
//! A [`CpuPriority`] list always starts with the CPUs a process owns. What
//! follows depends on the [`Affinity`]:
//!
//! ```text
//! owned = {2,3}, sockets = [{0..3}, {4..7}]
//!
//!   Any            [2 3 | 0 1 4 5 6 7]
//!   NearbyFirst    [2 3 | 0 1 | 4 5 6 7]
//!   NearbyOnly     [2 3 | 0 1]
//!   SpreadIfEmpty  [2 3]            (+ whole free sockets at borrow time)
//! ```

use crate::cpuset::CpuSet;
use std::fmt;
use std::str::FromStr;

/// Which non-owned CPUs a process prefers when asking for more.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// Every CPU, in id order.
    Any,
    /// CPUs sharing a socket with owned ones, then the rest.
    #[default]
    NearbyFirst,
    /// Only CPUs sharing a socket with owned ones.
    NearbyOnly,
    /// Owned CPUs, then whole sockets that are entirely free.
    SpreadIfEmpty,
}

impl FromStr for Affinity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(Affinity::Any),
            "nearby-first" | "nearby_first" => Ok(Affinity::NearbyFirst),
            "nearby-only" | "nearby_only" => Ok(Affinity::NearbyOnly),
            "spread-ifempty" | "spread_ifempty" => Ok(Affinity::SpreadIfEmpty),
            other => Err(format!("unknown affinity '{}'", other)),
        }
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Affinity::Any => "any",
            Affinity::NearbyFirst => "nearby-first",
            Affinity::NearbyOnly => "nearby-only",
            Affinity::SpreadIfEmpty => "spread-ifempty",
        })
    }
}

/// Socket layout of the node, as masks of CPU ids.
///
/// Discovering it is left to the caller; [`Topology::flat`] treats the
/// whole node as one socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    sockets: Vec<CpuSet>,
}

impl Topology {
    /// Build from explicit socket masks. Empty masks are dropped.
    pub fn new(sockets: impl IntoIterator<Item = CpuSet>) -> Self {
        Self {
            sockets: sockets.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// One socket holding every CPU.
    pub fn flat(system_size: usize) -> Self {
        Self::new([CpuSet::first_n(system_size)])
    }

    /// `sockets` equally sized sockets of consecutive ids.
    pub fn uniform(system_size: usize, sockets: usize) -> Self {
        let sockets = sockets.max(1);
        let per_socket = system_size.div_ceil(sockets).max(1);
        Self::new((0..sockets).map(|s| {
            let start = s * per_socket;
            let end = (start + per_socket).min(system_size);
            (start..end).collect()
        }))
    }

    /// Socket masks.
    pub fn sockets(&self) -> &[CpuSet] {
        &self.sockets
    }

    /// Union of every socket that shares at least one CPU with `mask`.
    pub fn parents_covering(&self, mask: &CpuSet) -> CpuSet {
        self.sockets
            .iter()
            .filter(|s| s.intersects(mask))
            .fold(CpuSet::new(), |acc, s| acc.union(s))
    }

    /// Sockets lying entirely inside `mask`.
    pub fn parents_inside<'a>(&'a self, mask: &'a CpuSet) -> impl Iterator<Item = &'a CpuSet> {
        self.sockets.iter().filter(move |s| s.is_subset(mask))
    }
}

/// Ordered CPU candidates for one process: owned CPUs first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuPriority {
    cpus: Vec<usize>,
    owned: usize,
}

impl CpuPriority {
    /// Build the list for a process owning `owned`.
    pub fn build(
        owned: &CpuSet,
        topology: &Topology,
        affinity: Affinity,
        system_size: usize,
    ) -> Self {
        let nearby = topology.parents_covering(owned);
        let mut first = Vec::with_capacity(system_size);
        let mut second = Vec::new();
        let mut third = Vec::new();

        for cpu in 0..system_size {
            if owned.contains(cpu) {
                first.push(cpu);
                continue;
            }
            match affinity {
                Affinity::Any => second.push(cpu),
                Affinity::NearbyFirst if nearby.contains(cpu) => second.push(cpu),
                Affinity::NearbyFirst => third.push(cpu),
                Affinity::NearbyOnly if nearby.contains(cpu) => second.push(cpu),
                Affinity::NearbyOnly | Affinity::SpreadIfEmpty => {}
            }
        }

        let owned_len = first.len();
        first.extend(second);
        first.extend(third);
        Self {
            cpus: first,
            owned: owned_len,
        }
    }

    /// Every candidate, in order.
    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    /// The owned prefix.
    pub fn owned(&self) -> &[usize] {
        &self.cpus[..self.owned]
    }

    /// Candidates after the owned prefix.
    pub fn others(&self) -> &[usize] {
        &self.cpus[self.owned..]
    }

    /// Candidates as a set.
    pub fn as_set(&self) -> CpuSet {
        self.cpus.iter().copied().collect()
    }

    /// Whether every CPU of the node is a candidate.
    pub fn spans_node(&self, system_size: usize) -> bool {
        self.cpus.len() >= system_size
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// Whether there are no candidates.
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }
}
