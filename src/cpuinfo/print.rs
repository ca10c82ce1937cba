//! Human-readable dump of the table.

use super::slot::{CpuSnapshot, CpuUsage};
use crate::pid::Pid;
use crate::queue::{AggregateRequest, ResourceRequest};
use std::fmt::Write;

const COLUMNS: usize = 4;

/// Everything the dump shows, copied out under the lock.
pub(crate) struct Report {
    pub cpus: Vec<CpuSnapshot>,
    pub usage: Option<Vec<Option<CpuUsage>>>,
    pub aggregate: Vec<AggregateRequest>,
    pub requests: Vec<ResourceRequest>,
}

pub(crate) fn render(report: &Report) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "=== CPU States ===");
    for row in report.cpus.chunks(COLUMNS) {
        for cpu in row {
            let _ = write!(
                out,
                "{:4} [ {:>6} / {:>6} / {:4} ]",
                cpu.cpu,
                Pid::from(cpu.owner),
                Pid::from(cpu.guest),
                cpu.state
            );
        }
        out.push('\n');
    }
    let _ = writeln!(out, "Format: <cpuid> [ owner / guest / state ]");

    let waiting: Vec<_> = report.cpus.iter().filter(|c| !c.pending.is_empty()).collect();
    if !waiting.is_empty() {
        let _ = writeln!(out, "=== Cpu requests ===");
        for cpu in waiting {
            let pids: Vec<String> = cpu.pending.iter().map(|p| p.to_string()).collect();
            let _ = writeln!(out, "{:4}: {}", cpu.cpu, pids.join(" "));
        }
    }

    if !report.aggregate.is_empty() || !report.requests.is_empty() {
        let _ = writeln!(out, "=== Process requests (<pid>: <howmany>, <allowed>) ===");
        for request in &report.aggregate {
            let _ = writeln!(out, "{:>8}: {}, any", request.pid, request.howmany);
        }
        for request in &report.requests {
            let _ = writeln!(
                out,
                "{:>8}: {}, {}",
                request.pid, request.howmany, request.allowed
            );
        }
    }

    if let Some(usage) = &report.usage {
        let _ = writeln!(out, "=== CPU usage (idle / owned / guested) ===");
        for (cpu, usage) in usage.iter().enumerate() {
            if let Some(u) = usage {
                let _ = writeln!(
                    out,
                    "{:4}: {:5.1}% / {:5.1}% / {:5.1}%",
                    cpu,
                    u.idle * 100.0,
                    u.owned * 100.0,
                    u.guested * 100.0
                );
            }
        }
    }

    out
}
