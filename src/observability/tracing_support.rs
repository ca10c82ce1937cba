//! Tracing integration for structured logging and spans.

use super::metrics::Operation;
use crate::pid::Pid;
use tracing::{Level, Span, span};

/// Create a span covering the lifetime of an attached table.
///
/// # Example
///
/// ```rust,ignore
/// use corelend::observability::span_table;
///
/// let span = span_table("job42");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_table(key: &str) -> Span {
    span!(Level::INFO, "cpu_table", key = %key)
}

/// Create a span for one negotiation operation.
#[inline]
pub fn span_operation(op: Operation, pid: Pid) -> Span {
    span!(Level::DEBUG, "negotiate", op = op.as_str(), pid = %pid)
}

/// Instrument a negotiation operation with tracing.
///
/// This is a convenience wrapper that enters a span and returns a guard.
///
/// # Example
///
/// ```rust,ignore
/// use corelend::observability::{Operation, instrument_operation};
///
/// let _guard = instrument_operation(Operation::Lend, pid);
/// // Everything logged here carries op and pid
/// ```
pub fn instrument_operation(op: Operation, pid: Pid) -> tracing::span::EnteredSpan {
    span_operation(op, pid).entered()
}

/// Log a guest change on a CPU.
#[inline]
pub fn trace_transition(cpu: usize, new_guest: Option<Pid>, victim: Option<Pid>) {
    tracing::trace!(
        cpu = cpu,
        new_guest = %Pid::from(new_guest),
        victim = %Pid::from(victim),
        "guest changed"
    );
}

/// Log a request recorded for later.
#[inline]
pub fn trace_queued(pid: Pid, howmany: u32, queue: &'static str) {
    tracing::debug!(pid = %pid, howmany = howmany, queue = queue, "request queued");
}

/// Log an ownership change.
#[inline]
pub fn trace_ownership(pid: Pid, cpu: usize, acquired: bool) {
    if acquired {
        tracing::debug!(pid = %pid, cpu = cpu, "acquired ownership");
    } else {
        tracing::debug!(pid = %pid, cpu = cpu, "released ownership");
    }
}
