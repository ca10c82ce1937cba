//! Metrics collection using metrics-rs.

use crate::cpuinfo::BatchOutcome;
use metrics::{Counter, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const CPUS_LENT: &str = "corelend_cpus_lent";
const CPUS_RECLAIMED: &str = "corelend_cpus_reclaimed";
const CPUS_ACQUIRED: &str = "corelend_cpus_acquired";
const CPUS_BORROWED: &str = "corelend_cpus_borrowed";
const CPUS_RETURNED: &str = "corelend_cpus_returned";
const REQUESTS_QUEUED: &str = "corelend_requests_queued";
const OPERATION_TIME_NS: &str = "corelend_operation_time_ns";
const PENDING_REQUESTS: &str = "corelend_pending_requests";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(CPUS_LENT, Unit::Count, "CPUs lent by their owner");
    metrics::describe_counter!(
        CPUS_RECLAIMED,
        Unit::Count,
        "CPUs taken back by their owner"
    );
    metrics::describe_counter!(
        CPUS_ACQUIRED,
        Unit::Count,
        "CPUs obtained through acquire"
    );
    metrics::describe_counter!(CPUS_BORROWED, Unit::Count, "CPUs obtained through borrow");
    metrics::describe_counter!(
        CPUS_RETURNED,
        Unit::Count,
        "CPUs given back by their guest"
    );
    metrics::describe_counter!(
        REQUESTS_QUEUED,
        Unit::Count,
        "Requests recorded for later fulfilment"
    );
    metrics::describe_histogram!(
        OPERATION_TIME_NS,
        Unit::Nanoseconds,
        "Time spent in a table operation, lock wait included"
    );
    metrics::describe_gauge!(
        PENDING_REQUESTS,
        Unit::Count,
        "CPUs asked for in the aggregate and per-resource queues"
    );
}

/// Negotiation verb, used as a metric selector and span name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Owner lends CPUs.
    Lend,
    /// Owner takes CPUs back.
    Reclaim,
    /// Caller asks for CPUs, queueing if needed.
    Acquire,
    /// Caller takes free CPUs, never queueing.
    Borrow,
    /// Guest gives CPUs back.
    Return,
    /// Registration and other bookkeeping.
    Admin,
}

impl Operation {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Lend => "lend",
            Operation::Reclaim => "reclaim",
            Operation::Acquire => "acquire",
            Operation::Borrow => "borrow",
            Operation::Return => "return",
            Operation::Admin => "admin",
        }
    }
}

/// Record the number of pending CPUs in the queues of a segment.
#[inline]
pub fn record_pending_requests(segment: &str, pending: u64) {
    gauge!(PENDING_REQUESTS, "segment" => segment.to_string()).set(pending as f64);
}

/// Metrics collector for one attached table.
///
/// Counters are created once with the segment label so recording on the
/// hot path does not allocate.
#[derive(Clone)]
pub struct TableMetrics {
    segment: String,
    lent: Counter,
    reclaimed: Counter,
    acquired: Counter,
    borrowed: Counter,
    returned: Counter,
    queued: Counter,
    operation_time: Histogram,
}

impl TableMetrics {
    /// Create a collector labelled with `segment`.
    pub fn new(segment: &str) -> Self {
        let label = segment.to_string();
        Self {
            segment: label.clone(),
            lent: counter!(CPUS_LENT, "segment" => label.clone()),
            reclaimed: counter!(CPUS_RECLAIMED, "segment" => label.clone()),
            acquired: counter!(CPUS_ACQUIRED, "segment" => label.clone()),
            borrowed: counter!(CPUS_BORROWED, "segment" => label.clone()),
            returned: counter!(CPUS_RETURNED, "segment" => label.clone()),
            queued: counter!(REQUESTS_QUEUED, "segment" => label.clone()),
            operation_time: histogram!(OPERATION_TIME_NS, "segment" => label),
        }
    }

    /// Count `cpus` CPUs moved by `op`.
    #[inline]
    pub fn record(&self, op: Operation, cpus: u64) {
        match op {
            Operation::Lend => self.lent.increment(cpus),
            Operation::Reclaim => self.reclaimed.increment(cpus),
            Operation::Acquire => self.acquired.increment(cpus),
            Operation::Borrow => self.borrowed.increment(cpus),
            Operation::Return => self.returned.increment(cpus),
            Operation::Admin => {}
        }
    }

    /// Count the CPUs `batch` moved, plus a queued request if it was noted.
    pub fn record_batch(&self, op: Operation, batch: &BatchOutcome) {
        let moved = batch.transitions.len() as u64;
        if moved > 0 {
            self.record(op, moved);
        }
        if matches!(op, Operation::Acquire) && batch.status == crate::cpuinfo::Status::Noted {
            self.record_queued();
        }
    }

    /// Count a request recorded for later.
    #[inline]
    pub fn record_queued(&self) {
        self.queued.increment(1);
    }

    /// Record time spent in one operation.
    #[inline]
    pub fn record_time(&self, duration: Duration) {
        self.operation_time.record(duration.as_nanos() as f64);
    }

    /// Start a timer and return a guard that records on drop.
    pub fn start_timer(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            metrics: self,
        }
    }

    /// Segment label.
    pub fn segment(&self) -> &str {
        &self.segment
    }
}

impl std::fmt::Debug for TableMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableMetrics")
            .field("segment", &self.segment)
            .finish_non_exhaustive()
    }
}

/// Guard that records operation time when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    metrics: &'a TableMetrics,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record_time(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuinfo::{Outcome, Status};
    use crate::pid::Pid;

    #[test]
    fn test_init_metrics() {
        // Should not panic
        init_metrics();
        // Should be idempotent
        init_metrics();
    }

    #[test]
    fn test_table_metrics() {
        let metrics = TableMetrics::new("test-segment");
        metrics.record(Operation::Lend, 2);
        metrics.record(Operation::Admin, 1);
        metrics.record_queued();
        metrics.record_time(Duration::from_micros(5));
        assert_eq!(metrics.segment(), "test-segment");
    }

    #[test]
    fn test_record_batch() {
        let metrics = TableMetrics::new("batch");
        let mut batch = BatchOutcome::new();
        batch.record(1, Outcome::new(Status::Noted, Some(Pid::from_raw(7)), None));
        // No recorder installed: must simply not panic
        metrics.record_batch(Operation::Acquire, &batch);
    }

    #[test]
    fn test_timer_guard() {
        let metrics = TableMetrics::new("timer-test");
        {
            let _timer = metrics.start_timer();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::Borrow.as_str(), "borrow");
        assert_eq!(Operation::Admin.as_str(), "admin");
        record_pending_requests("gauge-test", 3);
    }
}
