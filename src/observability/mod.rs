//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! corelend exposes the following metrics, labelled with the segment key:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `corelend_cpus_lent` | Counter | CPUs lent by their owner |
//! | `corelend_cpus_reclaimed` | Counter | CPUs taken back by their owner |
//! | `corelend_cpus_acquired` | Counter | CPUs obtained through acquire |
//! | `corelend_cpus_borrowed` | Counter | CPUs obtained through borrow |
//! | `corelend_cpus_returned` | Counter | CPUs given back by their guest |
//! | `corelend_requests_queued` | Counter | Requests recorded for later |
//! | `corelend_operation_time_ns` | Histogram | Time per table operation |
//! | `corelend_pending_requests` | Gauge | CPUs asked for in the queues |
//!
//! ## Tracing
//!
//! Every table operation runs inside a `negotiate` span carrying `op` and
//! `pid`; guest changes are logged at `trace` level.
//!
//! ## Example
//!
//! ```rust,ignore
//! use corelend::observability::init_metrics;
//!
//! // Initialize metrics (call once at startup)
//! init_metrics();
//!
//! // Install any metrics exporter (prometheus, statsd, ...) to collect them
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{Operation, TableMetrics, TimerGuard, init_metrics, record_pending_requests};
pub use tracing_support::{
    instrument_operation, span_operation, span_table, trace_ownership, trace_queued,
    trace_transition,
};
