//! Queues backing the CPU table.
//!
//! All queues sit on top of [`RingBuffer`] and, over inline storage, are
//! `#[repr(C)]` with an all-zero empty state so they can be placed directly
//! in the shared segment:
//!
//! - [`RingBuffer`]: circular double-ended buffer with a growth policy
//! - [`RequestQueue`]: FIFO of per-CPU-mask requests
//! - [`AggregateQueue`]: per-process "any N CPUs" counts with fair release
//! - [`PidQueue`]: FIFO of waiting pids

mod aggregate;
mod pids;
mod requests;
mod ring;

pub use aggregate::{AggregateQueue, AggregateRequest, Grants};
pub use pids::PidQueue;
pub use requests::{RequestQueue, ResourceRequest};
pub use ring::{GrowthPolicy, RingBuffer, RingStorage};
