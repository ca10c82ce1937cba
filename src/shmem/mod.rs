//! Cross-process shared memory plumbing.
//!
//! - [`Segment`]: named, versioned `MAP_SHARED` file mapping with an
//!   attached-process list
//! - [`SegmentLock`] / [`LockGuard`]: the segment-wide lock and its scoped guard

mod lock;
mod segment;

pub use lock::{LockGuard, SegmentLock};
pub use segment::{MAX_ATTACHED, SYNC_VERSION, Segment, SegmentSpec};
