//! Error types for corelend.

use crate::pid::Pid;
use thiserror::Error;

/// Result type alias using corelend's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for CPU negotiation operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller does not hold the rights needed to touch this CPU.
    #[error("permission denied: pid {pid} may not operate on CPU {cpu}")]
    Permission {
        /// Process that issued the operation.
        pid: Pid,
        /// CPU the operation targeted.
        cpu: usize,
    },

    /// A bounded request queue has no room left.
    #[error("request queue full")]
    QueueFull,

    /// The pid has no process record in the shared table.
    #[error("pid {0} is not registered")]
    NotRegistered(Pid),

    /// The process record table is full.
    #[error("too many registered processes (max {0})")]
    TooManyProcesses(usize),

    /// A CPU id or node size outside the supported range.
    #[error("invalid CPU id {0}")]
    InvalidCpu(usize),

    /// The shared segment is malformed or laid out differently.
    #[error("invalid shared segment: {0}")]
    InvalidSegment(String),

    /// Another process created the segment with a different layout version.
    #[error("shared segment version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build understands.
        expected: u32,
        /// Version stored in the segment.
        found: u32,
    },

    /// The segment never became ready, or its lock stayed held.
    #[error("timed out waiting for shared segment {0}")]
    LockTimeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether the error leaves the shared state untouched and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueueFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Permission {
            pid: Pid::from_raw(42),
            cpu: 3,
        };
        assert_eq!(
            err.to_string(),
            "permission denied: pid 42 may not operate on CPU 3"
        );

        let err = Error::VersionMismatch {
            expected: 5,
            found: 4,
        };
        assert!(err.to_string().contains("expected 5, found 4"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::QueueFull.is_retryable());
        assert!(!Error::InvalidCpu(9).is_retryable());
    }
}
