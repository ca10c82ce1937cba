//! Process identifiers as stored in the shared table.
//!
//! A [`Pid`] is a plain `i32` wrapper so it can live in `#[repr(C)]`
//! shared-memory structures. The zero value is reserved to mean "nobody":
//! a freshly zeroed segment has no owners, no guests and empty queues.
//! Public APIs expose the empty value as `Option<Pid>`.

use std::fmt;

/// A process id, or the reserved "nobody" value.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(i32);

impl Pid {
    /// The reserved empty value.
    pub const NOBODY: Pid = Pid(0);

    /// Wrap a raw pid. Zero and negative values map to [`Pid::NOBODY`].
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        if raw > 0 { Pid(raw) } else { Pid::NOBODY }
    }

    /// Id of the calling process.
    pub fn current() -> Self {
        Pid(rustix::process::getpid().as_raw_nonzero().get())
    }

    /// Raw value (`0` for nobody).
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Whether this is the empty value.
    #[inline]
    pub const fn is_nobody(self) -> bool {
        self.0 == 0
    }

    /// `None` for the empty value.
    #[inline]
    pub const fn get(self) -> Option<Pid> {
        if self.is_nobody() { None } else { Some(self) }
    }

    /// Whether a process with this id still exists.
    ///
    /// Only meaningful for pids on the local node. A process we are not
    /// allowed to signal still counts as alive.
    pub fn is_alive(self) -> bool {
        let Some(pid) = rustix::process::Pid::from_raw(self.0) else {
            return false;
        };
        match rustix::process::test_kill_process(pid) {
            Ok(()) => true,
            Err(e) => e != rustix::io::Errno::SRCH,
        }
    }
}

impl From<Option<Pid>> for Pid {
    fn from(pid: Option<Pid>) -> Self {
        pid.unwrap_or(Pid::NOBODY)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nobody() {
            f.pad("-")
        } else {
            f.pad(&self.0.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nobody() {
        assert!(Pid::from_raw(0).is_nobody());
        assert!(Pid::from_raw(-7).is_nobody());
        assert_eq!(Pid::from_raw(0).get(), None);
        assert_eq!(Pid::from_raw(12).get(), Some(Pid::from_raw(12)));
        assert_eq!(Pid::default(), Pid::NOBODY);
    }

    #[test]
    fn test_current_is_alive() {
        let me = Pid::current();
        assert!(!me.is_nobody());
        assert!(me.is_alive());
        assert!(!Pid::NOBODY.is_alive());
    }

    #[test]
    fn test_display() {
        assert_eq!(Pid::from_raw(111).to_string(), "111");
        assert_eq!(Pid::NOBODY.to_string(), "-");
    }
}
