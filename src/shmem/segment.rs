//! Named shared segment mapped by every process on the node.
//!
//! The segment is a regular file under a tmpfs directory (`/dev/shm` by
//! default) mapped `MAP_SHARED`. The first process to map it initializes
//! the payload; later processes wait for that to finish, validate the
//! header and register themselves in the attached-pid list. The last
//! process to detach removes the file.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ SegmentHeader (cache-line aligned)                           │
//! │   magic: u64 │ sync_version │ data_version                   │
//! │   initializing │ initialized │ system_size │ data_len        │
//! │   lock: SegmentLock                                          │
//! │   attached: [pid; MAX_ATTACHED]                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ payload (data_len bytes, 64-byte aligned, owned by the user) │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use corelend::shmem::{Segment, SegmentSpec};
//!
//! let spec = SegmentSpec::new("/dev/shm", "cpuinfo", "job42", 1, 4096, 8);
//! let segment = Segment::attach(&spec, |payload| {
//!     // runs once, in the creating process, before anyone else sees it
//! })?;
//! let _guard = segment.lock();
//! ```

use super::lock::{LockGuard, SegmentLock};
use crate::error::{Error, Result};
use crate::pid::Pid;
use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Magic number identifying a corelend segment ("CLND_SHM" in ASCII).
const SEGMENT_MAGIC: u64 = 0x434C_4E44_5F53_484D;

/// Version of the header and attach protocol.
pub const SYNC_VERSION: u32 = 1;

/// Maximum number of simultaneously attached handles.
pub const MAX_ATTACHED: usize = 256;

/// File name prefix for segments.
const FILE_PREFIX: &str = "corelend";

/// Header at the start of every segment.
#[repr(C, align(64))]
struct SegmentHeader {
    magic: AtomicU64,
    sync_version: AtomicU32,
    data_version: AtomicU32,
    /// Set by the process that won the right to initialize.
    initializing: AtomicU32,
    /// Set once the payload is ready.
    initialized: AtomicU32,
    system_size: AtomicU32,
    _pad: u32,
    data_len: AtomicU64,
    lock: SegmentLock,
    /// Pids holding a handle; zero means free. Only touched under `lock`.
    attached: [AtomicI32; MAX_ATTACHED],
}

impl SegmentHeader {
    /// Validate the header written by the creator.
    fn validate(&self, spec: &SegmentSpec) -> Result<()> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != SEGMENT_MAGIC {
            return Err(Error::InvalidSegment(format!(
                "invalid segment magic: expected {:x}, got {:x}",
                SEGMENT_MAGIC, magic
            )));
        }
        let sync_version = self.sync_version.load(Ordering::Acquire);
        if sync_version != SYNC_VERSION {
            return Err(Error::VersionMismatch {
                expected: SYNC_VERSION,
                found: sync_version,
            });
        }
        let data_version = self.data_version.load(Ordering::Acquire);
        if data_version != spec.data_version {
            return Err(Error::VersionMismatch {
                expected: spec.data_version,
                found: data_version,
            });
        }
        let system_size = self.system_size.load(Ordering::Acquire) as usize;
        let data_len = self.data_len.load(Ordering::Acquire) as usize;
        if system_size != spec.system_size || data_len != spec.data_len {
            return Err(Error::InvalidSegment(format!(
                "layout mismatch: segment has {} CPUs / {} bytes, expected {} CPUs / {} bytes",
                system_size, data_len, spec.system_size, spec.data_len
            )));
        }
        Ok(())
    }
}

/// Offset of the payload from the segment base.
const fn data_offset() -> usize {
    (std::mem::size_of::<SegmentHeader>() + 63) & !63
}

/// Where a segment lives and what it must contain.
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    /// Directory holding the segment file.
    pub dir: PathBuf,
    /// Subsystem name, part of the file name.
    pub module: String,
    /// User key, part of the file name.
    pub key: String,
    /// Version of the payload layout.
    pub data_version: u32,
    /// Payload size in bytes.
    pub data_len: usize,
    /// Node size the payload was laid out for.
    pub system_size: usize,
    /// How long to wait for initialization and the lock while attaching.
    pub timeout: Duration,
}

impl SegmentSpec {
    /// Describe a segment.
    pub fn new(
        dir: impl Into<PathBuf>,
        module: impl Into<String>,
        key: impl Into<String>,
        data_version: u32,
        data_len: usize,
        system_size: usize,
    ) -> Self {
        Self {
            dir: dir.into(),
            module: module.into(),
            key: key.into(),
            data_version,
            data_len,
            system_size,
            timeout: crate::config::DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Set the attach timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full path of the segment file.
    pub fn path(&self) -> PathBuf {
        self.dir
            .join(format!("{}_{}_{}", FILE_PREFIX, self.module, self.key))
    }

    /// Total mapped size.
    pub fn total_len(&self) -> usize {
        data_offset() + self.data_len
    }
}

/// A mapped, attached shared segment.
pub struct Segment {
    /// Keeps the file open for the lifetime of the mapping.
    _fd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
    path: PathBuf,
    attached_as: Pid,
    attached: bool,
}

impl Segment {
    /// Map the segment described by `spec`, creating it if needed.
    ///
    /// `init` runs exactly once per segment lifetime, in the process that
    /// creates it, with a pointer to the zero-filled payload. Other processes
    /// wait until it returns.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSegment`] if the file exists with another size or magic.
    /// - [`Error::VersionMismatch`] if it was created by an incompatible build.
    /// - [`Error::LockTimeout`] if it is not ready within `spec.timeout`.
    /// - [`Error::TooManyProcesses`] if the attached-pid list is full.
    pub fn attach<F>(spec: &SegmentSpec, init: F) -> Result<Self>
    where
        F: FnOnce(NonNull<u8>),
    {
        let path = spec.path();
        let total_len = spec.total_len();

        let fd = rustix::fs::open(
            &path,
            OFlags::RDWR | OFlags::CREATE | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o600),
        )?;

        let size = rustix::fs::fstat(&fd)?.st_size as usize;
        if size == 0 {
            rustix::fs::ftruncate(&fd, total_len as u64)?;
        } else if size != total_len {
            return Err(Error::InvalidSegment(format!(
                "{} has {} bytes, expected {}",
                path.display(),
                size,
                total_len
            )));
        }

        // SAFETY: mapping a file we just sized to `total_len`; the result is
        // checked for null and unmapped in Drop.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                total_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidSegment("mmap returned null".into()))?;

        let mut segment = Self {
            _fd: fd,
            base,
            len: total_len,
            path,
            attached_as: Pid::current(),
            attached: false,
        };

        let header = segment.header();
        if header
            .initializing
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            header.magic.store(SEGMENT_MAGIC, Ordering::Relaxed);
            header.sync_version.store(SYNC_VERSION, Ordering::Relaxed);
            header.data_version.store(spec.data_version, Ordering::Relaxed);
            header
                .system_size
                .store(spec.system_size as u32, Ordering::Relaxed);
            header
                .data_len
                .store(spec.data_len as u64, Ordering::Relaxed);
            init(segment.data_ptr());
            header.initialized.store(1, Ordering::Release);
            tracing::debug!(path = %segment.path.display(), "created shared segment");
        } else {
            segment.wait_initialized(spec.timeout)?;
        }

        header.validate(spec)?;
        segment.register(spec.timeout)?;
        Ok(segment)
    }

    fn wait_initialized(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.header().initialized.load(Ordering::Acquire) == 0 {
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout(self.path.display().to_string()));
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    fn register(&mut self, timeout: Duration) -> Result<()> {
        {
            let header = self.header();
            let Some(_guard) = header.lock.try_lock_for(timeout) else {
                return Err(Error::LockTimeout(self.path.display().to_string()));
            };

            let mut free = None;
            for slot in &header.attached {
                let pid = Pid::from_raw(slot.load(Ordering::Relaxed));
                if pid.is_nobody() {
                    free.get_or_insert(slot);
                } else if pid != self.attached_as && !pid.is_alive() {
                    tracing::warn!(
                        pid = %pid,
                        path = %self.path.display(),
                        "process attached to shared segment no longer exists; \
                         the segment may hold stale state"
                    );
                }
            }

            let slot = free.ok_or(Error::TooManyProcesses(MAX_ATTACHED))?;
            slot.store(self.attached_as.as_raw(), Ordering::Relaxed);
        }
        self.attached = true;
        Ok(())
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is at least `data_offset()` bytes, page aligned,
        // and every header field is an atomic valid for any bit pattern.
        unsafe { &*self.base.as_ptr().cast::<SegmentHeader>() }
    }

    /// Pointer to the payload.
    ///
    /// Callers must hold [`Segment::lock`] while mutating through it.
    pub fn data_ptr(&self) -> NonNull<u8> {
        // SAFETY: data_offset() is within the mapping (total_len includes it).
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(data_offset())) }
    }

    /// Take the segment-wide lock.
    pub fn lock(&self) -> LockGuard<'_> {
        self.header().lock.lock()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mapped size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for an attached segment).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pids currently attached.
    pub fn attached_pids(&self) -> Vec<Pid> {
        let _guard = self.lock();
        self.header()
            .attached
            .iter()
            .filter_map(|slot| Pid::from_raw(slot.load(Ordering::Relaxed)).get())
            .collect()
    }

    /// Remove this handle from the attached list.
    ///
    /// Returns `true` if it was the last one, in which case the file was
    /// removed. The mapping itself is released on drop.
    pub fn detach(&mut self) -> Result<bool> {
        if !self.attached {
            return Ok(false);
        }
        let last = {
            let _guard = self.lock();
            let header = self.header();
            if let Some(slot) = header
                .attached
                .iter()
                .find(|slot| slot.load(Ordering::Relaxed) == self.attached_as.as_raw())
            {
                slot.store(0, Ordering::Relaxed);
            }
            header
                .attached
                .iter()
                .all(|slot| slot.load(Ordering::Relaxed) == 0)
        };
        self.attached = false;

        if last {
            match rustix::fs::unlink(&self.path) {
                Err(e) if e != rustix::io::Errno::NOENT => return Err(e.into()),
                _ => {}
            }
            tracing::debug!(path = %self.path.display(), "removed shared segment");
        }
        Ok(last)
    }

    /// Remove a segment file regardless of who is attached.
    ///
    /// Intended for cleaning up after crashed processes.
    pub fn destroy(spec: &SegmentSpec) -> Result<()> {
        match rustix::fs::unlink(spec.path()) {
            Err(e) if e != rustix::io::Errno::NOENT => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to detach shared segment");
        }
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: Segment is Send + Sync because the header is only accessed through
// atomics and the payload is only mutated under the segment lock.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("attached", &self.attached)
            .finish()
    }
}
