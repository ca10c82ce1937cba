//! Shared segment lifecycle and version checks.

use corelend::shmem::{Segment, SegmentSpec};
use corelend::{Config, CpuSet, CpuTable, Error, Pid};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

fn config(dir: &Path, key: &str) -> Config {
    Config::new()
        .shm_dir(dir)
        .shm_key(key)
        .system_size(4)
        .lock_timeout(Duration::from_millis(200))
}

// ============================================================================
// Raw segments
// ============================================================================

#[test]
fn test_init_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let spec = SegmentSpec::new(dir.path(), "test", "once", 1, 64, 4);

    let mut runs = 0;
    let first = Segment::attach(&spec, |payload| {
        runs += 1;
        // SAFETY: the payload is 64 bytes and not yet shared.
        unsafe { payload.as_ptr().write(42) };
    })
    .unwrap();
    let second = Segment::attach(&spec, |_| runs += 1).unwrap();
    assert_eq!(runs, 1);

    // SAFETY: both handles map the same payload; nobody writes concurrently.
    let seen = unsafe { second.data_ptr().as_ptr().read() };
    assert_eq!(seen, 42);
    assert_eq!(first.attached_pids(), vec![Pid::current(), Pid::current()]);
}

#[test]
fn test_last_detach_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let spec = SegmentSpec::new(dir.path(), "test", "detach", 1, 64, 4);
    let path = spec.path();

    let mut a = Segment::attach(&spec, |_| {}).unwrap();
    let mut b = Segment::attach(&spec, |_| {}).unwrap();
    assert!(path.exists());

    assert!(!a.detach().unwrap());
    assert!(path.exists());
    // Detaching twice is a no-op
    assert!(!a.detach().unwrap());
    assert!(b.detach().unwrap());
    assert!(!path.exists());
}

#[test]
fn test_data_version_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let v1 = SegmentSpec::new(dir.path(), "test", "version", 1, 64, 4);
    let v2 = SegmentSpec::new(dir.path(), "test", "version", 2, 64, 4);

    let _held = Segment::attach(&v1, |_| {}).unwrap();
    let err = Segment::attach(&v2, |_| {}).unwrap_err();
    assert!(matches!(
        err,
        Error::VersionMismatch {
            expected: 2,
            found: 1
        }
    ));
}

#[test]
fn test_foreign_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let spec = SegmentSpec::new(dir.path(), "test", "foreign", 1, 64, 4)
        .timeout(Duration::from_millis(50));

    let mut file = std::fs::File::create(spec.path()).unwrap();
    file.write_all(b"definitely not a segment").unwrap();
    drop(file);

    let err = Segment::attach(&spec, |_| {}).unwrap_err();
    assert!(matches!(err, Error::InvalidSegment(_)));
}

#[test]
fn test_destroy_missing_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let spec = SegmentSpec::new(dir.path(), "test", "missing", 1, 64, 4);
    Segment::destroy(&spec).unwrap();
}

// ============================================================================
// CPU table segments
// ============================================================================

#[test]
fn test_table_state_survives_reattach() {
    let dir = tempfile::tempdir().unwrap();
    let p1 = Pid::from_raw(77);
    let keeper = CpuTable::attach(&config(dir.path(), "survive")).unwrap();

    {
        let table = CpuTable::attach(&config(dir.path(), "survive")).unwrap();
        table.register(p1, None, &CpuSet::first_n(2), false).unwrap();
        table.lend_cpu(p1, 1).unwrap();
    }

    let table = CpuTable::attach(&config(dir.path(), "survive")).unwrap();
    assert_eq!(table.owned_cpus(p1), CpuSet::first_n(2));
    assert_eq!(table.guested_cpus(p1), CpuSet::single(0));
    drop(keeper);
}

#[test]
fn test_table_recreated_after_last_detach() {
    let dir = tempfile::tempdir().unwrap();
    let p1 = Pid::from_raw(78);

    let table = CpuTable::attach(&config(dir.path(), "recreate")).unwrap();
    table.register(p1, None, &CpuSet::first_n(2), false).unwrap();
    assert!(table.detach().unwrap());

    let table = CpuTable::attach(&config(dir.path(), "recreate")).unwrap();
    assert!(table.owned_cpus(p1).is_empty());
    assert!(!table.is_registered(p1));
}

#[test]
fn test_table_destroy() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "destroy");
    let table = CpuTable::attach(&config).unwrap();
    let path = table.path().to_path_buf();
    assert!(path.exists());

    CpuTable::destroy(&config).unwrap();
    assert!(!path.exists());
    // The mapping stays usable until dropped
    assert_eq!(table.system_size(), 4);
}

#[test]
fn test_table_invalid_system_size() {
    let dir = tempfile::tempdir().unwrap();
    let err = CpuTable::attach(&config(dir.path(), "zero").system_size(0)).unwrap_err();
    assert!(matches!(err, Error::InvalidCpu(0)));

    let too_big = corelend::cpuset::MAX_CPUS + 1;
    let err = CpuTable::attach(&config(dir.path(), "huge").system_size(too_big)).unwrap_err();
    assert!(matches!(err, Error::InvalidCpu(n) if n == too_big));
    assert!(!dir.path().join("corelend_cpuinfo_zero").exists());
}
