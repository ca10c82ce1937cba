//! End-to-end negotiation tests over a real shared segment.
//!
//! Each test attaches to its own segment in a temporary directory and plays
//! several processes by passing different pids to the same table.

use corelend::cpuinfo::{CpuState, Topology};
use corelend::prelude::*;
use std::path::Path;

fn config(dir: &Path, key: &str, cpus: usize) -> Config {
    Config::new()
        .shm_dir(dir)
        .shm_key(key)
        .system_size(cpus)
        .request_queues(true)
}

fn set(cpus: &[usize]) -> CpuSet {
    cpus.iter().copied().collect()
}

fn pid(raw: i32) -> Pid {
    Pid::from_raw(raw)
}

/// Every CPU has at most one guest and every registered CPU one owner.
fn assert_consistent(table: &CpuTable, pids: &[Pid]) {
    let snapshot = table.snapshot();
    for pid in pids {
        let owned = table.owned_cpus(*pid);
        for cpu in owned.iter() {
            assert_eq!(snapshot[cpu].owner, Some(*pid));
        }
    }
    for cpu in &snapshot {
        if cpu.state == CpuState::Disabled {
            continue;
        }
        if let Some(guest) = cpu.guest {
            assert!(
                table.guested_cpus(guest).contains(cpu.cpu),
                "guest of CPU {} not seen by its guest",
                cpu.cpu
            );
        }
    }
}

// ============================================================================
// Scenario
// ============================================================================

/// P1 owns {0,1}, P2 owns {2,3}; CPU 3 travels P2 → P1 → P2.
#[test]
fn test_end_to_end_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "scenario", 4)).unwrap();
    let (p1, p2) = (pid(1001), pid(1002));

    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();

    let lend = table.lend_cpu(p2, 3).unwrap();
    assert_eq!(lend.status, Status::Success);
    assert_eq!(table.cpu_state(3), Some(CpuState::LentIdle));

    let acquire = table.acquire_cpu(p1, 3).unwrap();
    assert_eq!(acquire.status, Status::Success);
    assert_eq!(acquire.new_guest, Some(p1));
    assert_eq!(table.cpu_state(3), Some(CpuState::LentGuested));

    let reclaim = table.reclaim_cpu(p2, 3).unwrap();
    assert_eq!(reclaim.status, Status::Noted);
    assert_eq!(reclaim.victim, Some(p1));
    assert_eq!(table.cpu_state(3), Some(CpuState::Reclaimed));

    let ret = table.return_cpu(p1, 3).unwrap();
    assert_eq!(ret.status, Status::Success);
    assert_eq!(ret.new_guest, Some(p2));
    assert_eq!(table.cpu_state(3), Some(CpuState::OwnedIdle));
    assert_eq!(table.guest(3), Some(p2));

    assert_consistent(&table, &[p1, p2]);
}

#[test]
fn test_non_owner_cannot_lend_or_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "perm", 4)).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();

    let before = table.snapshot();
    assert!(matches!(
        table.lend_cpu(p1, 2),
        Err(Error::Permission { cpu: 2, .. })
    ));
    assert!(matches!(
        table.reclaim_cpu(p1, 3),
        Err(Error::Permission { cpu: 3, .. })
    ));
    assert!(table.lend_cpu(p1, 17).is_err());
    assert_eq!(table.snapshot(), before);

    let batch = table.lend_cpu_mask(p1, &set(&[1, 2, 3, 40])).unwrap();
    assert_eq!(batch.denied, set(&[2, 3]));
    assert_eq!(table.cpu_state(1), Some(CpuState::LentIdle));
    assert_eq!(table.cpu_state(2), Some(CpuState::OwnedIdle));
}

#[test]
fn test_register_without_steal_claims_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "steal", 4)).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();

    assert!(table.register(p2, None, &set(&[1, 2]), false).is_err());
    assert_eq!(table.owner(2), None);
    assert!(!table.is_registered(p2));

    let batch = table.register(p2, None, &set(&[1, 2]), true).unwrap();
    assert_eq!(table.owner(1), Some(p2));
    assert_eq!(table.owned_cpus(p1), set(&[0]));
    assert_eq!(batch.lost_by(p1), set(&[1]));
}

// ============================================================================
// Queued requests
// ============================================================================

#[test]
fn test_queued_acquire_served_on_lend() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "queued", 4)).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();

    let batch = table.acquire_cpus(p1, Some(2)).unwrap();
    assert_eq!(batch.status, Status::Noted);
    assert!(batch.gained_by(p1).is_empty());

    let lend = table.lend_cpu(p2, 2).unwrap();
    assert_eq!(lend.new_guest, Some(p1));
    let batch = table.lend_cpus(p2, 1).unwrap();
    assert_eq!(batch.gained_by(p1), set(&[3]));

    // The request is fully served: a further lend stays idle
    table.lend_cpu(p1, 0).unwrap();
    assert_eq!(table.cpu_state(0), Some(CpuState::LentIdle));
    assert_consistent(&table, &[p1, p2]);
}

#[test]
fn test_cancel_requests_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "cancel", 4)).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();

    table.acquire_cpus(p1, Some(2)).unwrap();
    table.acquire_cpu(p1, 3).unwrap();
    assert_eq!(table.acquire_cpus(p1, Some(0)).unwrap().status, Status::Success);
    assert_eq!(table.acquire_cpus(p1, Some(0)).unwrap().status, Status::NoUpdate);
    assert_eq!(
        table.acquire_cpu_mask(p1, &CpuSet::new()).unwrap().status,
        Status::NoUpdate
    );

    // Nobody is waiting any more
    let batch = table.lend_all(p2).unwrap();
    assert!(batch.gained_by(p1).is_empty());
    assert!(table.snapshot().iter().all(|c| c.pending.is_empty()));
}

#[test]
fn test_queues_disabled_acquire_is_noupdate() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "noqueues", 4).request_queues(false);
    let table = CpuTable::attach(&config).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();

    assert!(!table.request_queues_enabled());
    assert_eq!(table.acquire_cpu(p1, 2).unwrap().status, Status::NoUpdate);
    assert_eq!(table.acquire_cpus(p1, Some(2)).unwrap().status, Status::NoUpdate);

    table.enable_request_queues();
    assert_eq!(table.acquire_cpu(p1, 2).unwrap().status, Status::Noted);
}

#[test]
fn test_reclaim_after_return_requeues_returner() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "requeue", 4)).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();

    table.lend_cpu(p2, 3).unwrap();
    table.acquire_cpu(p1, 3).unwrap();
    table.reclaim_cpu(p2, 3).unwrap();
    table.return_cpu(p1, 3).unwrap();

    // Lending again hands it straight back to the returner
    let lend = table.lend_cpu(p2, 3).unwrap();
    assert_eq!(lend.new_guest, Some(p1));
}

// ============================================================================
// Borrow and topology
// ============================================================================

#[test]
fn test_borrow_prefers_nearby_cpus() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "nearby", 8))
        .unwrap()
        .with_topology(Topology::uniform(8, 2));
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3, 4, 5, 6, 7]), false).unwrap();
    table.lend_cpu_mask(p2, &set(&[3, 6, 7])).unwrap();

    let batch = table.borrow_cpus(p1, Some(2)).unwrap();
    // CPU 3 shares a socket with P1's CPUs and comes first
    assert_eq!(batch.gained_by(p1), set(&[3, 6]));

    let batch = table.borrow_all(p1).unwrap();
    assert_eq!(batch.gained_by(p1), set(&[7]));
    assert_eq!(table.borrow_all(p1).unwrap().status, Status::NoUpdate);

    let batch = table.return_all(p1).unwrap();
    assert_eq!(batch.status, Status::Success);
    assert!(table.guested_cpus(p1).is_subset(&set(&[0, 1])));
    assert_consistent(&table, &[p1, p2]);
}

#[test]
fn test_max_parallelism_caps_acquire() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "maxpar", 8)).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3, 4, 5, 6, 7]), false).unwrap();
    table.lend_all(p2).unwrap();

    table.update_max_parallelism(p1, 4).unwrap();
    let batch = table.acquire_cpus(p1, None).unwrap();
    assert_eq!(batch.gained_by(p1).count(), 2);
    assert_eq!(table.guested_cpus(p1).count(), 4);

    let batch = table.update_max_parallelism(p1, 2).unwrap();
    assert_eq!(batch.lost_by(p1).count(), 2);
    assert_eq!(table.guested_cpus(p1), set(&[0, 1]));

    table.update_max_parallelism(p1, 0).unwrap();
    let batch = table.acquire_cpus(p1, None).unwrap();
    assert_eq!(batch.gained_by(p1).count(), 6);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_deregister_disables_owned_cpus() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "dereg", 4)).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();
    table.lend_cpu(p2, 3).unwrap();
    table.acquire_cpu(p1, 3).unwrap();

    let batch = table.deregister(p2).unwrap();
    assert_eq!(batch.lost_by(p1), set(&[3]));
    assert_eq!(table.cpu_state(2), Some(CpuState::Disabled));
    assert!(!table.is_registered(p2));

    // A disabled CPU cannot be acquired while the cpuset is respected
    assert!(table.acquire_cpu(p1, 2).is_err());
}

#[test]
fn test_post_mortem_keeps_cpus_public() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "postmortem", 4).public_post_mortem(true);
    let table = CpuTable::attach(&config).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();

    table.deregister(p2).unwrap();
    assert_eq!(table.cpu_state(2), Some(CpuState::LentIdle));
    assert_eq!(table.owner(2), None);

    let batch = table.borrow_cpus(p1, None).unwrap();
    assert_eq!(batch.gained_by(p1), set(&[2, 3]));
}

#[test]
fn test_preinit_then_register() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "preinit", 4)).unwrap();
    let launcher = pid(500);
    let child = pid(501);

    table.preinit(launcher, &set(&[0, 1, 2]), false).unwrap();
    assert_eq!(table.owner(1), Some(launcher));

    table.register(child, Some(launcher), &set(&[0, 1, 2]), false).unwrap();
    assert_eq!(table.owned_cpus(child), set(&[0, 1, 2]));
    assert!(!table.is_registered(launcher));
}

#[test]
fn test_reset_restores_registered_mask() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "reset", 4)).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();

    table.lend_all(p1).unwrap();
    table.lend_cpu(p2, 2).unwrap();
    table.borrow_cpu(p1, 2).unwrap();
    table.borrow_cpu(p2, 1).unwrap();

    let batch = table.reset(p1).unwrap();
    assert_eq!(batch.lost_by(p2), set(&[1]));
    assert_eq!(table.guested_cpus(p1), set(&[0]));
    assert_eq!(table.cpu_state(1), Some(CpuState::Reclaimed));

    table.return_cpu(p2, 1).unwrap();
    assert_eq!(table.guested_cpus(p1), set(&[0, 1]));
    assert_consistent(&table, &[p1, p2]);
}

#[test]
fn test_check_cpu_availability_polling() {
    let dir = tempfile::tempdir().unwrap();
    let table = CpuTable::attach(&config(dir.path(), "poll", 4)).unwrap();
    let (p1, p2) = (pid(1), pid(2));
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();

    table.lend_cpu(p1, 1).unwrap();
    table.acquire_cpu(p2, 1).unwrap();
    table.reclaim_cpu(p1, 1).unwrap();

    // Owner waits, guest must leave
    assert_eq!(table.check_cpu_availability(p1, 1).unwrap(), Status::Noted);
    assert!(table.check_cpu_availability(p2, 1).is_err());
    table.return_cpu(p2, 1).unwrap();
    assert_eq!(table.check_cpu_availability(p1, 1).unwrap(), Status::Success);
}
