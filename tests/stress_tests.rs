//! Concurrent negotiation on one segment.
//!
//! Several threads, each playing a different process, hammer the same table
//! through their own handles. Afterwards every CPU must still have a single
//! consistent owner and guest.

use corelend::cpuinfo::CpuState;
use corelend::{Config, CpuSet, CpuTable, Pid, Status};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const CPUS: usize = 16;
const PROCESSES: usize = 4;
const PER_PROCESS: usize = CPUS / PROCESSES;

fn config(dir: &std::path::Path, key: &str) -> Config {
    Config::new()
        .shm_dir(dir)
        .shm_key(key)
        .system_size(CPUS)
        .request_queues(true)
}

fn owned_range(p: usize) -> CpuSet {
    (p * PER_PROCESS..(p + 1) * PER_PROCESS).collect()
}

// ============================================================================
// Lend / acquire / reclaim / return cycles
// ============================================================================

#[test]
fn test_concurrent_negotiation_keeps_table_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let setup = CpuTable::attach(&config(dir.path(), "stress")).unwrap();
    let pids: Vec<Pid> = (0..PROCESSES).map(|p| Pid::from_raw(3000 + p as i32)).collect();
    for (p, pid) in pids.iter().enumerate() {
        setup.register(*pid, None, &owned_range(p), false).unwrap();
    }

    let barrier = Arc::new(Barrier::new(PROCESSES));
    let progress = Arc::new(AtomicU64::new(0));
    let iterations = 500;

    let handles: Vec<_> = (0..PROCESSES)
        .map(|p| {
            let dir = dir.path().to_path_buf();
            let barrier = Arc::clone(&barrier);
            let progress = Arc::clone(&progress);
            let pid = pids[p];
            thread::spawn(move || {
                let table = CpuTable::attach(&config(&dir, "stress")).unwrap();
                let owned = owned_range(p);
                barrier.wait();
                for i in 0..iterations {
                    match i % 4 {
                        0 => {
                            table.lend_cpus(pid, 2).unwrap();
                        }
                        1 => {
                            let batch = table.acquire_cpus(pid, Some(2)).unwrap();
                            if batch.status.is_progress() {
                                progress.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        2 => {
                            table.reclaim_all(pid).unwrap();
                        }
                        _ => {
                            table.acquire_cpus(pid, Some(0)).unwrap();
                            let mine = table.guested_cpus(pid).difference(&owned);
                            table.return_cpu_mask(pid, &mine).unwrap();
                        }
                    }
                }
                // Leave nothing borrowed behind
                table.acquire_cpus(pid, Some(0)).unwrap();
                table.return_all(pid).unwrap();
                table.reclaim_all(pid).unwrap();
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert!(progress.load(Ordering::Relaxed) > 0);

    // Ownership never moved
    for (p, pid) in pids.iter().enumerate() {
        assert_eq!(setup.owned_cpus(*pid), owned_range(p));
    }

    // Every CPU has one guest at most; stragglers returned by other threads
    // may have been handed back to owners only
    let snapshot = setup.snapshot();
    for cpu in &snapshot {
        assert_ne!(cpu.state, CpuState::Disabled);
        if let Some(guest) = cpu.guest {
            assert!(pids.contains(&guest));
            if cpu.state == CpuState::OwnedIdle {
                assert_eq!(Some(guest), cpu.owner);
            }
        }
    }
}

#[test]
fn test_concurrent_single_cpu_contention() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(CpuTable::attach(&config(dir.path(), "contention")).unwrap());
    let owner = Pid::from_raw(4000);
    table.register(owner, None, &CpuSet::single(0), false).unwrap();
    table.lend_cpu(owner, 0).unwrap();

    let winners = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let table = Arc::clone(&table);
            let winners = Arc::clone(&winners);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let pid = Pid::from_raw(4100 + i);
                barrier.wait();
                if table.borrow_cpu(pid, 0).unwrap().status == Status::Success {
                    winners.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Exactly one borrower got it
    assert_eq!(winners.load(Ordering::Relaxed), 1);
    assert_eq!(table.cpu_state(0), Some(CpuState::LentGuested));
}
