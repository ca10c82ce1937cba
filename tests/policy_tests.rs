//! Balancing policy hooks and thread binding driven through a shared table.

use corelend::binding::BindingResolver;
use corelend::policy::{BalancePolicy, LewiMask, NoPolicy, PolicyKind};
use corelend::prelude::*;
use std::sync::Arc;

fn table(dir: &std::path::Path, key: &str) -> Arc<CpuTable> {
    let config = Config::new()
        .shm_dir(dir)
        .shm_key(key)
        .system_size(4)
        .policy(PolicyKind::LewiMask);
    Arc::new(CpuTable::attach(&config).unwrap())
}

fn set(cpus: &[usize]) -> CpuSet {
    cpus.iter().copied().collect()
}

// ============================================================================
// LewiMask
// ============================================================================

#[test]
fn test_lewi_mask_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let table = table(dir.path(), "lewi");
    let pid = Pid::from_raw(600);

    let mut policy = LewiMask::new(Arc::clone(&table), pid, set(&[0, 1]));
    assert_eq!(policy.init().unwrap(), Status::Success);
    assert_eq!(policy.active(), &set(&[0, 1]));
    assert_eq!(policy.priority().owned(), &[0, 1]);

    // Blocking on CPU 1 lends it
    assert_eq!(policy.block_on(1).unwrap(), Status::Success);
    assert_eq!(policy.active(), &set(&[0]));
    assert_eq!(table.cpu_state(1), Some(CpuState::LentIdle));

    // Coming back takes it again
    assert_eq!(policy.unblock().unwrap(), Status::Success);
    assert_eq!(policy.active(), &set(&[0, 1]));
    assert_eq!(policy.unblock().unwrap(), Status::NoUpdate);

    assert_eq!(policy.finish().unwrap(), Status::Success);
    assert!(!table.is_registered(pid));
    assert!(policy.active().is_empty());
}

#[test]
fn test_lewi_mask_guest_returns_while_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let table = table(dir.path(), "lewi-guest");
    let owner = Pid::from_raw(610);
    let guest = Pid::from_raw(611);

    let mut owner_policy = LewiMask::new(Arc::clone(&table), owner, set(&[0, 1]));
    let mut guest_policy = LewiMask::new(Arc::clone(&table), guest, set(&[2, 3]));
    owner_policy.init().unwrap();
    guest_policy.init().unwrap();

    owner_policy.block_on(1).unwrap();
    table.acquire_cpu(guest, 1).unwrap();
    guest_policy.update_resources().unwrap();
    assert_eq!(guest_policy.active(), &set(&[1, 2, 3]));

    // The guest blocks on the borrowed CPU: it goes back to the pool
    assert_eq!(guest_policy.block_on(1).unwrap(), Status::Success);
    assert_eq!(table.cpu_state(1), Some(CpuState::LentIdle));
    assert_eq!(guest_policy.active(), &set(&[2, 3]));

    // And the owner gets it back without evicting anyone
    owner_policy.unblock().unwrap();
    assert_eq!(table.guest(1), Some(owner));
}

#[test]
fn test_policy_kind_builds_variant() {
    let dir = tempfile::tempdir().unwrap();
    let table = table(dir.path(), "kind");
    let pid = Pid::from_raw(620);

    let mut none = PolicyKind::None.build(Arc::clone(&table), pid, set(&[0]));
    assert_eq!(none.name(), "none");
    assert_eq!(none.init().unwrap(), Status::NoUpdate);
    assert!(!table.is_registered(pid));

    let kind = table.config().policy;
    let mut lewi = kind.build(Arc::clone(&table), pid, set(&[0]));
    assert_eq!(lewi.name(), "lewi-mask");
    lewi.init().unwrap();
    assert!(table.is_registered(pid));
    assert_eq!(lewi.update_resources().unwrap(), Status::Success);
    lewi.finish().unwrap();

    let mut noop = NoPolicy;
    assert_eq!(noop.out_of_blocking_call().unwrap(), Status::NoUpdate);
}

// ============================================================================
// Binding
// ============================================================================

#[test]
fn test_binding_follows_negotiation() {
    let dir = tempfile::tempdir().unwrap();
    let table = table(dir.path(), "binding");
    let p1 = Pid::from_raw(630);
    let p2 = Pid::from_raw(631);
    table.register(p1, None, &set(&[0, 1]), false).unwrap();
    table.register(p2, None, &set(&[2, 3]), false).unwrap();

    let mut resolver = BindingResolver::new(Arc::clone(&table), p1);
    assert_eq!(resolver.thread_binding(0).unwrap(), Some(0));
    assert_eq!(resolver.thread_binding(1).unwrap(), Some(1));
    assert_eq!(resolver.thread_binding(2).unwrap(), None);
    assert!(!resolver.is_dirty());

    // A third CPU shows up for a third thread
    table.lend_cpu(p2, 3).unwrap();
    table.acquire_cpu(p1, 3).unwrap();
    assert_eq!(resolver.thread_binding(2).unwrap(), Some(3));
    assert!(resolver.is_dirty());
    resolver.thread_binding(0).unwrap();
    resolver.thread_binding(1).unwrap();
    assert!(!resolver.is_dirty());

    // Reclaimed and returned: the third thread loses its CPU
    table.reclaim_cpu(p2, 3).unwrap();
    table.return_cpu(p1, 3).unwrap();
    assert_eq!(resolver.thread_binding(2).unwrap(), None);
    assert_eq!(resolver.thread_binding(0).unwrap(), Some(0));
}
