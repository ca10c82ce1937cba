//! Two processes sharing a node.
//!
//! Simulates two registered processes on one table: the first lends half
//! its CPUs, the second picks them up, then the first reclaims them and the
//! second gives them back. The table is printed after every step.
//!
//! Run with: `cargo run --example lend_reclaim`
//!
//! Set `RUST_LOG=corelend=debug` to see every negotiation step.

use corelend::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("corelend=info")),
        )
        .init();
    corelend::observability::init_metrics();

    let dir = tempfile::tempdir()?;
    let config = Config::from_env()
        .shm_dir(dir.path())
        .shm_key("demo")
        .system_size(8);
    let table = CpuTable::attach(&config)?;
    let _span = corelend::observability::span_table(table.key()).entered();

    let alice = Pid::from_raw(1001);
    let bob = Pid::from_raw(1002);
    table.register(alice, None, &CpuSet::first_n(4), false)?;
    table.register(bob, None, &(4..8).collect(), false)?;

    println!("CPU Lending Example");
    println!("===================\n");
    println!("{}", table.print_info());

    println!("alice lends 2 CPUs");
    table.lend_cpus(alice, 2)?;

    println!("bob asks for 4 more");
    let batch = table.acquire_cpus(bob, Some(4))?;
    println!("  -> {} ({} granted)\n", batch.status, batch.gained_by(bob).count());
    println!("{}", table.print_info());

    println!("alice reclaims everything");
    let batch = table.reclaim_all(alice)?;
    for t in &batch.transitions {
        if let Some(victim) = t.victim {
            println!("  -> {} must leave CPU {}", victim, t.cpu);
        }
    }

    println!("bob returns the reclaimed CPUs");
    table.return_all(bob)?;
    table.acquire_cpus(bob, Some(0))?;
    println!("\n{}", table.print_info());

    table.detach()?;
    Ok(())
}
