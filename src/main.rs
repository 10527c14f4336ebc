mod driver;
mod engine;
mod util;
mod viz;

use std::path::Path;

use anyhow::Result;
use simple_logger::SimpleLogger;

use engine::{AllocatorEngine, BuddyAllocator, TlsfAllocator};
use viz::StateTracker;

const MEMORY_SIZE: u64 = 1024 * 1024;
const OPERATIONS: usize = 50_000;

fn main() -> Result<()> {
    SimpleLogger::new()
        .with_local_timestamps()
        .with_timestamp_format(time::macros::format_description!(
            "[hour]:[minute]:[second].[subsecond digits:3]Z"
        ))
        .init()?;

    log::info!("running buddy allocator scenarios");
    run_scenario("buddy", BuddyAllocator::new(MEMORY_SIZE), false, "buddy_state.bmp")?;
    run_scenario(
        "buddy aligned",
        BuddyAllocator::new(MEMORY_SIZE),
        true,
        "buddy_state_aligned.bmp",
    )?;

    log::info!("running TLSF allocator scenarios");
    run_scenario("tlsf", TlsfAllocator::new(MEMORY_SIZE), false, "tlsf_state.bmp")?;
    run_scenario(
        "tlsf aligned",
        TlsfAllocator::new(MEMORY_SIZE),
        true,
        "tlsf_state_aligned.bmp",
    )?;

    util::BENCH.lock().unwrap().summary();
    Ok(())
}

fn run_scenario<E: AllocatorEngine>(
    name: &str,
    mut engine: E,
    aligned: bool,
    image: &str,
) -> Result<()> {
    let mut tracker = StateTracker::new();
    let report = driver::stress_test(&mut engine, OPERATIONS, aligned, &mut tracker)?;
    log::info!(
        "{name}: {} ops ({} allocs, {} deallocs) in {:?}, {:.0} ops/sec",
        report.operations,
        report.allocs,
        report.deallocs,
        report.elapsed,
        report.ops_per_sec(),
    );
    viz::save_history(Path::new(image), tracker.snapshots())?;
    log::info!("{name}: wrote {image} ({} states)", tracker.snapshots().len());
    Ok(())
}
