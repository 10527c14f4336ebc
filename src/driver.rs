//! Randomized stress harness shared by every scenario: a biased stream of
//! allocations and deallocations with forced frees once memory runs out.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;

use crate::engine::{AllocError, AllocatorEngine};
use crate::util::{Timer, BENCH};
use crate::viz::StateTracker;

pub struct StressReport {
    pub operations: usize,
    pub allocs: usize,
    pub deallocs: usize,
    pub elapsed: Duration,
}

impl StressReport {
    pub fn ops_per_sec(&self) -> f64 {
        if self.elapsed.is_zero() {
            0.0
        } else {
            self.operations as f64 / self.elapsed.as_secs_f64()
        }
    }
}

/// Runs `operations` random steps against the engine, capturing a snapshot
/// and logging the memory state at every tenth of the run.
///
/// Each step allocates a random size in `1..=1024` with 51% probability
/// (always, while nothing is live), otherwise frees a random live address.
/// `OutOfMemory` triggers a burst of forced frees from the most recent
/// allocations; any other engine error aborts the run.
pub fn stress_test<E: AllocatorEngine>(
    engine: &mut E,
    operations: usize,
    aligned: bool,
    tracker: &mut StateTracker,
) -> Result<StressReport> {
    let mut addresses: Vec<u64> = Vec::with_capacity(operations / 2);
    let mut rng = rand::rng();
    let mut allocs = 0;
    let mut deallocs = 0;
    let progress_every = (operations / 10).max(1);
    let timer = Timer::new();

    for i in 0..operations {
        if addresses.is_empty() || rng.random_range(0..100) < 51 {
            let size = rng.random_range(1..=1024);
            let op = Timer::new();
            let outcome = if aligned {
                engine.align_alloc(size)
            } else {
                engine.alloc(size)
            };
            match outcome {
                Ok(addr) => {
                    BENCH.lock().unwrap().record("alloc", op.elapsed());
                    addresses.push(addr);
                    allocs += 1;
                }
                Err(AllocError::OutOfMemory { .. }) => {
                    // memory is full, force some deallocations
                    while !addresses.is_empty() && rng.random_range(0..100) < 50 {
                        if let Some(addr) = addresses.pop() {
                            engine.dealloc(addr)?;
                            deallocs += 1;
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            let index = rng.random_range(0..addresses.len());
            let addr = addresses.swap_remove(index);
            let op = Timer::new();
            engine.dealloc(addr)?;
            BENCH.lock().unwrap().record("dealloc", op.elapsed());
            deallocs += 1;
        }

        if i % progress_every == 0 {
            log::info!("progress: {}%", i * 100 / operations);
            log_mem_state(engine);
            tracker.capture(engine);
        }
    }

    log_mem_state(engine);
    tracker.capture(engine);

    Ok(StressReport {
        operations,
        allocs,
        deallocs,
        elapsed: timer.elapsed(),
    })
}

pub fn log_mem_state<E: AllocatorEngine>(engine: &E) {
    log::info!(
        "memory: {} / {} ({:.1}% used), internal frag {:.3}, external frag {:.3} (trimmed {:.3})",
        engine.allocated_space(),
        engine.total_space(),
        engine.allocated_space() as f64 * 100.0 / engine.total_space() as f64,
        engine.internal_fragmentation(),
        engine.external_fragmentation(),
        engine.trimmed_external_fragmentation(),
    );
}
