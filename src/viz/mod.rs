//! Snapshot capture and rendering of allocator state histories.

use crate::engine::{AllocatorEngine, BlockRecord};

mod bmp;
pub use bmp::*;

/// The block layout of one engine at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub total: u64,
    /// Blocks in ascending address order.
    pub blocks: Vec<BlockRecord>,
}

/// Records a sequence of snapshots for later rendering.
///
/// An explicit value owned by whoever drives the engine; it reads the engine
/// during [`capture`](Self::capture) and holds nothing but its own history.
#[derive(Debug, Default)]
pub struct StateTracker {
    history: Vec<Snapshot>,
}

impl StateTracker {
    pub fn new() -> Self {
        StateTracker {
            history: Vec::new(),
        }
    }

    /// Appends the engine's current block layout to the history.
    pub fn capture<E: AllocatorEngine>(&mut self, engine: &E) {
        self.history.push(Snapshot {
            total: engine.total_space(),
            blocks: engine.blocks(),
        });
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.history
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
